//! This module contains the data structures of the two Common Crawl index levels and the code to parse them.
//!
//! The `cluster.idx` file is the top level. Every row points at a gzip-compressed range
//! inside one of the `cdx-NNNNN.gz` shards:
//!
//! ```text
//! 0,100,22,165)/ 20240722120756<TAB>cdx-00000.gz<TAB>0<TAB>188224<TAB>1
//! ```
//!
//! Once such a range has been fetched and unzipped, it contains one line per captured URL:
//! the SURT url, the capture timestamp and a JSON object with the capture metadata.
use std::{
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_aux::prelude::deserialize_number_from_string;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::warc::WarcError;

/// HTTP status a capture must have to be passed on to the workers.
pub const ACCEPTED_STATUS: &str = "200";
/// Language code a capture must be tagged with to be passed on to the workers.
pub const ACCEPTED_LANGUAGE: &str = "eng";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read index file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed index row {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
}

/// Per-item decoding failures. These never abort more than the item they belong to.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed cdx line: {0}")]
    CdxLine(String),

    #[error("malformed cdx metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("malformed WARC data: {0}")]
    Warc(#[from] WarcError),
}

/// One row of a cluster.idx file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    /// SURT url and timestamp of the first entry in the referenced range.
    pub surt_prefix: String,
    pub shard_file: String,
    pub range_offset: u64,
    pub range_length: u64,
    pub row_seq: Option<u64>,
}

/// De-serializes a tab separated cluster.idx line into an [IndexRow].
/// Returns `Ok(None)` for blank lines.
pub fn parse_cluster_idx(line: &str, line_number: usize) -> Result<Option<IndexRow>, IndexError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let malformed = |reason: String| IndexError::MalformedRow {
        line: line_number,
        reason,
    };

    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(malformed(format!(
            "expected at least 4 tab separated fields, found {}",
            fields.len()
        )));
    }
    let range_offset = fields[2]
        .parse::<u64>()
        .map_err(|e| malformed(format!("invalid offset {:?}: {e}", fields[2])))?;
    let range_length = fields[3]
        .parse::<u64>()
        .map_err(|e| malformed(format!("invalid length {:?}: {e}", fields[3])))?;

    Ok(Some(IndexRow {
        surt_prefix: fields[0].to_string(),
        shard_file: fields[1].to_string(),
        range_offset,
        range_length,
        row_seq: fields.get(4).and_then(|seq| seq.parse().ok()),
    }))
}

/// Lazily reads [IndexRow]s from a local cluster.idx file.
///
/// The reader is single pass. Open the file again to iterate a second time.
/// The first malformed row ends the iteration with an error.
pub struct ClusterIndexReader<R> {
    lines: Lines<R>,
    line_number: usize,
    failed: bool,
}

impl ClusterIndexReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> ClusterIndexReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            failed: false,
        }
    }
}

impl<R: BufRead> Iterator for ClusterIndexReader<R> {
    type Item = Result<IndexRow, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e.into()));
                }
            };
            self.line_number += 1;
            match parse_cluster_idx(&line, self.line_number) {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Represents a line in a cdx index file.
/// This is also the unit that travels through the queue, a batch being a JSON array of these.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CdxRecord {
    pub surt_url: String,
    pub timestamp: String,
    pub metadata: Map<String, Value>,
}

/// Where the WARC record of a capture lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordLocation {
    pub filename: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub offset: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub length: u64,
}

impl CdxRecord {
    pub fn status(&self) -> Option<&str> {
        self.metadata.get("status").and_then(Value::as_str)
    }

    /// Language codes of the capture. The index stores them as a comma separated
    /// string, but a JSON array is understood as well.
    pub fn languages(&self) -> Vec<&str> {
        match self.metadata.get("languages") {
            Some(Value::String(languages)) => languages.split(',').map(str::trim).collect(),
            Some(Value::Array(languages)) => languages.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the capture is an English page that was served successfully.
    /// Both checks are exact; status codes and language tags are not normalised.
    pub fn is_accepted(&self) -> bool {
        self.status() == Some(ACCEPTED_STATUS) && self.languages().contains(&ACCEPTED_LANGUAGE)
    }

    pub fn location(&self) -> Result<RecordLocation, DecodeError> {
        Ok(serde_json::from_value(Value::Object(self.metadata.clone()))?)
    }
}

/// Deserialize an index file line into a [CdxRecord].
pub fn parse_cdx_line(line: &str) -> Result<CdxRecord, DecodeError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(surt_url), Some(timestamp), Some(metadata)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(DecodeError::CdxLine(line.chars().take(200).collect()));
    };
    Ok(CdxRecord {
        surt_url: surt_url.to_string(),
        timestamp: timestamp.to_string(),
        metadata: serde_json::from_str(metadata)?,
    })
}
