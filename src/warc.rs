//! Response records of unzipped Common Crawl WARC ranges, read with the `warc` crate.
//!
//! A range usually holds exactly one record:
//!
//! ```text
//! WARC/1.0
//! WARC-Type: response
//! WARC-Record-ID: <urn:uuid:...>
//! WARC-Date: 2024-07-22T12:07:56Z
//! WARC-Target-URI: http://example.com/
//! Content-Length: 1234
//!
//! HTTP/1.1 200 OK
//! ...
//! ```
use thiserror::Error;
use warc::{BufferedBody, Record, RecordIter, WarcHeader, WarcReader};

pub use warc::RecordType;

#[derive(Debug, Error)]
pub enum WarcError {
    #[error("data does not start with a WARC version line")]
    MissingVersion,

    #[error(transparent)]
    Record(#[from] warc::Error),
}

/// A captured HTTP response taken from a WARC range.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub record_type: RecordType,
    pub target_uri: Option<String>,
    /// The HTTP entity body, without status line and headers.
    pub content: Vec<u8>,
}

impl From<Record<BufferedBody>> for ArchiveRecord {
    fn from(record: Record<BufferedBody>) -> Self {
        Self {
            record_type: record.warc_type().clone(),
            target_uri: record.header(WarcHeader::TargetURI).map(|uri| uri.into_owned()),
            content: http_payload(record.body()).to_vec(),
        }
    }
}

/// The bytes following the blank line that ends the HTTP status line and headers.
/// Empty if there is no such line.
pub fn http_payload(block: &[u8]) -> &[u8] {
    if let Some(end) = block.windows(4).position(|w| w == b"\r\n\r\n") {
        return &block[end + 4..];
    }
    if let Some(end) = block.windows(2).position(|w| w == b"\n\n") {
        return &block[end + 2..];
    }
    &[]
}

/// Yields the `response` records of a WARC buffer, skipping every other record type.
///
/// Create a new iterator to go over the same buffer again. The iteration ends after the
/// first [WarcError].
pub struct ArchiveRecordIterator<'a> {
    records: Option<RecordIter<&'a [u8]>>,
    pending: Option<WarcError>,
}

impl<'a> ArchiveRecordIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        // the reader treats input without a blank line as the end of the stream
        if !data.is_empty() && !data.starts_with(b"WARC/") {
            return Self {
                records: None,
                pending: Some(WarcError::MissingVersion),
            };
        }
        Self {
            records: Some(WarcReader::new(data).iter_records()),
            pending: None,
        }
    }
}

impl Iterator for ArchiveRecordIterator<'_> {
    type Item = Result<ArchiveRecord, WarcError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            return Some(Err(e));
        }
        let records = self.records.as_mut()?;
        loop {
            match records.next() {
                None => {
                    self.records = None;
                    return None;
                }
                Some(Err(e)) => {
                    self.records = None;
                    return Some(Err(e.into()));
                }
                Some(Ok(record)) if *record.warc_type() == RecordType::Response => {
                    return Some(Ok(record.into()));
                }
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(warc_type: &str, block: &str) -> String {
        format!(
            "WARC/1.0\r\n\
             WARC-Type: {warc_type}\r\n\
             WARC-Record-ID: <urn:uuid:7f4e1c2a-7d55-4c3b-9d0e-1b2c3d4e5f60>\r\n\
             WARC-Date: 2024-07-22T12:07:56Z\r\n\
             WARC-Target-URI: http://example.com/\r\n\
             Content-Length: {}\r\n\r\n{block}\r\n\r\n",
            block.len()
        )
    }

    #[test]
    fn only_responses_are_yielded() {
        let data = [
            record("request", "GET / HTTP/1.1\r\n\r\n"),
            record("response", "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<p>body</p>"),
            record("metadata", "fetchTimeMs: 12"),
        ]
        .concat();
        let responses: Vec<_> = ArchiveRecordIterator::new(data.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].record_type, RecordType::Response);
        assert_eq!(responses[0].content, b"<p>body</p>");
        assert_eq!(responses[0].target_uri.as_deref(), Some("http://example.com/"));
    }

    #[test]
    fn consecutive_responses_are_all_yielded() {
        let data = [
            record("response", "HTTP/1.1 200 OK\r\n\r\nfirst"),
            record("response", "HTTP/1.1 200 OK\r\n\r\nsecond\n"),
        ]
        .concat();
        let contents: Vec<_> = ArchiveRecordIterator::new(data.as_bytes())
            .map(|record| record.unwrap().content)
            .collect();
        assert_eq!(contents, vec![b"first".to_vec(), b"second\n".to_vec()]);
    }

    #[test]
    fn empty_input_has_no_records() {
        assert!(ArchiveRecordIterator::new(b"").next().is_none());
    }

    #[test]
    fn garbage_is_an_error_and_ends_iteration() {
        let mut records = ArchiveRecordIterator::new(b"<html>not a warc file</html>\n");
        assert!(matches!(records.next(), Some(Err(WarcError::MissingVersion))));
        assert!(records.next().is_none());
    }

    #[test]
    fn truncated_block_is_an_error() {
        let data = "WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 100\r\n\r\nshort";
        let mut records = ArchiveRecordIterator::new(data.as_bytes());
        assert!(matches!(
            records.next(),
            Some(Err(WarcError::Record(warc::Error::UnexpectedEOB)))
        ));
        assert!(records.next().is_none());
    }

    #[test]
    fn record_without_id_is_an_error() {
        let data = "WARC/1.0\r\nWARC-Type: response\r\nWARC-Date: 2024-07-22T12:07:56Z\r\nContent-Length: 0\r\n\r\n\r\n\r\n";
        assert!(matches!(
            ArchiveRecordIterator::new(data.as_bytes()).next(),
            Some(Err(WarcError::Record(warc::Error::MissingHeader(
                WarcHeader::RecordID
            ))))
        ));
    }

    #[test]
    fn payload_falls_back_to_bare_newlines() {
        assert_eq!(http_payload(b"HTTP/1.1 200 OK\r\nA: b\r\n\r\nbody"), b"body");
        assert_eq!(http_payload(b"HTTP/1.1 200 OK\nA: b\n\nbody"), b"body");
        assert!(http_payload(b"HTTP/1.1 200 OK").is_empty());
    }
}
