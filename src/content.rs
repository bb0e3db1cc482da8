//! Turns the HTML of a captured response into a stored document: extract the main text,
//! check that its length is within bounds, and tokenize it.
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cdx::CdxRecord;

pub const MIN_DOC_LENGTH: usize = 500;
pub const MAX_DOC_LENGTH: usize = 1_000_000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("tokenization failed: {0}")]
    Tokenization(String),
}

/// Extracts the main content of an HTML page.
/// `Ok(None)` means the page has no usable text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<Option<String>, PipelineError>;
}

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError>;
}

/// [TextTokenizer] backed by a Hugging Face `tokenizer.json`, e.g. the one of GPT-2.
pub struct HfTokenizer {
    tokenizer: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            PipelineError::Tokenization(format!("failed to load {}: {e}", path.display()))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| PipelineError::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Accept,
    TooShort,
    TooLong,
}

/// Accepts texts whose length in characters is within `min..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthFilter {
    pub min: usize,
    pub max: usize,
}

impl Default for LengthFilter {
    fn default() -> Self {
        Self {
            min: MIN_DOC_LENGTH,
            max: MAX_DOC_LENGTH,
        }
    }
}

impl LengthFilter {
    pub fn check(&self, text: &str) -> FilterResult {
        let length = text.chars().count();
        if length < self.min {
            FilterResult::TooShort
        } else if length > self.max {
            FilterResult::TooLong
        } else {
            FilterResult::Accept
        }
    }
}

/// Why a response did not produce a document. Skips are counted, not treated as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoText,
    TooShort,
    TooLong,
    NoTokens,
}

/// The output unit, stored as one JSON line.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExtractedDocument {
    pub url: String,
    pub timestamp: String,
    pub content: String,
    pub tokens: Vec<u32>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Document(ExtractedDocument),
    Skipped(SkipReason),
}

pub struct ContentPipeline {
    extractor: Box<dyn TextExtractor>,
    tokenizer: Box<dyn TextTokenizer>,
    filter: LengthFilter,
}

impl ContentPipeline {
    pub fn new(extractor: Box<dyn TextExtractor>, tokenizer: Box<dyn TextTokenizer>) -> Self {
        Self {
            extractor,
            tokenizer,
            filter: LengthFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: LengthFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Builds the document for the response `body` of the capture described by `entry`.
    /// Extraction and tokenization errors are returned as-is; there are no retries here.
    pub fn process(&self, entry: &CdxRecord, body: &[u8]) -> Result<Processed, PipelineError> {
        let html = String::from_utf8_lossy(body);
        let Some(text) = self.extractor.extract(&html)?.filter(|text| !text.is_empty()) else {
            return Ok(Processed::Skipped(SkipReason::NoText));
        };
        match self.filter.check(&text) {
            FilterResult::Accept => {}
            FilterResult::TooShort => return Ok(Processed::Skipped(SkipReason::TooShort)),
            FilterResult::TooLong => return Ok(Processed::Skipped(SkipReason::TooLong)),
        }

        let tokens = self.tokenizer.encode(&text)?;
        if tokens.is_empty() {
            return Ok(Processed::Skipped(SkipReason::NoTokens));
        }
        tracing::debug!(
            "Extracted {} bytes of text, {} tokens from {}",
            text.len(),
            tokens.len(),
            entry.surt_url
        );
        Ok(Processed::Document(ExtractedDocument {
            url: entry.surt_url.clone(),
            timestamp: entry.timestamp.clone(),
            content: text,
            tokens,
            metadata: entry.metadata.clone(),
        }))
    }
}
