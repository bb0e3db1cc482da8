//! Fakes of the pipeline's collaborators, shared by the integration tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use crawl_pipeline::{
    commoncrawl::{FetchError, RangeFetcher},
    content::{ExtractedDocument, PipelineError, TextExtractor, TextTokenizer},
    object_store::{DocumentStore, PersistenceError},
    rabbitmq::{BatchConsumer, Delivery, PublishTransport, QueueError},
};

/// Serves already unzipped bytes by path, ignoring offset and length.
/// Unknown paths fail like an HTTP 404 would.
#[derive(Default)]
pub struct FakeFetcher {
    files: HashMap<String, Vec<u8>>,
    pub requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn with(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), data.into());
        self
    }
}

#[async_trait]
impl RangeFetcher for FakeFetcher {
    async fn fetch(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, FetchError> {
        self.requests.lock().unwrap().push(path.to_string());
        self.files
            .get(path)
            .cloned()
            .ok_or(FetchError::EmptyRange { offset, length })
    }
}

/// Records every published payload. Fails the first `failures` publishes with `error`.
pub struct RecordingTransport {
    pub published: Vec<Vec<u8>>,
    pub attempts: u32,
    pub reconnects: u32,
    failures: u32,
    error: fn() -> QueueError,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::failing(0, || QueueError::Transport("unused".to_string()))
    }

    pub fn failing(failures: u32, error: fn() -> QueueError) -> Self {
        Self {
            published: Vec::new(),
            attempts: 0,
            reconnects: 0,
            failures,
            error,
        }
    }
}

#[async_trait]
impl PublishTransport for RecordingTransport {
    async fn publish_once(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        self.attempts += 1;
        if self.attempts <= self.failures {
            return Err((self.error)());
        }
        self.published.push(payload.to_vec());
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), QueueError> {
        self.reconnects += 1;
        Ok(())
    }
}

/// Hands out the queued deliveries. Once they are used up it either reports a closed
/// consumer or waits forever.
pub struct FakeConsumer {
    pub deliveries: VecDeque<Result<Delivery, QueueError>>,
    pub acked: Vec<u64>,
    pub close_when_empty: bool,
}

impl FakeConsumer {
    pub fn new(payloads: Vec<Vec<u8>>) -> Self {
        Self {
            deliveries: payloads
                .into_iter()
                .enumerate()
                .map(|(i, data)| {
                    Ok(Delivery {
                        delivery_tag: i as u64 + 1,
                        data,
                    })
                })
                .collect(),
            acked: Vec::new(),
            close_when_empty: true,
        }
    }
}

#[async_trait]
impl BatchConsumer for FakeConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, QueueError> {
        match self.deliveries.pop_front() {
            Some(delivery) => delivery.map(Some),
            None if self.close_when_empty => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
        self.acked.push(delivery_tag);
        Ok(())
    }
}

/// Treats the whole response body as the page text.
pub struct Verbatim;

impl TextExtractor for Verbatim {
    fn extract(&self, html: &str) -> Result<Option<String>, PipelineError> {
        Ok(Some(html.to_string()))
    }
}

/// One token per whitespace separated word.
pub struct Words;

impl TextTokenizer for Words {
    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError> {
        Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub documents: Mutex<Vec<ExtractedDocument>>,
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save(&self, doc: &ExtractedDocument) -> Result<String, PersistenceError> {
        let mut documents = self.documents.lock().unwrap();
        documents.push(doc.clone());
        Ok(format!("2024-07-22/{}.jsonl", documents.len()))
    }
}

/// A cdx line as found in the index, with the given status and languages.
pub fn cdx_line(n: usize, status: &str, languages: &str) -> String {
    format!(
        r#"com,example)/page/{n} 20240722120756 {{"url": "https://example.com/page/{n}", "mime": "text/html", "status": "{status}", "length": "689", "offset": "{}", "filename": "crawl-data/CC-MAIN-2024-30/segments/1720763517846.73/warc/{n}.warc.gz", "languages": "{languages}"}}"#,
        n * 1000
    )
}

/// A WARC response record wrapping `html` in an HTTP response.
pub fn warc_response(html: &str) -> Vec<u8> {
    let block = format!("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n{html}");
    format!(
        "WARC/1.0\r\n\
         WARC-Type: response\r\n\
         WARC-Record-ID: <urn:uuid:0b6f3c2e-4a1d-4f5e-9c8b-7a6d5e4f3c2b>\r\n\
         WARC-Date: 2024-07-22T12:07:56Z\r\n\
         WARC-Target-URI: https://example.com/\r\n\
         Content-Length: {}\r\n\r\n{block}\r\n\r\n",
        block.len()
    )
    .into_bytes()
}
