//! This crate consists of two binaries, called [batcher](../batcher/index.html) and [worker](../worker/index.html).
//!
//! The batcher reads the Common Crawl index, keeps English pages that were served with HTTP 200
//! and puts them on a RabbitMQ queue in batches. The worker consumes these batches, downloads
//! the WARC records, extracts and tokenizes the text and stores the result in an S3 bucket.
//!
//! The worker extracts text through the Python package trafilatura and is only built with the
//! `trafilatura` feature, so a plain `cargo build` produces the batcher alone:
//!
//! ```text
//! cargo build --release --features trafilatura
//! ```
pub mod batcher;
pub mod cdx;
pub mod commoncrawl;
pub mod config;
pub mod content;
pub mod object_store;
pub mod rabbitmq;
pub mod tracing_and_metrics;
#[cfg(feature = "trafilatura")]
pub mod trafilatura;
pub mod warc;
pub mod worker;
