//! The batching half of the pipeline.
//!
//! For every cluster.idx row the batcher fetches the referenced cdx range, keeps the captures
//! that are English and returned HTTP 200, and publishes them in batches of at most
//! `batch_size` records. Whatever is left when the index runs out is flushed once.
use prometheus::{IntCounter, Registry};
use thiserror::Error;

use crate::{
    cdx::{parse_cdx_line, CdxRecord, IndexError, IndexRow},
    commoncrawl::RangeFetcher,
    rabbitmq::{PublishTransport, QueueChannel, QueueError},
    tracing_and_metrics::register_counter,
};

pub const BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct BatcherMetrics {
    pub batches_sent: IntCounter,
    pub documents_seen: IntCounter,
    pub documents_filtered: IntCounter,
    pub documents_sent: IntCounter,
    pub chunk_errors: IntCounter,
}

impl BatcherMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            batches_sent: register_counter(
                registry,
                "batcher_batches_sent",
                "Number of published batches",
            )?,
            documents_seen: register_counter(
                registry,
                "batcher_documents_total",
                "Total number of documents seen by the batcher",
            )?,
            documents_filtered: register_counter(
                registry,
                "batcher_documents_filtered",
                "Number of documents that passed the language and status filter",
            )?,
            documents_sent: register_counter(
                registry,
                "batcher_documents_sent",
                "Number of documents sent by the batcher",
            )?,
            chunk_errors: register_counter(
                registry,
                "batcher_chunk_errors",
                "Number of index rows skipped because their cdx range could not be fetched or decoded",
            )?,
        })
    }
}

/// Totals of one [Batcher::run].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatcherReport {
    pub rows: u64,
    pub batches_sent: u64,
    pub documents_seen: u64,
    pub documents_sent: u64,
    pub chunk_errors: u64,
}

pub struct Batcher {
    batch_size: usize,
    max_rows: Option<u64>,
    metrics: BatcherMetrics,
}

impl Batcher {
    pub fn new(batch_size: usize, metrics: BatcherMetrics) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_rows: None,
            metrics,
        }
    }

    /// Stop after `max_rows` index rows instead of reading the whole index.
    pub fn with_max_rows(mut self, max_rows: Option<u64>) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn metrics(&self) -> &BatcherMetrics {
        &self.metrics
    }

    /// Reads `index` to the end (or to the row limit), publishing every full batch as soon as it
    /// is complete and the final partial batch once afterwards.
    ///
    /// A row whose cdx range cannot be fetched or decoded is logged and skipped. Index errors and
    /// publish failures end the run.
    pub async fn run<I, F, T>(
        &self,
        index: I,
        fetcher: &F,
        queue: &mut QueueChannel<T>,
    ) -> Result<BatcherReport, BatcherError>
    where
        I: IntoIterator<Item = Result<IndexRow, IndexError>>,
        F: RangeFetcher + ?Sized,
        T: PublishTransport,
    {
        let mut report = BatcherReport::default();
        let mut batch: Vec<CdxRecord> = Vec::with_capacity(self.batch_size);

        for row in index {
            if self.max_rows.is_some_and(|max| report.rows >= max) {
                tracing::info!("Reached the limit of {} index rows", report.rows);
                break;
            }
            let row = row?;
            report.rows += 1;

            let Some(text) = self.fetch_chunk(fetcher, &row).await else {
                report.chunk_errors += 1;
                continue;
            };

            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                self.metrics.documents_seen.inc();
                report.documents_seen += 1;

                let record = match parse_cdx_line(line) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(err.msg = %e, "Skipping malformed line in {}", row.shard_file);
                        continue;
                    }
                };
                if !record.is_accepted() {
                    continue;
                }
                self.metrics.documents_filtered.inc();
                batch.push(record);

                if batch.len() >= self.batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                    self.publish(queue, &full, &mut report).await?;
                }
            }
        }

        if !batch.is_empty() {
            self.publish(queue, &batch, &mut report).await?;
            tracing::info!("Final batch sent, {} documents in total", report.documents_sent);
        }
        Ok(report)
    }

    async fn fetch_chunk<F>(&self, fetcher: &F, row: &IndexRow) -> Option<String>
    where
        F: RangeFetcher + ?Sized,
    {
        let bytes = match fetcher
            .fetch(&row.shard_file, row.range_offset, row.range_length)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(err.msg = %e, err.details = ?e, "Failed to fetch cdx range for {}", row.surt_prefix);
                self.metrics.chunk_errors.inc();
                return None;
            }
        };
        match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(err.msg = %e, "cdx range for {} is not valid UTF-8", row.surt_prefix);
                self.metrics.chunk_errors.inc();
                None
            }
        }
    }

    async fn publish<T: PublishTransport>(
        &self,
        queue: &mut QueueChannel<T>,
        batch: &[CdxRecord],
        report: &mut BatcherReport,
    ) -> Result<(), QueueError> {
        tracing::debug!("Pushing batch of size {}", batch.len());
        queue.publish_batch(batch).await?;
        self.metrics.batches_sent.inc();
        self.metrics.documents_sent.inc_by(batch.len() as u64);
        report.batches_sent += 1;
        report.documents_sent += batch.len() as u64;
        Ok(())
    }
}
