//! The consuming half of the pipeline.
//!
//! A worker takes one batch at a time off the queue. For every item it downloads the WARC range
//! the item points at, runs every `response` record through the [ContentPipeline] and saves the
//! resulting documents. Items fail independently of each other; the batch is acknowledged once
//! all of its items have been attempted.
use std::future::Future;

use prometheus::{IntCounter, Registry};
use thiserror::Error;

use crate::{
    cdx::{CdxRecord, DecodeError},
    commoncrawl::{FetchError, RangeFetcher},
    content::{ContentPipeline, PipelineError, Processed, SkipReason},
    object_store::{DocumentStore, PersistenceError},
    rabbitmq::{decode_batch, BatchConsumer, Delivery, QueueError},
    tracing_and_metrics::register_counter,
    warc::ArchiveRecordIterator,
};

#[derive(Clone)]
pub struct WorkerMetrics {
    pub batches: IntCounter,
    pub docs_received: IntCounter,
    pub docs_processed: IntCounter,
    pub docs_filtered: IntCounter,
    pub bytes_downloaded: IntCounter,
    pub items_failed: IntCounter,
    pub warc_records_parsed: IntCounter,
    pub queue_errors: IntCounter,
}

impl WorkerMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            batches: register_counter(registry, "worker_batches", "Number of consumed batches")?,
            docs_received: register_counter(
                registry,
                "worker_docs_received",
                "Number of documents received by the worker",
            )?,
            docs_processed: register_counter(
                registry,
                "worker_docs_processed",
                "Number of documents extracted, tokenized and saved",
            )?,
            docs_filtered: register_counter(
                registry,
                "worker_docs_filtered",
                "Number of responses without usable text or outside the length limits",
            )?,
            bytes_downloaded: register_counter(
                registry,
                "worker_bytes_downloaded_total",
                "Compressed bytes downloaded from WARC files",
            )?,
            items_failed: register_counter(
                registry,
                "worker_items_failed",
                "Number of batch items that could not be processed",
            )?,
            warc_records_parsed: register_counter(
                registry,
                "worker_warc_records_parsed",
                "Number of WARC response records parsed",
            )?,
            queue_errors: register_counter(
                registry,
                "worker_queue_errors",
                "Number of errors received from the queue consumer",
            )?,
        })
    }
}

/// Everything that can go wrong with a single batch item.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// What became of one batch item.
#[derive(Debug)]
pub enum ItemOutcome {
    /// At least one document was stored under the given keys.
    Saved(Vec<String>),
    /// Nothing was stored; one reason per response record, empty if there was no response.
    Skipped(Vec<SkipReason>),
    Failed(ItemError),
}

/// Counts for one batch, or summed over many.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub batches: u64,
    pub items: u64,
    pub saved: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl BatchSummary {
    fn add(&mut self, other: BatchSummary) {
        self.batches += other.batches;
        self.items += other.items;
        self.saved += other.saved;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct Worker<F, S> {
    fetcher: F,
    pipeline: ContentPipeline,
    store: S,
    metrics: WorkerMetrics,
}

impl<F: RangeFetcher, S: DocumentStore> Worker<F, S> {
    pub fn new(fetcher: F, pipeline: ContentPipeline, store: S, metrics: WorkerMetrics) -> Self {
        Self {
            fetcher,
            pipeline,
            store,
            metrics,
        }
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Processes a single item. Never fails; errors end up in [ItemOutcome::Failed].
    pub async fn process_item(&self, entry: &CdxRecord) -> ItemOutcome {
        self.metrics.docs_received.inc();
        match self.try_process_item(entry).await {
            Ok((keys, _)) if !keys.is_empty() => ItemOutcome::Saved(keys),
            Ok((_, skipped)) => ItemOutcome::Skipped(skipped),
            Err(e) => {
                tracing::warn!(err.msg = %e, err.details = ?e, "Failed to process {}", entry.surt_url);
                self.metrics.items_failed.inc();
                ItemOutcome::Failed(e)
            }
        }
    }

    async fn try_process_item(
        &self,
        entry: &CdxRecord,
    ) -> Result<(Vec<String>, Vec<SkipReason>), ItemError> {
        let location = entry.location()?;
        let data = self
            .fetcher
            .fetch(&location.filename, location.offset, location.length)
            .await?;
        self.metrics.bytes_downloaded.inc_by(location.length);

        let mut keys = Vec::new();
        let mut skipped = Vec::new();
        for record in ArchiveRecordIterator::new(&data) {
            let record = record.map_err(DecodeError::from)?;
            self.metrics.warc_records_parsed.inc();
            match self.pipeline.process(entry, &record.content)? {
                Processed::Document(doc) => {
                    keys.push(self.store.save(&doc).await?);
                    self.metrics.docs_processed.inc();
                }
                Processed::Skipped(reason) => {
                    tracing::debug!("Skipping {} ({:?})", entry.surt_url, reason);
                    self.metrics.docs_filtered.inc();
                    skipped.push(reason);
                }
            }
        }
        Ok((keys, skipped))
    }

    /// Attempts every item of `batch`, in order.
    pub async fn process_batch(&self, batch: &[CdxRecord]) -> BatchSummary {
        let mut summary = BatchSummary {
            batches: 1,
            ..Default::default()
        };
        for entry in batch {
            summary.items += 1;
            match self.process_item(entry).await {
                ItemOutcome::Saved(_) => summary.saved += 1,
                ItemOutcome::Skipped(_) => summary.skipped += 1,
                ItemOutcome::Failed(_) => summary.failed += 1,
            }
        }
        self.metrics.batches.inc();
        summary
    }

    /// Decodes and processes one delivery. A payload that is not a batch is logged and dropped.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> BatchSummary {
        match decode_batch(&delivery.data) {
            Ok(batch) => {
                tracing::info!("Received a batch of {} entries", batch.len());
                self.process_batch(&batch).await
            }
            Err(e) => {
                tracing::warn!(err.msg = %e, "Discarding message {} that is not a batch", delivery.delivery_tag);
                self.metrics.queue_errors.inc();
                BatchSummary::default()
            }
        }
    }

    /// Consumes batches until `shutdown` completes or the queue fails.
    ///
    /// Each delivery is acknowledged after all of its items have been attempted. A shutdown
    /// request is honoured while waiting for a delivery, never in the middle of a batch.
    pub async fn run<C, Sd>(&self, consumer: &mut C, shutdown: Sd) -> Result<BatchSummary, QueueError>
    where
        C: BatchConsumer + ?Sized,
        Sd: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut total = BatchSummary::default();
        loop {
            let next = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down after {} batches", total.batches);
                    return Ok(total);
                }
                next = consumer.next_delivery() => next,
            };
            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    return Err(QueueError::Transport(
                        "the queue consumer was closed".to_string(),
                    ))
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(err.msg = %e, err.details = ?e, "Failed to receive message from RabbitMQ");
                    self.metrics.queue_errors.inc();
                    continue;
                }
            };

            let summary = self.handle_delivery(&delivery).await;
            consumer.ack(delivery.delivery_tag).await?;
            total.add(summary);
            tracing::info!(
                "Batch done: {} saved, {} skipped, {} failed. Totals: {} batches, {} documents received, {} processed, {} bytes downloaded",
                summary.saved,
                summary.skipped,
                summary.failed,
                self.metrics.batches.get(),
                self.metrics.docs_received.get(),
                self.metrics.docs_processed.get(),
                self.metrics.bytes_downloaded.get(),
            );
        }
    }
}
