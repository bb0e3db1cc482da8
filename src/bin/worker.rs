//! The worker(s) pull(s) messages from the RabbitMQ queue and downloads the WARC files that contain the actual content of the URLs.
//! Once the content has been downloaded, the worker extracts the text from the HTML file using the trafilatura Python package.
//!
//! Extracted texts with fewer than 500 or more than 1,000,000 characters are dropped. The rest is tokenized with a
//! Hugging Face tokenizer and saved, together with the index metadata, as a JSON line to an S3 bucket (MinIO in development).
//!
//! A batch is acknowledged once all of its entries have been attempted, so a crash in the middle of a batch leads to the
//! whole batch being delivered again.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use crawl_pipeline::{
    commoncrawl::{FetchMetrics, HttpRangeFetcher, BASE_URL},
    config::{QueueArgs, StoreArgs},
    content::{ContentPipeline, HfTokenizer},
    object_store::S3Store,
    rabbitmq::RabbitConsumer,
    tracing_and_metrics::{run_metrics_server, setup_tracing},
    trafilatura::Trafilatura,
    worker::{Worker, WorkerMetrics},
};
use prometheus::Registry;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    queue: QueueArgs,

    #[command(flatten)]
    store: StoreArgs,

    /// Path of the `tokenizer.json` used to tokenize extracted texts
    #[arg(short('t'), long, env = "TOKENIZER", default_value = "tokenizer.json")]
    tokenizer: PathBuf,

    /// Where the WARC files are downloaded from
    #[arg(long, env = "DATA_URL", default_value = BASE_URL)]
    data_url: String,

    #[arg(long, env = "WORKER_METRICS_PORT", default_value_t = 9100)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() {
    let run_result = run(Args::parse()).await;
    if let Err(e) = run_result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    setup_tracing();
    let registry = Registry::new();
    let metrics = WorkerMetrics::register(&registry)?;
    let fetch_metrics = FetchMetrics::register(&registry)?;
    tokio::task::spawn(run_metrics_server(registry, args.metrics_port));

    let tokenizer = HfTokenizer::from_file(&args.tokenizer)?;
    let pipeline = ContentPipeline::new(Box::new(Trafilatura::load()?), Box::new(tokenizer));

    let client = reqwest::Client::new();
    let store = S3Store::connect(client.clone(), args.store.store_config())
        .await
        .context("Failed to set up the object store")?;
    let fetcher = HttpRangeFetcher::new(client, args.data_url).with_metrics("warc", fetch_metrics);
    let worker = Worker::new(fetcher, pipeline, store, metrics);

    let mut consumer = RabbitConsumer::connect(
        &args.queue.rabbitmq_connection_string,
        &args.queue.queue_name,
        "worker",
    )
    .await
    .context("Looks like rabbit is not available.")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(err.msg = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let summary = worker.run(&mut consumer, shutdown).await?;
    tracing::info!(
        "Stopped after {} batches: {} items saved, {} skipped, {} failed",
        summary.batches,
        summary.saved,
        summary.skipped,
        summary.failed
    );
    Ok(())
}
