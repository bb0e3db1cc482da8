//! The batcher only operates on index files that contain metadata about the URLs that are part of the crawl.
//! It does not have to download the actual content of the URLs and therefore it does not have to deal with WARC files.
//!
//! For a given crawl, there are hundreds of index files, each containing roughly a gigabyte of URL metadata.
//! Every line in the index file contains the following information. Notice that I have split the line into multiple lines for readability:
//!
//! ```json
//! 0,100,22,165)/
//! 20240722120756
//! {
//!     "url": "http://165.22.100.0/",
//!     "mime": "text/html",
//!     "status": "200",
//!     "languages": "eng",
//!     "length": "689",
//!     "offset": "3499",
//!     "filename": "crawl-data/CC-MAIN-2024-30/segments/1720763517846.73/warc/CC-MAIN-20240722095039-20240722125039-00443.warc.gz"
//! }
//! ```
//!
//! The cluster.idx file tells the batcher which byte ranges of which index file to fetch. If no local copy
//! is given with `--index`, it is downloaded into the output folder first.
//!
//! The batcher keeps the URLs that are in English and returned a 200 HTTP status code, batches them into
//! groups whose size has a constant upper limit and pushes these batches into a RabbitMQ queue.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use crawl_pipeline::{
    batcher::{Batcher, BatcherMetrics, BATCH_SIZE},
    cdx::ClusterIndexReader,
    commoncrawl::{
        crawl_index_base, download_cluster_index, FetchMetrics, HttpRangeFetcher,
        DEFAULT_CRAWL_VERSION,
    },
    config::QueueArgs,
    rabbitmq::{QueueChannel, RabbitTransport},
    tracing_and_metrics::{run_metrics_server, setup_tracing},
};
use prometheus::Registry;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    queue: QueueArgs,

    /// The crawl to use; a given index file has to belong to the same crawl
    #[arg(short('d'), long, env = "CRAWL_VERSION", default_value = DEFAULT_CRAWL_VERSION)]
    crawl_version: String,

    /// Where the cluster.idx file is downloaded to
    #[arg(short('o'), long, env = "OUTPUT_FOLDER", default_value = "output")]
    output_folder: PathBuf,

    /// A previously downloaded cluster.idx file. Skips the download.
    #[arg(short('i'), long, env = "CLUSTER_INDEX")]
    index: Option<PathBuf>,

    #[arg(long, env = "BATCH_SIZE", default_value_t = BATCH_SIZE as u64,
    value_parser = clap::value_parser!(u64).range(1..))]
    batch_size: u64,

    /// Only process this many rows of the cluster.idx file.
    /// Otherwise, all entries in the file are processed.
    #[arg(short('c'), long, env = "CHUNKS", value_parser = clap::value_parser!(u64).range(1..))]
    chunks: Option<u64>,

    #[arg(long, env = "BATCHER_METRICS_PORT", default_value_t = 9101)]
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
    let metrics = BatcherMetrics::register(&registry)?;
    let fetch_metrics = FetchMetrics::register(&registry)?;
    tokio::task::spawn(run_metrics_server(registry, args.metrics_port));

    let client = reqwest::Client::new();
    let index_file = match args.index {
        Some(index) => index,
        None => download_cluster_index(&client, &args.crawl_version, &args.output_folder).await?,
    };
    let index = ClusterIndexReader::open(&index_file)
        .with_context(|| format!("Failed to read idx file from {}", index_file.display()))?;

    let transport = RabbitTransport::connect(
        &args.queue.rabbitmq_connection_string,
        &args.queue.queue_name,
    )
    .await
    .context("Looks like rabbit is not available.")?;
    let mut queue = QueueChannel::new(transport);

    let fetcher = HttpRangeFetcher::new(client, crawl_index_base(&args.crawl_version))
        .with_metrics("cdx", fetch_metrics);
    let batcher = Batcher::new(args.batch_size as usize, metrics).with_max_rows(args.chunks);
    let report = batcher.run(index, &fetcher, &mut queue).await?;

    tracing::info!(
        "Processed {} index rows: {} documents seen, {} sent in {} batches, {} rows skipped",
        report.rows,
        report.documents_seen,
        report.documents_sent,
        report.batches_sent,
        report.chunk_errors
    );
    Ok(())
}
