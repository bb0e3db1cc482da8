//! This module contains the HTTP side of talking to Common Crawl: byte range downloads of
//! gzip-framed shard data and the download of the top level cluster.idx file.
use std::{
    io::Read,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use prometheus::{IntCounterVec, Opts, Registry};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const BASE_URL: &str = "https://data.commoncrawl.org";
pub const DEFAULT_CRAWL_VERSION: &str = "CC-MAIN-2024-30";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fetching {url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to unzip range of {url}: {source}")]
    Decompress {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid byte range: offset {offset}, length {length}")]
    EmptyRange { offset: u64, length: u64 },

    #[error("byte range ends past u64::MAX: offset {offset}, length {length}")]
    RangeOverflow { offset: u64, length: u64 },
}

/// Fetches a byte range of a remote file and returns the unzipped bytes.
///
/// Implementations do not retry; whether a failed fetch is worth repeating is up to the caller.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, FetchError>;
}

/// Path of the index files of a crawl, relative to [BASE_URL].
pub fn crawl_path(crawl_version: &str) -> String {
    format!("cc-index/collections/{crawl_version}/indexes")
}

/// Base location the batcher resolves `cdx-NNNNN.gz` names against.
pub fn crawl_index_base(crawl_version: &str) -> String {
    format!("{BASE_URL}/{}", crawl_path(crawl_version))
}

/// The value of an HTTP `Range` header covering `length` bytes starting at `offset`.
pub fn range_header(offset: u64, length: u64) -> Result<String, FetchError> {
    if length == 0 {
        return Err(FetchError::EmptyRange { offset, length });
    }
    let last = offset
        .checked_add(length - 1)
        .ok_or(FetchError::RangeOverflow { offset, length })?;
    Ok(format!("bytes={offset}-{last}"))
}

/// Unzips a buffer holding one or more concatenated gzip members.
/// Does not interpret the output as UTF-8 because WARC data is plain bytes.
pub fn gunzip(body: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = flate2::read::MultiGzDecoder::new(body);
    let mut buffer = Vec::new();
    decoder.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Range requests by outcome (`ok`, `error`), labelled with the name of the fetcher.
#[derive(Clone)]
pub struct FetchMetrics {
    requests: IntCounterVec,
}

impl FetchMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new("range_fetch_requests_total", "Number of byte range requests"),
            &["fetcher", "result"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        Ok(Self { requests })
    }

    pub fn requests(&self, fetcher: &str, result: &str) -> u64 {
        self.requests.with_label_values(&[fetcher, result]).get()
    }
}

/// [RangeFetcher] that issues `GET {base_url}/{path}` requests with a `Range` header.
#[derive(Clone)]
pub struct HttpRangeFetcher {
    client: reqwest::Client,
    base_url: String,
    name: String,
    metrics: Option<FetchMetrics>,
}

impl HttpRangeFetcher {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: "default".to_string(),
            metrics: None,
        }
    }

    /// Counts every request in `metrics` under the label `name`.
    pub fn with_metrics(mut self, name: &str, metrics: FetchMetrics) -> Self {
        self.name = name.to_string();
        self.metrics = Some(metrics);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn download_and_unzip(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let range = range_header(offset, length)?;
        let res = self
            .client
            .get(&url)
            .header(reqwest::header::RANGE, &range)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;
        if !res.status().is_success() {
            return Err(FetchError::Status {
                url,
                status: res.status(),
            });
        }
        let body = res.bytes().await.map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
        tracing::debug!("Fetched {} bytes of {} ({})", body.len(), url, range);
        gunzip(&body).map_err(|source| FetchError::Decompress { url, source })
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, FetchError> {
        let result = self.download_and_unzip(path, offset, length).await;
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics
                .requests
                .with_label_values(&[self.name.as_str(), outcome])
                .inc();
        }
        result
    }
}

/// Downloads the cluster.idx file of `crawl_version` into `output_folder`, replacing any
/// previous download, and returns the path of the local copy.
#[tracing::instrument(skip(client))]
pub async fn download_cluster_index(
    client: &reqwest::Client,
    crawl_version: &str,
    output_folder: &Path,
) -> Result<PathBuf, anyhow::Error> {
    let url = format!("{}/cluster.idx", crawl_index_base(crawl_version));
    let local_file = output_folder.join(format!("cluster-{crawl_version}.idx"));
    download_file(client, &url, &local_file).await?;
    Ok(local_file)
}

/// Streams `url` into `local_file`, creating missing parent folders.
pub async fn download_file(
    client: &reqwest::Client,
    url: &str,
    local_file: &Path,
) -> Result<(), anyhow::Error> {
    use anyhow::Context;

    if let Some(folder) = local_file.parent() {
        tokio::fs::create_dir_all(folder)
            .await
            .with_context(|| format!("Failed to create {}", folder.display()))?;
    }

    tracing::info!("Downloading {}", url);
    let mut res = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .with_context(|| format!("Failed to fetch {url}"))?;
    let mut file = tokio::fs::File::create(local_file)
        .await
        .with_context(|| format!("Failed to create {}", local_file.display()))?;
    while let Some(chunk) = res.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    tracing::info!("Saved {} to {}", url, local_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range_header(0, 188224).unwrap(), "bytes=0-188223");
        assert_eq!(range_header(3499, 1).unwrap(), "bytes=3499-3499");
        assert!(range_header(10, 0).is_err());
    }

    #[test]
    fn range_past_the_end_of_u64_is_an_error() {
        assert_eq!(
            range_header(u64::MAX, 1).unwrap(),
            format!("bytes={0}-{0}", u64::MAX)
        );
        assert!(matches!(
            range_header(u64::MAX, 2),
            Err(FetchError::RangeOverflow {
                offset: u64::MAX,
                length: 2
            })
        ));
        assert!(matches!(
            range_header(u64::MAX - 10, 100),
            Err(FetchError::RangeOverflow { .. })
        ));
    }

    #[test]
    fn gunzip_reads_concatenated_members() {
        let mut body = Vec::new();
        for part in ["first ", "second"] {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(part.as_bytes()).unwrap();
            body.extend(encoder.finish().unwrap());
        }
        assert_eq!(gunzip(&body).unwrap(), b"first second");
    }

    #[test]
    fn gunzip_rejects_plain_bytes() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }

    #[test]
    fn index_base_points_at_the_crawl() {
        assert_eq!(
            crawl_index_base("CC-MAIN-2024-30"),
            "https://data.commoncrawl.org/cc-index/collections/CC-MAIN-2024-30/indexes"
        );
    }
}
