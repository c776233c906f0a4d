use crate::blob::{BlobError, BlobStore};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Download progress of a single source
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LoadProgress {
    pub loaded_bytes: u64,
    /// `None` when the source does not announce its length
    pub total_bytes: Option<u64>,
}

impl LoadProgress {
    /// Percent complete, if the total is known
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.loaded_bytes as f64 / total as f64 * 100.0),
            None => None,
        }
    }

    pub fn loaded_mb(&self) -> f64 {
        self.loaded_bytes as f64 / BYTES_PER_MB
    }

    pub fn total_mb(&self) -> Option<f64> {
        self.total_bytes.map(|total| total as f64 / BYTES_PER_MB)
    }
}

/// Where a fetcher publishes progress. Every subscriber of an in-flight load listens to the same
/// sink.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<broadcast::Sender<LoadProgress>>,
}

impl ProgressSink {
    pub fn new(sender: broadcast::Sender<LoadProgress>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// A sink nobody listens to
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn report(&self, loaded_bytes: u64, total_bytes: Option<u64>) {
        let progress = LoadProgress {
            loaded_bytes,
            total_bytes,
        };
        match progress.percent() {
            Some(percent) => tracing::trace!(
                "Progress {:.1}% ({:.1}MB / {:.1}MB)",
                percent,
                progress.loaded_mb(),
                progress.total_mb().unwrap_or_default()
            ),
            None => tracing::trace!("Progress {:.1}MB (size unknown)", progress.loaded_mb()),
        }
        if let Some(sender) = &self.sender {
            // no receivers is fine
            let _ = sender.send(progress);
        }
    }
}

/// Turns a URL into the raw bytes of an encoded image
pub trait ImageFetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a str, progress: ProgressSink) -> BoxFuture<'a, Result<Bytes>>;
}

/// Default fetcher.
///
/// - `blob:` URLs resolve against the shared [`BlobStore`]
/// - `http://` and `https://` URLs are streamed with `reqwest`
/// - `file://` URLs and bare paths are read from disk
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    blobs: BlobStore,
}

impl SourceFetcher {
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            client: reqwest::Client::new(),
            blobs,
        }
    }

    pub fn with_client(client: reqwest::Client, blobs: BlobStore) -> Self {
        Self { client, blobs }
    }

    async fn fetch_http(&self, url: &str, progress: &ProgressSink) -> Result<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        let total = response.content_length();
        let mut buffer = BytesMut::with_capacity(total.unwrap_or_default() as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            progress.report(buffer.len() as u64, total);
        }
        Ok(buffer.freeze())
    }
}

impl ImageFetcher for SourceFetcher {
    fn fetch<'a>(&'a self, url: &'a str, progress: ProgressSink) -> BoxFuture<'a, Result<Bytes>> {
        async move {
            if BlobStore::is_blob_url(url) {
                let bytes = self
                    .blobs
                    .get(url)
                    .ok_or_else(|| BlobError::NotFound(url.to_string()))?;
                progress.report(bytes.len() as u64, Some(bytes.len() as u64));
                Ok(bytes)
            } else if url.starts_with("http://") || url.starts_with("https://") {
                self.fetch_http(url, &progress).await
            } else {
                let path = url.strip_prefix("file://").unwrap_or(url);
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {path}"))?;
                progress.report(bytes.len() as u64, Some(bytes.len() as u64));
                Ok(Bytes::from(bytes))
            }
        }
        .boxed()
    }
}
