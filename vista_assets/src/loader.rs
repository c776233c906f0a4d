//! Deduplicated, retrying texture loads.

use crate::fetch::{ImageFetcher, LoadProgress, ProgressSink};
use derivative::Derivative;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use vista_gpu::{FilterMode, LoadedTexture, WrapMode};

const PROGRESS_CAPACITY: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("No URL given")]
    EmptyUrl,
    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("Failed to decode {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("{url} produced an empty image")]
    EmptyPayload { url: String },
    #[error("Giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: Box<LoadError>,
    },
}

/// Receives the lifecycle of a single [`TextureLoader::load`] call
pub trait LoadObserver: Send + Sync {
    fn on_progress(&self, _progress: &LoadProgress) {}
    fn on_success(&self, _texture: &LoadedTexture) {}
    fn on_error(&self, _error: &LoadError) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopObserver;

impl LoadObserver for NoopObserver {}

/// Encoded source decoded into pixels, shared by every caller of the same load
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DecodedImage {
    pub url: String,
    #[derivative(Debug = "ignore")]
    pub image: Arc<DynamicImage>,
    pub encoded_bytes: usize,
}

/// Exponential backoff between attempts: `base * 2^(attempt - 1)`, capped at `max_delay`
#[derive(Derivative, Copy, Clone, PartialEq, Eq)]
#[derivative(Debug, Default)]
pub struct RetryPolicy {
    #[derivative(Default(value = "Duration::from_millis(1000)"))]
    pub base_delay: Duration,
    #[derivative(Default(value = "Duration::from_millis(5000)"))]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the failed `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

type LoadResult = Result<Arc<DecodedImage>, LoadError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

struct InFlightLoad {
    id: u64,
    progress: broadcast::Sender<LoadProgress>,
    result: SharedLoad,
}

/// Loads textures, sharing one fetch + decode between concurrent requests for the same URL
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TextureLoader {
    #[derivative(Debug = "ignore")]
    fetcher: Arc<dyn ImageFetcher>,
    #[derivative(Debug = "ignore")]
    in_flight: Arc<DashMap<String, InFlightLoad>>,
    next_id: AtomicU64,
    retry: RetryPolicy,
}

impl TextureLoader {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self::with_retry_policy(fetcher, RetryPolicy::default())
    }

    pub fn with_retry_policy(fetcher: Arc<dyn ImageFetcher>, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Load `url` into a texture configured for panoramas.
    ///
    /// If a load of the same URL is already running this joins it instead of fetching again.
    /// Every caller gets its own texture over the shared pixels.
    pub async fn load(
        &self,
        url: &str,
        observer: &dyn LoadObserver,
    ) -> Result<LoadedTexture, LoadError> {
        if url.is_empty() {
            let error = LoadError::EmptyUrl;
            observer.on_error(&error);
            return Err(error);
        }
        let (result, mut progress) = self.join_or_start(url);
        tokio::pin!(result);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut result => break outcome,
                update = progress.recv() => match update {
                    Ok(update) => observer.on_progress(&update),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::trace!(url = %url, "Skipped {skipped} progress updates");
                    }
                    // every sender is gone, only the result is left
                    Err(RecvError::Closed) => break (&mut result).await,
                },
            }
        };
        // updates published right before completion
        while let Ok(update) = progress.try_recv() {
            observer.on_progress(&update);
        }

        match outcome {
            Ok(decoded) => {
                let mut texture = LoadedTexture::new(decoded.image.clone());
                texture.min_filter = FilterMode::Linear;
                texture.mag_filter = FilterMode::Linear;
                texture.wrap_s = WrapMode::Repeat;
                texture.wrap_t = WrapMode::ClampToEdge;
                texture.generate_mipmaps = false;
                texture.needs_update = true;
                tracing::info!(
                    url = %url,
                    width = texture.width(),
                    height = texture.height(),
                    "Texture loaded"
                );
                observer.on_success(&texture);
                Ok(texture)
            }
            Err(e) => {
                tracing::error!(url = %url, "Texture load failed: {e}");
                observer.on_error(&e);
                Err(e)
            }
        }
    }

    /// [`Self::load`], retried with backoff up to `max_retries` attempts in total
    pub async fn load_with_retry(
        &self,
        url: &str,
        max_retries: u32,
        observer: &dyn LoadObserver,
    ) -> Result<LoadedTexture, LoadError> {
        let attempts = max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.load(url, observer).await {
                Ok(texture) => return Ok(texture),
                Err(e @ LoadError::EmptyUrl) => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(LoadError::RetriesExhausted {
                        url: url.to_string(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        url = %url,
                        attempt,
                        attempts,
                        "Load failed ({e}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Load every URL concurrently. Failures come back as `None` in the matching slot.
    pub async fn preload_all(&self, urls: &[String]) -> Vec<Option<LoadedTexture>> {
        tracing::debug!("Preloading {} textures", urls.len());
        join_all(urls.iter().map(|url| async move {
            match self.load(url, &NoopObserver).await {
                Ok(texture) => Some(texture),
                Err(e) => {
                    tracing::warn!(url = %url, "Preload failed: {e}");
                    None
                }
            }
        }))
        .await
    }

    pub fn dispose(&self, mut texture: LoadedTexture) -> bool {
        texture.dispose()
    }

    /// Forget every in-flight load. Running fetches are not aborted; later requests start fresh.
    pub fn cancel_all_pending(&self) {
        let count = self.in_flight.len();
        self.in_flight.clear();
        if count > 0 {
            tracing::debug!("Dropped {count} pending loads");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_pending(&self, url: &str) -> bool {
        self.in_flight.contains_key(url)
    }

    fn join_or_start(&self, url: &str) -> (SharedLoad, broadcast::Receiver<LoadProgress>) {
        let started = match self.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) => {
                tracing::debug!(url = %url, "Joining in-flight load");
                let load = entry.get();
                return (load.result.clone(), load.progress.subscribe());
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = broadcast::channel(PROGRESS_CAPACITY);
                let result = Self::run_load(
                    self.fetcher.clone(),
                    self.in_flight.clone(),
                    url.to_string(),
                    id,
                    ProgressSink::new(sender.clone()),
                )
                .boxed()
                .shared();
                entry.insert(InFlightLoad {
                    id,
                    progress: sender,
                    result: result.clone(),
                });
                (result, receiver)
            }
        };
        // the map entry is released before the load can start
        tokio::spawn(started.0.clone());
        started
    }

    async fn run_load(
        fetcher: Arc<dyn ImageFetcher>,
        in_flight: Arc<DashMap<String, InFlightLoad>>,
        url: String,
        id: u64,
        progress: ProgressSink,
    ) -> LoadResult {
        tracing::debug!(url = %url, "Starting load");
        let outcome = fetch_and_decode(fetcher.as_ref(), &url, progress).await;
        // a load started after `cancel_all_pending` owns the slot now
        in_flight.remove_if(&url, |_, load| load.id == id);
        outcome
    }
}

async fn fetch_and_decode(
    fetcher: &dyn ImageFetcher,
    url: &str,
    progress: ProgressSink,
) -> LoadResult {
    let bytes = fetcher
        .fetch(url, progress)
        .await
        .map_err(|e| LoadError::Fetch {
            url: url.to_string(),
            reason: format!("{e:#}"),
        })?;
    if bytes.is_empty() {
        return Err(LoadError::EmptyPayload {
            url: url.to_string(),
        });
    }
    let encoded_bytes = bytes.len();
    let image = tokio::task::spawn_blocking(move || -> anyhow::Result<DynamicImage> {
        Ok(image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()?)
    })
    .await
    .map_err(|e| LoadError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })?
    .map_err(|e| LoadError::Decode {
        url: url.to_string(),
        reason: format!("{e:#}"),
    })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(LoadError::EmptyPayload {
            url: url.to_string(),
        });
    }
    Ok(Arc::new(DecodedImage {
        url: url.to_string(),
        image: Arc::new(image),
        encoded_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use bytes::Bytes;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn png(width: u32, height: u32) -> Bytes {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([10, 20, 30, 255]),
        ));
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        Bytes::from(buffer)
    }

    #[derive(Default)]
    struct MemoryFetcher {
        sources: DashMap<String, Bytes>,
        fetches: AtomicUsize,
        failures_left: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MemoryFetcher {
        fn with_source(url: &str, bytes: Bytes) -> Self {
            let fetcher = Self::default();
            fetcher.sources.insert(url.to_string(), bytes);
            fetcher
        }
    }

    impl ImageFetcher for MemoryFetcher {
        fn fetch<'a>(
            &'a self,
            url: &'a str,
            progress: ProgressSink,
        ) -> BoxFuture<'a, anyhow::Result<Bytes>> {
            async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                let failing = self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(anyhow!("connection reset"));
                }
                let bytes = self
                    .sources
                    .get(url)
                    .map(|bytes| bytes.clone())
                    .ok_or_else(|| anyhow!("404"))?;
                let total = bytes.len() as u64;
                progress.report(total / 2, Some(total));
                progress.report(total, Some(total));
                Ok(bytes)
            }
            .boxed()
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        progress: Mutex<Vec<LoadProgress>>,
        successes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl LoadObserver for RecordingObserver {
        fn on_progress(&self, progress: &LoadProgress) {
            self.progress.lock().unwrap().push(*progress);
        }

        fn on_success(&self, _texture: &LoadedTexture) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _error: &LoadError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_load_configures_panorama_sampling() {
        let fetcher = Arc::new(MemoryFetcher::with_source("pano.png", png(8, 4)));
        let loader = TextureLoader::new(fetcher);
        let observer = RecordingObserver::default();

        let texture = loader.load("pano.png", &observer).await.unwrap();
        assert_eq!((texture.width(), texture.height()), (8, 4));
        assert_eq!(texture.wrap_s, WrapMode::Repeat);
        assert_eq!(texture.wrap_t, WrapMode::ClampToEdge);
        assert_eq!(texture.min_filter, FilterMode::Linear);
        assert!(!texture.generate_mipmaps);
        assert_eq!(observer.successes.load(Ordering::SeqCst), 1);

        let progress = observer.progress.lock().unwrap().clone();
        assert_eq!(progress.last().and_then(|p| p.percent()), Some(100.0));
        assert!(loader.dispose(texture));
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let fetcher = Arc::new(MemoryFetcher {
            delay: Some(Duration::from_millis(20)),
            ..MemoryFetcher::with_source("pano.png", png(8, 4))
        });
        let loader = TextureLoader::new(fetcher.clone());

        let (a, b) = tokio::join!(
            loader.load("pano.png", &NoopObserver),
            loader.load("pano.png", &NoopObserver)
        );
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
        assert_ne!(a.id(), b.id());
        assert!(Arc::ptr_eq(a.pixels().unwrap(), b.pixels().unwrap()));

        // disposing one caller's texture leaves the other intact
        assert!(a.dispose());
        assert!(b.pixels().is_some());
        assert!(b.dispose());
        assert_eq!(loader.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_entry_removed_after_failure() {
        let loader = TextureLoader::new(Arc::new(MemoryFetcher::default()));
        let observer = RecordingObserver::default();
        let err = loader.load("missing.png", &observer).await.unwrap_err();
        assert!(matches!(err, LoadError::Fetch { .. }));
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
        assert!(!loader.is_pending("missing.png"));
    }

    #[tokio::test]
    async fn test_empty_and_corrupt_payloads() {
        let fetcher = MemoryFetcher::default();
        fetcher.sources.insert("empty".into(), Bytes::new());
        fetcher
            .sources
            .insert("corrupt".into(), Bytes::from_static(b"not an image"));
        let loader = TextureLoader::new(Arc::new(fetcher));

        assert_eq!(
            loader.load("empty", &NoopObserver).await.unwrap_err(),
            LoadError::EmptyPayload {
                url: "empty".into()
            }
        );
        assert!(matches!(
            loader.load("corrupt", &NoopObserver).await.unwrap_err(),
            LoadError::Decode { .. }
        ));
        assert_eq!(
            loader.load("", &NoopObserver).await.unwrap_err(),
            LoadError::EmptyUrl
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_then_succeeds() {
        let fetcher = Arc::new(MemoryFetcher::with_source("pano.png", png(4, 2)));
        fetcher.failures_left.store(2, Ordering::SeqCst);
        let loader = TextureLoader::new(fetcher.clone());

        let start = tokio::time::Instant::now();
        let texture = loader
            .load_with_retry("pano.png", 3, &NoopObserver)
            .await
            .unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(3000));
        assert!(waited < Duration::from_millis(3500));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
        loader.dispose(texture);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let fetcher = Arc::new(MemoryFetcher::default());
        let loader = TextureLoader::new(fetcher.clone());
        let err = loader
            .load_with_retry("gone.png", 3, &NoopObserver)
            .await
            .unwrap_err();
        match err {
            LoadError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, LoadError::Fetch { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_preload_all_keeps_slots() {
        let fetcher = MemoryFetcher::with_source("a.png", png(4, 2));
        fetcher.sources.insert("c.png".into(), png(2, 1));
        let loader = TextureLoader::new(Arc::new(fetcher));

        let urls = vec!["a.png".to_string(), "b.png".to_string(), "c.png".to_string()];
        let textures = loader.preload_all(&urls).await;
        assert_eq!(textures.len(), 3);
        assert!(textures[1].is_none());
        for texture in textures.into_iter().flatten() {
            loader.dispose(texture);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_pending_starts_fresh() {
        let fetcher = Arc::new(MemoryFetcher {
            delay: Some(Duration::from_millis(100)),
            ..MemoryFetcher::with_source("pano.png", png(4, 2))
        });
        let loader = Arc::new(TextureLoader::new(fetcher.clone()));

        let first = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load("pano.png", &NoopObserver).await }
        });
        while !loader.is_pending("pano.png") {
            tokio::task::yield_now().await;
        }

        loader.cancel_all_pending();
        assert_eq!(loader.pending_count(), 0);

        // the first fetch is still running but is no longer shared
        let second = loader.load("pano.png", &NoopObserver).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(loader.pending_count(), 0);
        loader.dispose(first);
        loader.dispose(second);
    }
}
