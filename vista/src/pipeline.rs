use crate::config::PipelineConfig;
use crate::error::PipelineError;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use vista_assets::{
    AssetCache, AssetMetadata, BlobStore, CacheStats, ImageFetcher, LoadObserver, LoadProgress,
    ProgressiveResizer, ResizeError, ResizedImage, ResolvedResource, SourceFetcher, TextureLoader,
    TextureOptimizer, plan_resize,
};
use vista_gpu::{CapabilityDetector, GpuLimits, LoadedTexture};

type PreparationGates = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Reports scene load progress through `tracing`
struct SceneLoadLog<'a> {
    url: &'a str,
}

impl LoadObserver for SceneLoadLog<'_> {
    fn on_progress(&self, progress: &LoadProgress) {
        match progress.percent() {
            Some(percent) => tracing::trace!(url = %self.url, "Loading panorama {percent:.0}%"),
            None => tracing::trace!(
                url = %self.url,
                "Loading panorama {:.1}MB",
                progress.loaded_mb()
            ),
        }
    }
}

/// Exclusive right to prepare one source URL. The gate leaves the map once nobody waits on it.
struct PreparationGuard<'a> {
    gates: &'a PreparationGates,
    url: &'a str,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for PreparationGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        self.gates
            .remove_if(self.url, |_, gate| Arc::strong_count(gate) == 1);
    }
}

/// Turns panorama URLs into textures that fit the current GPU.
///
/// Sources larger than the detected texture limit are downscaled once and kept in the asset cache
/// as blobs, so revisiting a scene skips both the download and the resize. Concurrent requests for
/// the same source wait for a single preparation.
#[derive(Debug)]
pub struct PanoramaPipeline {
    config: PipelineConfig,
    detector: Arc<CapabilityDetector>,
    cache: Mutex<AssetCache>,
    preparing: PreparationGates,
    loader: TextureLoader,
    resizer: ProgressiveResizer,
    blobs: BlobStore,
}

impl PanoramaPipeline {
    /// `blobs` must be the store `fetcher` resolves `blob:` URLs against
    pub fn new(
        config: PipelineConfig,
        detector: Arc<CapabilityDetector>,
        fetcher: Arc<dyn ImageFetcher>,
        blobs: BlobStore,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        tracing::info!(
            item_budget = config.item_budget,
            memory_budget_mb = config.memory_budget_mb,
            "Panorama pipeline created"
        );
        Ok(Self {
            cache: Mutex::new(AssetCache::new(config.cache_budget(), blobs.clone())),
            preparing: DashMap::new(),
            loader: TextureLoader::with_retry_policy(fetcher, config.retry),
            resizer: ProgressiveResizer::new(config.encode_quality),
            detector,
            blobs,
            config,
        })
    }

    /// Pipeline reading from disk and http(s) through [`SourceFetcher`]
    pub fn with_source_fetcher(
        config: PipelineConfig,
        detector: Arc<CapabilityDetector>,
    ) -> Result<Self, PipelineError> {
        let blobs = BlobStore::new();
        let fetcher = Arc::new(SourceFetcher::new(blobs.clone()));
        Self::new(config, detector, fetcher, blobs)
    }

    /// Pipeline sized for the machine's Vulkan device, reading through [`SourceFetcher`]
    #[cfg(feature = "vulkan")]
    pub fn native(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_source_fetcher(config, Arc::new(CapabilityDetector::native()))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<CapabilityDetector> {
        &self.detector
    }

    pub fn loader(&self) -> &TextureLoader {
        &self.loader
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Prepare the panorama of a scene.
    ///
    /// The texture is returned already configured for panorama sampling. If `token` is cancelled
    /// by the time the load settles, the texture is disposed and [`PipelineError::Cancelled`] is
    /// returned instead, whether the load succeeded or not.
    pub async fn load_panorama_for_scene(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<LoadedTexture, PipelineError> {
        if url.is_empty() {
            tracing::warn!("Scene has no panorama URL");
            return Err(PipelineError::EmptyUrl);
        }
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled {
                url: url.to_string(),
            });
        }
        let limits = self.detector.get_limits().await;
        let observer = SceneLoadLog { url };
        tracing::debug!(
            url = %url,
            max_dimension = limits.max_texture_dimension,
            "Loading panorama for scene"
        );

        let prepared = self
            .prepare(url, limits.max_texture_dimension, &observer)
            .await;
        let optimizer = self.optimizer(&limits);
        let texture = match prepared {
            Ok(texture) => self.configure(&optimizer, texture),
            Err(e) if token.is_cancelled() => {
                tracing::debug!(url = %url, "Scene went away during a failed load ({e})");
                return Err(PipelineError::Cancelled {
                    url: url.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        if token.is_cancelled() {
            tracing::debug!(url = %url, "Scene went away during load, discarding texture");
            optimizer.dispose(texture);
            return Err(PipelineError::Cancelled {
                url: url.to_string(),
            });
        }
        tracing::info!(
            url = %url,
            width = texture.width(),
            height = texture.height(),
            memory_mb = optimizer.estimate_memory_usage_mb(&texture),
            "Panorama ready"
        );
        Ok(texture)
    }

    /// Dispose a texture the scene no longer displays, returning the memory it released
    pub fn release_scene_texture(&self, texture: LoadedTexture) -> f64 {
        TextureOptimizer::new().dispose(texture)
    }

    /// Prepare neighbouring panoramas ahead of time.
    ///
    /// Each URL goes through the same resize and cache path as a scene load, so a later visit is a
    /// cache hit. Failures are logged and come back as `None`.
    pub async fn preload(&self, urls: &[String]) -> Vec<Option<LoadedTexture>> {
        let limits = self.detector.get_limits().await;
        let optimizer = self.optimizer(&limits);
        let max_dimension = limits.max_texture_dimension;
        tracing::debug!(count = urls.len(), "Preloading panoramas");
        futures::future::join_all(urls.iter().map(|url| {
            let optimizer = &optimizer;
            async move {
                let observer = SceneLoadLog { url };
                match self.prepare(url, max_dimension, &observer).await {
                    Ok(texture) => Some(self.configure(optimizer, texture)),
                    Err(e) => {
                        tracing::warn!(url = %url, "Preload failed: {e}");
                        None
                    }
                }
            }
        }))
        .await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.lock_cache().stats()
    }

    pub fn log_cache_stats(&self) {
        self.lock_cache().log_stats();
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.lock_cache().has(url)
    }

    pub fn prune_cache(&self, max_age: Duration) -> usize {
        self.lock_cache().prune_older_than(max_age)
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> MutexGuard<'_, AssetCache> {
        // a panic mid-operation leaves the cache consistent enough to keep serving
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn optimizer(&self, limits: &GpuLimits) -> TextureOptimizer {
        TextureOptimizer::with_max_anisotropy(limits.max_anisotropy.min(self.config.max_anisotropy))
    }

    fn configure(&self, optimizer: &TextureOptimizer, mut texture: LoadedTexture) -> LoadedTexture {
        optimizer.optimize_for_panorama(&mut texture);
        if let Some(preset) = self.config.quality {
            optimizer.apply_quality_preset(&mut texture, preset);
        }
        texture
    }

    /// Cache hit, or a miss path shared with every concurrent request for `url`
    async fn prepare(
        &self,
        url: &str,
        max_dimension: u32,
        observer: &dyn LoadObserver,
    ) -> Result<LoadedTexture, PipelineError> {
        if let Some(texture) = self.load_cached(url, max_dimension, observer).await {
            return Ok(texture);
        }
        let _guard = self.lock_preparation(url).await;
        // whoever held the gate may have cached it meanwhile
        if let Some(texture) = self.load_cached(url, max_dimension, observer).await {
            return Ok(texture);
        }
        self.load_source(url, max_dimension, observer).await
    }

    async fn lock_preparation<'a>(&'a self, url: &'a str) -> PreparationGuard<'a> {
        let gate = self.preparing.entry(url.to_string()).or_default().clone();
        PreparationGuard {
            gates: &self.preparing,
            url,
            held: Some(gate.lock_owned().await),
        }
    }

    /// Serve `url` from the cache, if a usable entry exists
    async fn load_cached(
        &self,
        url: &str,
        max_dimension: u32,
        observer: &dyn LoadObserver,
    ) -> Option<LoadedTexture> {
        let resolved = {
            let mut cache = self.lock_cache();
            let entry = cache.get(url)?;
            let dimensions = (entry.width, entry.height);
            let resolved = entry.resolved_url.clone();
            if let (Some(width), Some(height)) = dimensions {
                if width.max(height) > max_dimension {
                    // prepared for a larger limit than the current one
                    tracing::debug!(
                        url = %url,
                        width,
                        height,
                        max_dimension,
                        "Cached panorama exceeds the texture limit, preparing again"
                    );
                    cache.delete(url);
                    return None;
                }
            }
            resolved
        };

        match self.loader.load(&resolved, observer).await {
            Ok(texture) => {
                tracing::debug!(url = %url, resolved = %resolved, "Panorama served from cache");
                Some(texture)
            }
            Err(e) => {
                tracing::warn!(url = %url, "Cached panorama unusable ({e}), reloading source");
                self.lock_cache().delete_if_resolved(url, &resolved);
                None
            }
        }
    }

    /// Fetch the source, downscale it if needed and cache the result
    async fn load_source(
        &self,
        url: &str,
        max_dimension: u32,
        observer: &dyn LoadObserver,
    ) -> Result<LoadedTexture, PipelineError> {
        let original = self
            .loader
            .load_with_retry(url, self.config.max_retries, observer)
            .await?;
        let (width, height) = (original.width(), original.height());
        if self.config.deviates_from_aspect_ratio(width, height) {
            tracing::warn!(
                url = %url,
                width,
                height,
                expected = self.config.target_aspect_ratio,
                "Panorama is not equirectangular"
            );
        }

        let plan = plan_resize(width, height, max_dimension);
        let Some(pixels) = original.pixels().cloned().filter(|_| plan.needs_resize) else {
            return Ok(original);
        };
        tracing::info!(
            url = %url,
            "Panorama {width}x{height} exceeds {max_dimension}, resizing to {}x{}",
            plan.target_width,
            plan.target_height
        );
        let resized = self.resizer.resize(pixels, &plan, max_dimension).await;
        Ok(self.adopt_resized(url, original, resized, observer).await)
    }

    /// Cache a resize result and load it, falling back to `original` whenever that fails
    async fn adopt_resized(
        &self,
        url: &str,
        original: LoadedTexture,
        resized: Result<ResizedImage, ResizeError>,
        observer: &dyn LoadObserver,
    ) -> LoadedTexture {
        let (image, report) = match resized {
            Ok(ResizedImage::Resized { image, report }) => (image, report),
            Ok(ResizedImage::Original(_)) => return original,
            Err(e) => {
                tracing::error!(url = %url, "Resize failed, using the original: {e}");
                return original;
            }
        };
        let metadata = AssetMetadata::with_dimensions(image.width, image.height);
        let Some(resolved) = self
            .lock_cache()
            .set(url, ResolvedResource::Blob(image.bytes), metadata)
        else {
            return original;
        };
        tracing::debug!(
            url = %url,
            steps = report.steps.len(),
            saved_mb = report.memory_savings_mb,
            "Cached resized panorama"
        );

        match self.loader.load(&resolved, observer).await {
            Ok(resized) => {
                self.loader.dispose(original);
                resized
            }
            Err(e) => {
                tracing::error!(url = %url, "Resized panorama unusable, using the original: {e}");
                self.lock_cache().delete_if_resolved(url, &resolved);
                original
            }
        }
    }
}
