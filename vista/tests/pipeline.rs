use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vista::vista_assets::{
    BlobStore, ImageFetcher, LoadError, ProgressSink, QualityPreset, SourceFetcher,
};
use vista::vista_gpu::backend::HeadlessBackend;
use vista::vista_gpu::{CapabilityDetector, FilterMode, WrapMode};
use vista::{
    CancellationToken, PanoramaPipeline, PipelineConfig, PipelineError, SceneState,
    SceneTextureSlot,
};

const GPU_LIMIT: u32 = 64;

fn png(width: u32, height: u32) -> Bytes {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 128, 255])
    });
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    Bytes::from(buffer)
}

/// Serves panoramas from memory and counts source fetches. Blob URLs go to the real store.
struct CountingFetcher {
    blobs: SourceFetcher,
    sources: DashMap<String, Bytes>,
    fetches: AtomicUsize,
    delay: Option<Duration>,
    blob_delay: Option<Duration>,
    fail_blobs: bool,
}

impl CountingFetcher {
    fn new(blobs: BlobStore) -> Self {
        Self {
            blobs: SourceFetcher::new(blobs),
            sources: DashMap::new(),
            fetches: AtomicUsize::new(0),
            delay: None,
            blob_delay: None,
            fail_blobs: false,
        }
    }

    fn serve(self, url: &str, bytes: Bytes) -> Self {
        self.sources.insert(url.to_string(), bytes);
        self
    }

    fn source_fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ImageFetcher for CountingFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        progress: ProgressSink,
    ) -> BoxFuture<'a, anyhow::Result<Bytes>> {
        async move {
            if BlobStore::is_blob_url(url) {
                if let Some(delay) = self.blob_delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail_blobs {
                    anyhow::bail!("{url} is unreadable");
                }
                return self.blobs.fetch(url, progress).await;
            }
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let bytes = self
                .sources
                .get(url)
                .map(|bytes| bytes.clone())
                .ok_or_else(|| anyhow::anyhow!("{url} not found"))?;
            progress.report(bytes.len() as u64, Some(bytes.len() as u64));
            Ok(bytes)
        }
        .boxed()
    }
}

fn setup(
    config: PipelineConfig,
    configure: impl FnOnce(CountingFetcher) -> CountingFetcher,
) -> (Arc<PanoramaPipeline>, Arc<CountingFetcher>) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    let blobs = BlobStore::new();
    let fetcher = Arc::new(configure(CountingFetcher::new(blobs.clone())));
    let detector = Arc::new(CapabilityDetector::new(Arc::new(
        HeadlessBackend::with_max_texture_dimension(GPU_LIMIT),
    )));
    let pipeline =
        PanoramaPipeline::new(config, detector, fetcher.clone(), blobs).unwrap();
    (Arc::new(pipeline), fetcher)
}

#[tokio::test]
async fn oversized_panorama_is_resized_and_cached() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| {
        f.serve("pano.png", png(256, 128))
    });
    let token = CancellationToken::new();

    let texture = pipeline
        .load_panorama_for_scene("pano.png", &token)
        .await
        .unwrap();
    assert_eq!((texture.width(), texture.height()), (64, 32));
    let pixels = texture.pixels().unwrap();
    assert_eq!((pixels.width(), pixels.height()), (64, 32));
    assert_eq!(texture.wrap_s, WrapMode::Repeat);
    assert_eq!(texture.wrap_t, WrapMode::ClampToEdge);
    assert_eq!(texture.min_filter, FilterMode::Linear);
    assert!(!texture.generate_mipmaps);

    assert_eq!(fetcher.source_fetches(), 1);
    assert!(pipeline.is_cached("pano.png"));
    assert_eq!(pipeline.blobs().len(), 1);
    assert_eq!(
        pipeline.detector().cached_limits().unwrap().max_texture_dimension,
        GPU_LIMIT
    );
    pipeline.release_scene_texture(texture);
}

#[tokio::test]
async fn revisiting_a_scene_hits_the_cache() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| {
        f.serve("pano.png", png(256, 128))
    });
    let token = CancellationToken::new();

    let first = pipeline
        .load_panorama_for_scene("pano.png", &token)
        .await
        .unwrap();
    let second = pipeline
        .load_panorama_for_scene("pano.png", &token)
        .await
        .unwrap();
    assert_eq!(fetcher.source_fetches(), 1);
    assert_ne!(first.id(), second.id());
    assert_eq!((second.width(), second.height()), (64, 32));

    let stats = pipeline.cache_stats();
    assert_eq!(stats.item_count, 1);
    assert_eq!(stats.total_accesses, 1);

    pipeline.release_scene_texture(first);
    pipeline.release_scene_texture(second);
}

#[tokio::test]
async fn panorama_within_limit_is_not_cached() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| {
        f.serve("small.png", png(64, 32))
    });
    let token = CancellationToken::new();

    let texture = pipeline
        .load_panorama_for_scene("small.png", &token)
        .await
        .unwrap();
    assert_eq!((texture.width(), texture.height()), (64, 32));
    assert!(!pipeline.is_cached("small.png"));
    assert!(pipeline.blobs().is_empty());

    pipeline.release_scene_texture(texture);
    let again = pipeline
        .load_panorama_for_scene("small.png", &token)
        .await
        .unwrap();
    assert_eq!(fetcher.source_fetches(), 2);
    pipeline.release_scene_texture(again);
}

#[tokio::test]
async fn revoked_cache_blob_falls_back_to_source() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| {
        f.serve("pano.png", png(256, 128))
    });
    let token = CancellationToken::new();

    let first = pipeline
        .load_panorama_for_scene("pano.png", &token)
        .await
        .unwrap();
    pipeline.release_scene_texture(first);

    // someone else released the blob behind the cache's back
    let blobs = pipeline.blobs().clone();
    for url in blobs.urls() {
        blobs.revoke(&url).unwrap();
    }
    assert!(pipeline.is_cached("pano.png"));

    let second = pipeline
        .load_panorama_for_scene("pano.png", &token)
        .await
        .unwrap();
    assert_eq!((second.width(), second.height()), (64, 32));
    assert_eq!(fetcher.source_fetches(), 2);
    assert!(pipeline.is_cached("pano.png"));
    pipeline.release_scene_texture(second);
}

#[tokio::test(start_paused = true)]
async fn cancelled_scene_discards_late_texture() {
    let (pipeline, _) = setup(PipelineConfig::default(), |f| CountingFetcher {
        delay: Some(Duration::from_millis(500)),
        ..f.serve("pano.png", png(256, 128))
    });
    let token = CancellationToken::new();

    let load = tokio::spawn({
        let pipeline = pipeline.clone();
        let token = token.clone();
        async move { pipeline.load_panorama_for_scene("pano.png", &token).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let result = load.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        PipelineError::Cancelled {
            url: "pano.png".into()
        }
    );
    // the prepared asset is still worth keeping for the next visit
    assert!(pipeline.is_cached("pano.png"));
}

#[tokio::test(start_paused = true)]
async fn missing_source_fails_after_retries() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| f);
    let token = CancellationToken::new();

    let err = pipeline
        .load_panorama_for_scene("missing.png", &token)
        .await
        .unwrap_err();
    match err {
        PipelineError::Load(LoadError::RetriesExhausted { attempts, .. }) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fetcher.source_fetches(), 3);
    assert!(!pipeline.is_cached("missing.png"));
}

#[tokio::test]
async fn empty_url_is_rejected() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| f);
    assert_eq!(
        pipeline
            .load_panorama_for_scene("", &CancellationToken::new())
            .await
            .unwrap_err(),
        PipelineError::EmptyUrl
    );
    assert_eq!(fetcher.source_fetches(), 0);
}

#[tokio::test]
async fn quality_preset_applied_after_panorama_config() {
    let config = PipelineConfig {
        quality: Some(QualityPreset::High),
        ..Default::default()
    };
    let (pipeline, _) = setup(config, |f| f.serve("pano.png", png(64, 32)));

    let texture = pipeline
        .load_panorama_for_scene("pano.png", &CancellationToken::new())
        .await
        .unwrap();
    assert!(texture.generate_mipmaps);
    assert_eq!(texture.min_filter, FilterMode::LinearMipmapLinear);
    assert_eq!(texture.anisotropy, 4);
    // wrapping is not part of the preset
    assert_eq!(texture.wrap_s, WrapMode::Repeat);
    pipeline.release_scene_texture(texture);
}

#[tokio::test]
async fn preload_reports_failures_per_url() {
    let (pipeline, _) = setup(PipelineConfig::default(), |f| {
        f.serve("a.png", png(32, 16)).serve("c.png", png(16, 8))
    });
    let urls = vec!["a.png".to_string(), "b.png".to_string(), "c.png".to_string()];
    tokio::time::pause();
    let textures = pipeline.preload(&urls).await;
    assert!(textures[0].is_some());
    assert!(textures[1].is_none());
    assert!(textures[2].is_some());
    for texture in textures.into_iter().flatten() {
        pipeline.release_scene_texture(texture);
    }
}

#[tokio::test]
async fn preload_resizes_and_warms_the_cache() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| {
        f.serve("next.png", png(256, 128))
    });
    let textures = pipeline.preload(&["next.png".to_string()]).await;
    let texture = textures.into_iter().flatten().next().unwrap();
    assert_eq!((texture.width(), texture.height()), (64, 32));
    assert_eq!(texture.wrap_s, WrapMode::Repeat);
    assert!(pipeline.is_cached("next.png"));
    pipeline.release_scene_texture(texture);

    let visited = pipeline
        .load_panorama_for_scene("next.png", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((visited.width(), visited.height()), (64, 32));
    assert_eq!(fetcher.source_fetches(), 1);
    pipeline.release_scene_texture(visited);
}

#[tokio::test]
async fn concurrent_scenes_share_one_preparation() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| CountingFetcher {
        blob_delay: Some(Duration::from_millis(30)),
        ..f.serve("pano.png", png(256, 128))
    });
    let token = CancellationToken::new();

    let (a, b) = tokio::join!(
        pipeline.load_panorama_for_scene("pano.png", &token),
        pipeline.load_panorama_for_scene("pano.png", &token)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    for texture in [&a, &b] {
        assert!(texture.width().max(texture.height()) <= GPU_LIMIT);
    }
    assert_ne!(a.id(), b.id());
    assert_eq!(fetcher.source_fetches(), 1);
    assert!(pipeline.is_cached("pano.png"));
    assert_eq!(pipeline.blobs().len(), 1);
    pipeline.release_scene_texture(a);
    pipeline.release_scene_texture(b);
}

#[tokio::test]
async fn unusable_resized_blob_falls_back_to_original() {
    let (pipeline, fetcher) = setup(PipelineConfig::default(), |f| CountingFetcher {
        fail_blobs: true,
        ..f.serve("pano.png", png(256, 128))
    });

    let texture = pipeline
        .load_panorama_for_scene("pano.png", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((texture.width(), texture.height()), (256, 128));
    assert_eq!(texture.wrap_s, WrapMode::Repeat);
    assert_eq!(fetcher.source_fetches(), 1);
    assert!(!pipeline.is_cached("pano.png"));
    assert!(pipeline.blobs().is_empty());
    pipeline.release_scene_texture(texture);
}

#[tokio::test(start_paused = true)]
async fn cancelled_scene_ignores_late_failure() {
    let (pipeline, _) = setup(PipelineConfig::default(), |f| f);
    let token = CancellationToken::new();

    let load = tokio::spawn({
        let pipeline = pipeline.clone();
        let token = token.clone();
        async move { pipeline.load_panorama_for_scene("missing.png", &token).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    assert_eq!(
        load.await.unwrap().unwrap_err(),
        PipelineError::Cancelled {
            url: "missing.png".into()
        }
    );
}

#[tokio::test]
async fn scene_slot_swaps_and_keeps_texture_on_failure() {
    let (pipeline, _) = setup(PipelineConfig::default(), |f| {
        f.serve("a.png", png(256, 128)).serve("b.png", png(32, 16))
    });
    let mut slot = SceneTextureSlot::new(pipeline.clone());
    assert_eq!(slot.state(), &SceneState::Empty);

    slot.load("a.png").await.unwrap();
    let first = slot.texture().unwrap().id();
    assert_eq!(
        slot.state(),
        &SceneState::Ready {
            url: "a.png".into()
        }
    );

    slot.load("b.png").await.unwrap();
    assert_ne!(slot.texture().unwrap().id(), first);
    assert_eq!(slot.texture().unwrap().width(), 32);

    tokio::time::pause();
    assert!(slot.load("missing.png").await.is_err());
    assert!(matches!(slot.state(), SceneState::Failed { url, .. } if url == "missing.png"));
    // still showing the last good panorama
    assert_eq!(slot.texture().unwrap().width(), 32);

    let token = slot.token();
    slot.teardown();
    assert!(token.is_cancelled());
}
