pub mod blob;
pub mod cache;
pub mod fetch;
pub mod loader;
pub mod optimizer;
pub mod resizer;

pub use blob::{BlobError, BlobStore};
pub use cache::{
    AssetCache, AssetMetadata, CacheBudget, CacheEntry, CacheStats, ResolvedResource,
};
pub use fetch::{ImageFetcher, LoadProgress, ProgressSink, SourceFetcher};
pub use loader::{DecodedImage, LoadError, LoadObserver, NoopObserver, RetryPolicy, TextureLoader};
pub use optimizer::{QualityPreset, SamplerConfig, SamplerDifference, TextureOptimizer};
pub use resizer::{
    EncodedImage, ProgressiveResizer, ResizeError, ResizePlan, ResizeReport, ResizedImage,
    plan_resize,
};
