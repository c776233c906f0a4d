//! GPU-aware loading of equirectangular panoramas.
//!
//! [`PanoramaPipeline`] ties the capability detector, asset cache, loader, resizer and optimizer
//! together; [`SceneTextureSlot`] owns the texture a scene is displaying.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod scene;

pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use pipeline::PanoramaPipeline;
pub use scene::{SceneState, SceneTextureSlot};

// Re-exports
pub use tokio_util::sync::CancellationToken;
pub use vista_assets;
pub use vista_gpu;
