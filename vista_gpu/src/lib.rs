pub mod backend;
pub mod capabilities;
pub mod error;
pub mod texture;

pub use capabilities::{CapabilityDetector, GpuLimits};
pub use error::GpuError;
pub use texture::{FilterMode, LoadedTexture, WrapMode};

// Re-exports
#[cfg(feature = "vulkan")]
pub use ash;
pub use image;
