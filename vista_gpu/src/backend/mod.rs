pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::{HeadlessBackend, HeadlessConfig};
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;

use crate::GpuError;

/// A rendering backend that can be asked about its limits.
///
/// Backends are probed once per detector; they must be shareable across threads because probing
/// happens on the blocking pool.
pub trait GraphicsBackend: Send + Sync + 'static {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Create a throwaway context used only for capability queries.
    ///
    /// Dropping the returned context releases everything it created.
    fn open_probe(&self) -> Result<Box<dyn ProbeContext + '_>, GpuError>;
}

/// Short lived context handed out by [`GraphicsBackend::open_probe`]
pub trait ProbeContext {
    /// Largest 2D texture dimension the driver claims to support
    fn max_texture_dimension(&self) -> u32;

    /// Sampled textures usable from a single shader stage
    fn max_texture_units(&self) -> u32;

    /// Sampled textures usable across all stages combined
    fn max_combined_units(&self) -> u32;

    fn max_anisotropy(&self) -> f32;

    fn renderer_name(&self) -> String;

    fn vendor_name(&self) -> String;

    /// Try to really allocate an RGBA8 texture of the given extent.
    ///
    /// Returns [`GpuError::AllocationRejected`] when the backend refuses the allocation; any
    /// other error means the probe itself misbehaved.
    fn allocate_test_texture(&mut self, width: u32, height: u32) -> Result<(), GpuError>;
}
