/// Possible errors
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("No rendering context could be created: {0}")]
    ContextUnavailable(String),

    #[error("Backend rejected a {width}x{height} texture allocation (code {code})")]
    AllocationRejected { width: u32, height: u32, code: i32 },

    #[error("Capability probe failed: {0}")]
    ProbeFault(String),

    #[error("No memory type is suitable for the requested allocation")]
    NoSuitableMemoryType,

    #[cfg(feature = "vulkan")]
    #[error(transparent)]
    VkError(#[from] ash::vk::Result),
}
