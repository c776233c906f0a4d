//! Discovery of the rendering backend's texture limits.
//!
//! Reported limits are not trusted blindly: the detector asks the backend for its maximum texture
//! dimension and then verifies it with a real allocation, settling for a smaller conservative
//! size when the backend refuses. Detection never fails; every error path ends in a usable
//! fallback.

use crate::GpuError;
use crate::backend::GraphicsBackend;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Used when no context can be created at all
pub const FALLBACK_TEXTURE_DIMENSION: u32 = 2048;
/// Largest size ever tried during validation
pub const PROBE_TEXTURE_CEILING: u32 = 8192;
/// Upper bound used once the backend has misbehaved during validation
pub const CONSERVATIVE_TEXTURE_DIMENSION: u32 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct GpuLimits {
    /// Validated maximum texture dimension, this is what the pipeline must respect
    pub max_texture_dimension: u32,
    pub max_texture_units: u32,
    pub max_combined_units: u32,
    pub max_anisotropy: u8,
    pub renderer_name: String,
    pub vendor_name: String,
    /// What the backend claimed before validation
    pub reported_max_texture_dimension: Option<u32>,
    /// `false` when the values are a fallback rather than a measurement
    pub detected: bool,
}

impl GpuLimits {
    pub fn fallback(max_texture_dimension: u32) -> Self {
        Self {
            max_texture_dimension,
            max_texture_units: 0,
            max_combined_units: 0,
            max_anisotropy: 1,
            renderer_name: "unknown".to_string(),
            vendor_name: "unknown".to_string(),
            reported_max_texture_dimension: None,
            detected: false,
        }
    }
}

/// Probe `backend` synchronously.
///
/// Blocks for as long as the backend takes to create and tear down its context.
pub fn probe_backend(backend: &dyn GraphicsBackend) -> GpuLimits {
    let mut probe = match backend.open_probe() {
        Ok(probe) => probe,
        Err(e) => {
            tracing::error!(backend = backend.name(), "Capability probe unavailable: {e}");
            return GpuLimits::fallback(FALLBACK_TEXTURE_DIMENSION);
        }
    };

    let reported = probe.max_texture_dimension();
    if reported == 0 {
        tracing::error!(backend = backend.name(), "Backend reported a zero texture limit");
        return GpuLimits::fallback(FALLBACK_TEXTURE_DIMENSION);
    }
    let renderer_name = probe.renderer_name();
    let vendor_name = probe.vendor_name();
    tracing::info!(
        backend = backend.name(),
        renderer = %renderer_name,
        vendor = %vendor_name,
        reported,
        "Probing texture limits"
    );

    let test_size = reported.min(PROBE_TEXTURE_CEILING);
    let test_height = (test_size / 2).max(1);
    let max_texture_dimension = match probe.allocate_test_texture(test_size, test_height) {
        Ok(()) => {
            tracing::debug!("Test allocation {test_size}x{test_height} succeeded");
            test_size
        }
        Err(GpuError::AllocationRejected { code, .. }) => {
            let conservative = (test_size / 2).min(CONSERVATIVE_TEXTURE_DIMENSION);
            tracing::warn!(
                code,
                "Test allocation {test_size}x{test_height} rejected, settling for {conservative}"
            );
            conservative
        }
        Err(e) => {
            let conservative = CONSERVATIVE_TEXTURE_DIMENSION.min(test_size);
            tracing::warn!("Test allocation faulted ({e}), settling for {conservative}");
            conservative
        }
    };

    let limits = GpuLimits {
        max_texture_dimension,
        max_texture_units: probe.max_texture_units(),
        max_combined_units: probe.max_combined_units(),
        max_anisotropy: probe.max_anisotropy().clamp(1.0, 16.0) as u8,
        renderer_name,
        vendor_name,
        reported_max_texture_dimension: Some(reported),
        detected: true,
    };
    tracing::info!(
        max_texture_dimension = limits.max_texture_dimension,
        "Texture limit retained"
    );
    limits
}

/// Memoizing front of a [`GraphicsBackend`].
///
/// The first call to [`CapabilityDetector::detect`] probes the backend on the blocking pool;
/// every later call, concurrent or not, observes the same [`GpuLimits`].
pub struct CapabilityDetector {
    backend: Arc<dyn GraphicsBackend>,
    limits: OnceCell<GpuLimits>,
}

impl std::fmt::Debug for CapabilityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDetector")
            .field("backend", &self.backend.name())
            .field("limits", &self.limits.get())
            .finish()
    }
}

impl CapabilityDetector {
    pub fn new(backend: Arc<dyn GraphicsBackend>) -> Self {
        Self {
            backend,
            limits: OnceCell::new(),
        }
    }

    /// Detector probing the first Vulkan device of the machine
    #[cfg(feature = "vulkan")]
    pub fn native() -> Self {
        Self::new(Arc::new(crate::backend::VulkanBackend::new()))
    }

    /// Detector with limits known up front, no backend is ever probed
    pub fn with_limits(limits: GpuLimits) -> Self {
        Self {
            backend: Arc::new(crate::backend::HeadlessBackend::unavailable()),
            limits: OnceCell::new_with(Some(limits)),
        }
    }

    pub async fn detect(&self) -> GpuLimits {
        self.limits
            .get_or_init(|| async {
                let backend = self.backend.clone();
                match tokio::task::spawn_blocking(move || probe_backend(backend.as_ref())).await {
                    Ok(limits) => limits,
                    Err(e) => {
                        tracing::error!("Capability probe aborted: {e}");
                        GpuLimits::fallback(FALLBACK_TEXTURE_DIMENSION)
                    }
                }
            })
            .await
            .clone()
    }

    /// Limits, detecting first if nothing has been detected yet
    pub async fn get_limits(&self) -> GpuLimits {
        self.detect().await
    }

    pub async fn get_max_texture_dimension(&self) -> u32 {
        self.detect().await.max_texture_dimension
    }

    /// Limits if detection already ran, without triggering it
    pub fn cached_limits(&self) -> Option<&GpuLimits> {
        self.limits.get()
    }
}
