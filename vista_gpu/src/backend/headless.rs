use super::{GraphicsBackend, ProbeContext};
use crate::GpuError;
use derivative::Derivative;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Result code reported for refused allocations, mirrors `VK_ERROR_OUT_OF_DEVICE_MEMORY`
const OUT_OF_DEVICE_MEMORY: i32 = -2;

/// Describes the device a [`HeadlessBackend`] pretends to be
#[derive(Derivative, Clone)]
#[derivative(Debug, Default)]
pub struct HeadlessConfig {
    /// Whether a probe context can be created at all
    #[derivative(Default(value = "true"))]
    pub available: bool,
    /// What the driver reports as its maximum texture dimension
    #[derivative(Default(value = "16384"))]
    pub max_texture_dimension: u32,
    #[derivative(Default(value = "16"))]
    pub max_texture_units: u32,
    #[derivative(Default(value = "32"))]
    pub max_combined_units: u32,
    #[derivative(Default(value = "16.0"))]
    pub max_anisotropy: f32,
    #[derivative(Default(value = "String::from(\"Headless Software Rasterizer\")"))]
    pub renderer_name: String,
    #[derivative(Default(value = "String::from(\"vista\")"))]
    pub vendor_name: String,
    /// Largest dimension that can actually be allocated. `None` means whatever is reported.
    pub allocation_limit: Option<u32>,
    /// Make test allocations fail with a probe fault instead of a rejection
    pub fault_on_allocate: bool,
}

/// Software backend with configurable limits.
///
/// Used wherever no GPU is present (CI, servers pre-processing assets) and to reproduce driver
/// quirks such as over-reported texture limits.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    config: HeadlessConfig,
    probes_opened: AtomicUsize,
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            probes_opened: AtomicUsize::new(0),
        }
    }

    /// A backend on which no context can ever be created
    pub fn unavailable() -> Self {
        Self::new(HeadlessConfig {
            available: false,
            ..Default::default()
        })
    }

    /// A well-behaved device whose reported limit is also its real limit
    pub fn with_max_texture_dimension(max_texture_dimension: u32) -> Self {
        Self::new(HeadlessConfig {
            max_texture_dimension,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    /// Number of probe contexts requested so far, successful or not
    pub fn probe_count(&self) -> usize {
        self.probes_opened.load(Ordering::Acquire)
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn open_probe(&self) -> Result<Box<dyn ProbeContext + '_>, GpuError> {
        self.probes_opened.fetch_add(1, Ordering::AcqRel);
        if !self.config.available {
            return Err(GpuError::ContextUnavailable(
                "headless backend is configured as unavailable".to_string(),
            ));
        }
        Ok(Box::new(HeadlessProbe {
            config: &self.config,
        }))
    }
}

struct HeadlessProbe<'a> {
    config: &'a HeadlessConfig,
}

impl ProbeContext for HeadlessProbe<'_> {
    fn max_texture_dimension(&self) -> u32 {
        self.config.max_texture_dimension
    }

    fn max_texture_units(&self) -> u32 {
        self.config.max_texture_units
    }

    fn max_combined_units(&self) -> u32 {
        self.config.max_combined_units
    }

    fn max_anisotropy(&self) -> f32 {
        self.config.max_anisotropy
    }

    fn renderer_name(&self) -> String {
        self.config.renderer_name.clone()
    }

    fn vendor_name(&self) -> String {
        self.config.vendor_name.clone()
    }

    fn allocate_test_texture(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        if self.config.fault_on_allocate {
            return Err(GpuError::ProbeFault(
                "headless device lost during test allocation".to_string(),
            ));
        }
        let limit = self
            .config
            .allocation_limit
            .unwrap_or(self.config.max_texture_dimension);
        if width.max(height) > limit || width == 0 || height == 0 {
            return Err(GpuError::AllocationRejected {
                width,
                height,
                code: OUT_OF_DEVICE_MEMORY,
            });
        }
        Ok(())
    }
}
