use derivative::Derivative;
use thiserror::Error;
use vista_assets::cache::{CacheBudget, DEFAULT_ITEM_BUDGET, DEFAULT_MEMORY_BUDGET_MB};
use vista_assets::optimizer::PANORAMA_MAX_ANISOTROPY;
use vista_assets::resizer::DEFAULT_ENCODE_QUALITY;
use vista_assets::{QualityPreset, RetryPolicy};

/// Equirectangular panoramas cover 360 by 180 degrees
pub const EQUIRECTANGULAR_ASPECT_RATIO: f64 = 2.0;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Relative aspect ratio deviation tolerated before it is reported
const ASPECT_RATIO_TOLERANCE: f64 = 0.01;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Cache item budget must be at least 1")]
    ZeroItemBudget,
    #[error("Cache memory budget must be positive, got {0}MB")]
    InvalidMemoryBudget(f64),
    #[error("Encode quality must be in (0, 1], got {0}")]
    InvalidEncodeQuality(f32),
    #[error("Target aspect ratio must be positive, got {0}")]
    InvalidAspectRatio(f64),
    #[error("At least one load attempt is required")]
    ZeroRetries,
}

#[derive(Derivative, Clone, PartialEq)]
#[derivative(Debug, Default)]
pub struct PipelineConfig {
    #[derivative(Default(value = "DEFAULT_ITEM_BUDGET"))]
    pub item_budget: usize,
    #[derivative(Default(value = "DEFAULT_MEMORY_BUDGET_MB"))]
    pub memory_budget_mb: f64,
    /// Expected width / height of sources. Only used for diagnostics.
    #[derivative(Default(value = "EQUIRECTANGULAR_ASPECT_RATIO"))]
    pub target_aspect_ratio: f64,
    /// JPEG quality of resized panoramas, in `(0, 1]`
    #[derivative(Default(value = "DEFAULT_ENCODE_QUALITY"))]
    pub encode_quality: f32,
    /// Total load attempts for a source
    #[derivative(Default(value = "DEFAULT_MAX_RETRIES"))]
    pub max_retries: u32,
    pub retry: RetryPolicy,
    #[derivative(Default(value = "PANORAMA_MAX_ANISOTROPY"))]
    pub max_anisotropy: u8,
    /// Applied on top of the panorama sampler configuration
    pub quality: Option<QualityPreset>,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.item_budget == 0 {
            return Err(ConfigError::ZeroItemBudget);
        }
        if !(self.memory_budget_mb > 0.0) {
            return Err(ConfigError::InvalidMemoryBudget(self.memory_budget_mb));
        }
        if !(self.encode_quality > 0.0 && self.encode_quality <= 1.0) {
            return Err(ConfigError::InvalidEncodeQuality(self.encode_quality));
        }
        if !(self.target_aspect_ratio > 0.0) {
            return Err(ConfigError::InvalidAspectRatio(self.target_aspect_ratio));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        Ok(())
    }

    pub fn cache_budget(&self) -> CacheBudget {
        CacheBudget {
            item_budget: self.item_budget,
            memory_budget_mb: self.memory_budget_mb,
        }
    }

    /// Whether `width`x`height` strays from the target aspect ratio by more than 1%
    pub fn deviates_from_aspect_ratio(&self, width: u32, height: u32) -> bool {
        if height == 0 {
            return true;
        }
        let ratio = width as f64 / height as f64;
        (ratio - self.target_aspect_ratio).abs() / self.target_aspect_ratio > ASPECT_RATIO_TOLERANCE
    }
}
