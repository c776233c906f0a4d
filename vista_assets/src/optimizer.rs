//! Sampler configuration and memory accounting for loaded textures.

use std::fmt;
use vista_gpu::{FilterMode, LoadedTexture, WrapMode};

/// Highest anisotropy worth paying for on a panorama
pub const PANORAMA_MAX_ANISOTROPY: u8 = 4;
/// Extra memory taken by a full mip chain
pub const MIPMAP_OVERHEAD: f64 = 1.33;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QualityPreset {
    Low,
    Balanced,
    High,
}

impl QualityPreset {
    pub fn sampler_config(self) -> SamplerConfig {
        match self {
            QualityPreset::Low => SamplerConfig {
                min_filter: Some(FilterMode::Linear),
                mag_filter: Some(FilterMode::Linear),
                anisotropy: Some(1),
                generate_mipmaps: Some(false),
                ..Default::default()
            },
            QualityPreset::Balanced => SamplerConfig {
                min_filter: Some(FilterMode::Linear),
                mag_filter: Some(FilterMode::Linear),
                anisotropy: Some(2),
                generate_mipmaps: Some(false),
                ..Default::default()
            },
            QualityPreset::High => SamplerConfig {
                min_filter: Some(FilterMode::LinearMipmapLinear),
                mag_filter: Some(FilterMode::Linear),
                anisotropy: Some(4),
                generate_mipmaps: Some(true),
                ..Default::default()
            },
        }
    }
}

/// Partial sampler override; `None` fields are left untouched
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SamplerConfig {
    pub min_filter: Option<FilterMode>,
    pub mag_filter: Option<FilterMode>,
    pub wrap_s: Option<WrapMode>,
    pub wrap_t: Option<WrapMode>,
    pub anisotropy: Option<u8>,
    pub generate_mipmaps: Option<bool>,
}

/// A sampler property that differs between two textures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerDifference {
    pub property: &'static str,
    pub left: String,
    pub right: String,
}

impl fmt::Display for SamplerDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} vs {}", self.property, self.left, self.right)
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct TextureOptimizer {
    backend_max_anisotropy: Option<u8>,
}

impl TextureOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anisotropy is never raised above what the device supports
    pub fn with_max_anisotropy(backend_max_anisotropy: u8) -> Self {
        Self {
            backend_max_anisotropy: Some(backend_max_anisotropy.max(1)),
        }
    }

    pub fn backend_max_anisotropy(&self) -> Option<u8> {
        self.backend_max_anisotropy
    }

    /// Linear filtering, seamless horizontal wrap and clamped poles, no mipmaps
    pub fn optimize_for_panorama<'a>(&self, texture: &'a mut LoadedTexture) -> &'a mut LoadedTexture {
        texture.min_filter = FilterMode::Linear;
        texture.mag_filter = FilterMode::Linear;
        texture.wrap_s = WrapMode::Repeat;
        texture.wrap_t = WrapMode::ClampToEdge;
        if let Some(max) = self.backend_max_anisotropy {
            texture.anisotropy = PANORAMA_MAX_ANISOTROPY.min(max);
        }
        texture.generate_mipmaps = false;
        texture.needs_update = true;
        tracing::debug!(
            id = %texture.id(),
            width = texture.width(),
            height = texture.height(),
            anisotropy = texture.anisotropy,
            memory_mb = self.estimate_memory_usage_mb(texture),
            "Optimized texture for panorama"
        );
        texture
    }

    pub fn apply_quality_preset<'a>(
        &self,
        texture: &'a mut LoadedTexture,
        preset: QualityPreset,
    ) -> &'a mut LoadedTexture {
        self.apply_config(texture, preset.sampler_config());
        tracing::debug!(
            id = %texture.id(),
            preset = ?preset,
            memory_mb = self.estimate_memory_usage_mb(texture),
            "Applied quality preset"
        );
        texture
    }

    pub fn apply_config<'a>(
        &self,
        texture: &'a mut LoadedTexture,
        config: SamplerConfig,
    ) -> &'a mut LoadedTexture {
        if let Some(filter) = config.min_filter {
            texture.min_filter = filter;
        }
        if let Some(filter) = config.mag_filter {
            texture.mag_filter = filter;
        }
        if let Some(wrap) = config.wrap_s {
            texture.wrap_s = wrap;
        }
        if let Some(wrap) = config.wrap_t {
            texture.wrap_t = wrap;
        }
        if let Some(anisotropy) = config.anisotropy {
            texture.anisotropy = match self.backend_max_anisotropy {
                Some(max) => anisotropy.clamp(1, max),
                None => anisotropy.max(1),
            };
        }
        if let Some(generate_mipmaps) = config.generate_mipmaps {
            texture.generate_mipmaps = generate_mipmaps;
        }
        texture.needs_update = true;
        tracing::trace!(id = %texture.id(), config = ?config, "Applied sampler config");
        texture
    }

    /// GPU memory the texture occupies as RGBA8, in MB
    pub fn estimate_memory_usage_mb(&self, texture: &LoadedTexture) -> f64 {
        if texture.pixels().is_none() {
            return 0.0;
        }
        let bytes = texture.width() as f64 * texture.height() as f64 * 4.0;
        let multiplier = if texture.generate_mipmaps {
            MIPMAP_OVERHEAD
        } else {
            1.0
        };
        bytes * multiplier / BYTES_PER_MB
    }

    /// Dispose `texture`, returning the memory it released
    pub fn dispose(&self, mut texture: LoadedTexture) -> f64 {
        let freed = self.estimate_memory_usage_mb(&texture);
        texture.dispose();
        tracing::debug!(id = %texture.id(), freed_mb = freed, "Released texture");
        freed
    }

    pub fn dispose_all(&self, textures: impl IntoIterator<Item = LoadedTexture>) -> f64 {
        let mut count = 0usize;
        let mut freed = 0.0;
        for mut texture in textures {
            freed += self.estimate_memory_usage_mb(&texture);
            texture.dispose();
            count += 1;
        }
        tracing::debug!(freed_mb = freed, "Released {count} textures");
        freed
    }

    /// Sampler properties that differ between `left` and `right`
    pub fn compare(&self, left: &LoadedTexture, right: &LoadedTexture) -> Vec<SamplerDifference> {
        fn diff<T: fmt::Debug + PartialEq>(
            differences: &mut Vec<SamplerDifference>,
            property: &'static str,
            left: T,
            right: T,
        ) {
            if left != right {
                differences.push(SamplerDifference {
                    property,
                    left: format!("{left:?}"),
                    right: format!("{right:?}"),
                });
            }
        }

        let mut differences = Vec::new();
        diff(&mut differences, "min_filter", left.min_filter, right.min_filter);
        diff(&mut differences, "mag_filter", left.mag_filter, right.mag_filter);
        diff(&mut differences, "wrap_s", left.wrap_s, right.wrap_s);
        diff(&mut differences, "wrap_t", left.wrap_t, right.wrap_t);
        diff(&mut differences, "anisotropy", left.anisotropy, right.anisotropy);
        diff(
            &mut differences,
            "generate_mipmaps",
            left.generate_mipmaps,
            right.generate_mipmaps,
        );
        for difference in &differences {
            tracing::debug!("Texture {} vs {}: {difference}", left.id(), right.id());
        }
        tracing::debug!(
            "Texture memory {:.1}MB vs {:.1}MB",
            self.estimate_memory_usage_mb(left),
            self.estimate_memory_usage_mb(right)
        );
        differences
    }
}
