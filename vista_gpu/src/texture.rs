use derivative::Derivative;
use image::DynamicImage;
use std::sync::Arc;
use uuid::Uuid;

#[cfg(feature = "vulkan")]
use ash::vk;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
    /// Trilinear, only meaningful with mipmaps
    LinearMipmapLinear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WrapMode {
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

#[cfg(feature = "vulkan")]
impl From<WrapMode> for vk::SamplerAddressMode {
    fn from(value: WrapMode) -> Self {
        match value {
            WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
            WrapMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        }
    }
}

#[cfg(feature = "vulkan")]
impl From<FilterMode> for vk::Filter {
    fn from(value: FilterMode) -> Self {
        match value {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear | FilterMode::LinearMipmapLinear => vk::Filter::LINEAR,
        }
    }
}

/// A decoded image plus the sampling state it is meant to be bound with.
///
/// Exactly one scene owns a texture at a time. [`LoadedTexture::dispose`] releases the pixel
/// payload; dropping a texture that was never disposed is reported as a leak.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct LoadedTexture {
    id: Uuid,
    width: u32,
    height: u32,
    #[derivative(Debug = "ignore")]
    pixels: Option<Arc<DynamicImage>>,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    /// Horizontal addressing
    pub wrap_s: WrapMode,
    /// Vertical addressing
    pub wrap_t: WrapMode,
    pub anisotropy: u8,
    pub generate_mipmaps: bool,
    /// Sampler state changed since the texture was last bound
    pub needs_update: bool,
    disposed: bool,
}

impl LoadedTexture {
    /// Wraps decoded pixels with generic sampler defaults (trilinear, clamped, mipmapped)
    pub fn new(pixels: Arc<DynamicImage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            width: pixels.width(),
            height: pixels.height(),
            pixels: Some(pixels),
            min_filter: FilterMode::LinearMipmapLinear,
            mag_filter: FilterMode::Linear,
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            anisotropy: 1,
            generate_mipmaps: true,
            needs_update: true,
            disposed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `None` once disposed
    pub fn pixels(&self) -> Option<&Arc<DynamicImage>> {
        self.pixels.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release the pixel payload.
    ///
    /// Returns `false` if the texture had already been disposed, in which case nothing happens.
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            tracing::warn!(id = %self.id, "Texture disposed twice");
            return false;
        }
        self.pixels = None;
        self.disposed = true;
        tracing::trace!(id = %self.id, "Disposed texture");
        true
    }

    #[cfg(feature = "vulkan")]
    pub fn sampler_create_info(&self) -> vk::SamplerCreateInfo<'static> {
        let mipmap_mode = match self.min_filter {
            FilterMode::LinearMipmapLinear => vk::SamplerMipmapMode::LINEAR,
            _ => vk::SamplerMipmapMode::NEAREST,
        };
        vk::SamplerCreateInfo::default()
            .min_filter(self.min_filter.into())
            .mag_filter(self.mag_filter.into())
            .mipmap_mode(mipmap_mode)
            .address_mode_u(self.wrap_s.into())
            .address_mode_v(self.wrap_t.into())
            .address_mode_w(self.wrap_t.into())
            .anisotropy_enable(self.anisotropy > 1)
            .max_anisotropy(self.anisotropy as f32)
            .max_lod(if self.generate_mipmaps {
                vk::LOD_CLAMP_NONE
            } else {
                0.0
            })
    }
}

impl Drop for LoadedTexture {
    fn drop(&mut self) {
        if !self.disposed {
            tracing::warn!(id = %self.id, "Texture dropped without being disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(width: u32, height: u32) -> LoadedTexture {
        LoadedTexture::new(Arc::new(DynamicImage::new_rgba8(width, height)))
    }

    #[test]
    fn test_dimensions_follow_pixels() {
        let mut texture = texture(64, 32);
        assert_eq!((texture.width(), texture.height()), (64, 32));
        assert!(texture.pixels().is_some());
        texture.dispose();
    }

    #[test]
    fn test_dispose_once() {
        let mut texture = texture(8, 4);
        assert!(texture.dispose());
        assert!(texture.is_disposed());
        assert!(texture.pixels().is_none());
        assert!(!texture.dispose());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut a = texture(2, 1);
        let mut b = texture(2, 1);
        assert_ne!(a.id(), b.id());
        a.dispose();
        b.dispose();
    }

    #[cfg(feature = "vulkan")]
    #[test]
    fn test_sampler_create_info() {
        let mut texture = texture(4, 2);
        texture.min_filter = FilterMode::Linear;
        texture.wrap_s = WrapMode::Repeat;
        texture.anisotropy = 4;
        texture.generate_mipmaps = false;

        let info = texture.sampler_create_info();
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 4.0);
        assert_eq!(info.max_lod, 0.0);
        texture.dispose();
    }
}
