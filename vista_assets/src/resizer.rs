//! Progressive downscaling of panoramas to fit under the GPU texture limit.
//!
//! Small reductions are resampled in one pass. Large reductions (less than half the pixels kept)
//! go through a chain of 0.7x steps, each one re-encoded and decoded again, before a final pass
//! to the exact target.

use bytes::Bytes;
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::sync::Arc;
use thiserror::Error;

/// Below this ratio of kept pixels the multi-step path is used
pub const MULTI_STEP_THRESHOLD: f64 = 0.5;
/// Each intermediate step keeps this fraction of both dimensions
pub const STEP_FACTOR: f64 = 0.7;
/// Intermediate steps stop once both dimensions are within this factor of the target
pub const STEP_SLACK: f64 = 1.5;
pub const DEFAULT_ENCODE_QUALITY: f32 = 0.92;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResizeError {
    #[error("Expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },
    #[error("Resized image has an empty dimension")]
    EmptyDimension,
    #[error("Dimension {dimension} exceeds the texture limit {max_dimension}")]
    ExceedsLimit { dimension: u32, max_dimension: u32 },
    #[error("Failed to encode resized image: {0}")]
    Encode(String),
    #[error("Failed to decode resized image: {0}")]
    Decode(String),
    #[error("Resize task did not complete: {0}")]
    Aborted(String),
}

impl ResizeError {
    /// Whether an image was produced but has the wrong dimensions
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ResizeError::DimensionMismatch { .. }
                | ResizeError::EmptyDimension
                | ResizeError::ExceedsLimit { .. }
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    pub needs_resize: bool,
    pub target_width: u32,
    pub target_height: u32,
}

/// Fit `width`x`height` under `max_dimension`, preserving the aspect ratio.
///
/// The longer side becomes exactly `max_dimension`; the other is rounded proportionally and
/// never drops below one pixel.
pub fn plan_resize(width: u32, height: u32, max_dimension: u32) -> ResizePlan {
    let longest = width.max(height);
    if longest <= max_dimension {
        return ResizePlan {
            needs_resize: false,
            target_width: width,
            target_height: height,
        };
    }
    let scaled = |side: u32| -> u32 {
        ((side as f64 / longest as f64) * max_dimension as f64)
            .round()
            .max(1.0) as u32
    };
    let (target_width, target_height) = if width >= height {
        (max_dimension, scaled(height))
    } else {
        (scaled(width), max_dimension)
    };
    ResizePlan {
        needs_resize: true,
        target_width,
        target_height,
    }
}

/// Ratio of target pixels to source pixels
pub fn reduction_factor(source: (u32, u32), target: (u32, u32)) -> f64 {
    (target.0 as f64 * target.1 as f64) / (source.0 as f64 * source.1 as f64)
}

/// Intermediate sizes visited before the final pass, in order.
///
/// Empty when the direct path applies. Every step shrinks the oversized dimensions to 70% and
/// never undershoots the target.
pub fn plan_steps(source: (u32, u32), target: (u32, u32)) -> Vec<(u32, u32)> {
    let mut steps = Vec::new();
    if target.0 == 0 || target.1 == 0 || reduction_factor(source, target) >= MULTI_STEP_THRESHOLD {
        return steps;
    }
    let (mut width, mut height) = source;
    while width as f64 > target.0 as f64 * STEP_SLACK || height as f64 > target.1 as f64 * STEP_SLACK
    {
        let step_width = ((width as f64 * STEP_FACTOR).round() as u32).max(target.0);
        let step_height = ((height as f64 * STEP_FACTOR).round() as u32).max(target.1);
        if (step_width, step_height) == (width, height) {
            // rounding stalled, the final pass takes over
            break;
        }
        width = step_width;
        height = step_height;
        steps.push((width, height));
    }
    steps
}

/// Check a produced image against what was asked for.
///
/// `max_dimension` is only enforced on final outputs; intermediates are larger than the target by
/// construction.
pub fn validate_dimensions(
    width: u32,
    height: u32,
    expected: (u32, u32),
    max_dimension: Option<u32>,
) -> Result<(), ResizeError> {
    if (width, height) != expected {
        return Err(ResizeError::DimensionMismatch {
            expected_width: expected.0,
            expected_height: expected.1,
            width,
            height,
        });
    }
    if width == 0 || height == 0 {
        return Err(ResizeError::EmptyDimension);
    }
    if let Some(max_dimension) = max_dimension {
        let dimension = width.max(height);
        if dimension > max_dimension {
            return Err(ResizeError::ExceedsLimit {
                dimension,
                max_dimension,
            });
        }
    }
    Ok(())
}

/// JPEG bytes with the dimensions they decode to
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResizeReport {
    pub original_dimensions: (u32, u32),
    pub final_dimensions: (u32, u32),
    /// Intermediate sizes, empty for a direct resize
    pub steps: Vec<(u32, u32)>,
    pub encoded_bytes: usize,
    /// RGBA memory saved on the GPU compared to the original
    pub memory_savings_mb: f64,
}

#[derive(Debug, Clone)]
pub enum ResizedImage {
    /// No resize was needed, the input is handed back untouched
    Original(Arc<DynamicImage>),
    Resized {
        image: EncodedImage,
        report: ResizeReport,
    },
}

#[derive(Debug, Copy, Clone)]
pub struct ProgressiveResizer {
    encode_quality: u8,
}

impl Default for ProgressiveResizer {
    fn default() -> Self {
        Self::new(DEFAULT_ENCODE_QUALITY)
    }
}

impl ProgressiveResizer {
    /// `encode_quality` is the JPEG quality in `(0, 1]`
    pub fn new(encode_quality: f32) -> Self {
        Self {
            encode_quality: (encode_quality * 100.0).round().clamp(1.0, 100.0) as u8,
        }
    }

    /// JPEG quality on the encoder's 1-100 scale
    pub fn encode_quality(&self) -> u8 {
        self.encode_quality
    }

    pub async fn resize(
        &self,
        image: Arc<DynamicImage>,
        plan: &ResizePlan,
        max_dimension: u32,
    ) -> Result<ResizedImage, ResizeError> {
        if !plan.needs_resize {
            return Ok(ResizedImage::Original(image));
        }
        let source = (image.width(), image.height());
        let target = (plan.target_width, plan.target_height);
        let steps = plan_steps(source, target);
        if steps.is_empty() {
            tracing::debug!("Direct resize {:?} -> {:?}", source, target);
        } else {
            tracing::debug!(
                steps = steps.len(),
                "Large reduction ({:.2}), resizing {:?} -> {:?} in steps",
                reduction_factor(source, target),
                source,
                target
            );
        }

        let mut current = image;
        for &(width, height) in &steps {
            tracing::trace!(
                "Step {}x{} -> {}x{}",
                current.width(),
                current.height(),
                width,
                height
            );
            let encoded = self.resize_direct(current, width, height).await?;
            current = Arc::new(decode_validated(encoded, None).await?);
        }

        let encoded = self.resize_direct(current, target.0, target.1).await?;
        // validate what a consumer will actually decode
        decode_validated(encoded.clone(), Some(max_dimension)).await?;

        let pixels = |(w, h): (u32, u32)| w as f64 * h as f64 * 4.0 / BYTES_PER_MB;
        let report = ResizeReport {
            original_dimensions: source,
            final_dimensions: target,
            steps,
            encoded_bytes: encoded.bytes.len(),
            memory_savings_mb: pixels(source) - pixels(target),
        };
        tracing::debug!(
            "Resized to {}x{}, saving {:.1}MB of texture memory",
            target.0,
            target.1,
            report.memory_savings_mb
        );
        Ok(ResizedImage::Resized {
            image: encoded,
            report,
        })
    }

    /// Resample once and encode as JPEG
    async fn resize_direct(
        &self,
        image: Arc<DynamicImage>,
        width: u32,
        height: u32,
    ) -> Result<EncodedImage, ResizeError> {
        let quality = self.encode_quality;
        tokio::task::spawn_blocking(move || {
            let resized = image.resize_exact(width, height, RESAMPLE_FILTER);
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
            let mut buffer = Vec::new();
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
                .map_err(|e| ResizeError::Encode(e.to_string()))?;
            Ok(EncodedImage {
                bytes: Bytes::from(buffer),
                width,
                height,
            })
        })
        .await
        .map_err(|e| ResizeError::Aborted(e.to_string()))?
    }
}

async fn decode_validated(
    encoded: EncodedImage,
    max_dimension: Option<u32>,
) -> Result<DynamicImage, ResizeError> {
    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&encoded.bytes))
        .await
        .map_err(|e| ResizeError::Aborted(e.to_string()))?
        .map_err(|e| ResizeError::Decode(e.to_string()))?;
    validate_dimensions(
        decoded.width(),
        decoded.height(),
        (encoded.width, encoded.height),
        max_dimension,
    )?;
    Ok(decoded)
}
