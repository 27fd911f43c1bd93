//! Rendition generation.
//!
//! Every size tier is resized concurrently on the blocking pool; the whole set
//! races one shared timeout.

use crate::error::IngestError;
use bytes::Bytes;
use futures::future::try_join_all;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionLabel {
    Large,
    Medium,
    Small,
    Thumb,
    Original,
}

impl RenditionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionLabel::Large => "large",
            RenditionLabel::Medium => "medium",
            RenditionLabel::Small => "small",
            RenditionLabel::Thumb => "thumb",
            RenditionLabel::Original => "original",
        }
    }
}

impl fmt::Display for RenditionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One derived size: longest-edge bound and encoder quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeTier {
    pub label: RenditionLabel,
    pub max_dimension: u32,
    pub quality: u8,
}

pub const SIZE_TIERS: [SizeTier; 4] = [
    SizeTier {
        label: RenditionLabel::Large,
        max_dimension: 2048,
        quality: 85,
    },
    SizeTier {
        label: RenditionLabel::Medium,
        max_dimension: 1024,
        quality: 80,
    },
    SizeTier {
        label: RenditionLabel::Small,
        max_dimension: 512,
        quality: 75,
    },
    SizeTier {
        label: RenditionLabel::Thumb,
        max_dimension: 200,
        quality: 70,
    },
];

/// Pixel size and container format of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Output of a single resize call.
#[derive(Debug, Clone)]
pub struct ResizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Opaque resize capability. Implementations must preserve aspect ratio and
/// never upscale.
pub trait ImageProcessor: Send + Sync {
    fn probe(&self, bytes: &[u8]) -> Result<ImageInfo, ImageError>;

    fn resize(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        quality: u8,
    ) -> Result<ResizedImage, ImageError>;
}

/// [`ImageProcessor`] on top of the `image` crate; re-encodes in the source format.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageRsProcessor;

impl ImageRsProcessor {
    fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, ImageError> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ImageError::Decode(e.to_string()))
    }

    fn encode(image: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Vec<u8>, ImageError> {
        let mut buffer = Vec::new();

        match format {
            ImageFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
                rgb.write_with_encoder(encoder)
                    .map_err(|e| ImageError::Encode(e.to_string()))?;
            }
            ImageFormat::WebP => {
                // The bundled WebP encoder is lossless and RGBA only
                DynamicImage::ImageRgba8(image.to_rgba8())
                    .write_to(&mut Cursor::new(&mut buffer), format)
                    .map_err(|e| ImageError::Encode(e.to_string()))?;
            }
            ImageFormat::Png | ImageFormat::Tiff => {
                image
                    .write_to(&mut Cursor::new(&mut buffer), format)
                    .map_err(|e| ImageError::Encode(e.to_string()))?;
            }
            other => return Err(ImageError::UnsupportedFormat(format!("{other:?}"))),
        }

        Ok(buffer)
    }
}

impl ImageProcessor for ImageRsProcessor {
    fn probe(&self, bytes: &[u8]) -> Result<ImageInfo, ImageError> {
        let reader = Self::reader(bytes)?;
        let format = reader
            .format()
            .ok_or_else(|| ImageError::UnsupportedFormat("unrecognised".to_string()))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ImageError::Decode(e.to_string()))?;

        Ok(ImageInfo {
            width,
            height,
            format: format_name(format).to_string(),
        })
    }

    fn resize(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        quality: u8,
    ) -> Result<ResizedImage, ImageError> {
        let reader = Self::reader(bytes)?;
        let format = reader
            .format()
            .ok_or_else(|| ImageError::UnsupportedFormat("unrecognised".to_string()))?;
        let image = reader
            .decode()
            .map_err(|e| ImageError::Decode(e.to_string()))?;

        let (width, height) = image.dimensions();
        let resized = if width <= max_width && height <= max_height {
            image
        } else {
            image.resize(max_width, max_height, FilterType::Lanczos3)
        };

        let encoded = Self::encode(&resized, format, quality)?;

        Ok(ResizedImage {
            bytes: encoded,
            width: resized.width(),
            height: resized.height(),
            format: format_name(format).to_string(),
        })
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::Tiff => "tiff",
        ImageFormat::WebP => "webp",
        _ => "other",
    }
}

/// A stored artifact of a job.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub label: RenditionLabel,
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// The derived renditions plus a probe of the original.
#[derive(Debug, Clone)]
pub struct GeneratedRenditions {
    pub original: ImageInfo,
    pub renditions: Vec<Rendition>,
}

pub struct RenditionGenerator {
    processor: Arc<dyn ImageProcessor>,
    timeout: Duration,
}

impl RenditionGenerator {
    pub fn new(processor: Arc<dyn ImageProcessor>, timeout: Duration) -> Self {
        Self { processor, timeout }
    }

    /// Probe the original's dimensions and format.
    pub async fn probe(&self, bytes: Bytes) -> Result<ImageInfo, IngestError> {
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || processor.probe(&bytes))
            .await
            .map_err(|e| IngestError::ImageProcessing(format!("probe task failed: {e}")))?
            .map_err(|e| IngestError::ImageProcessing(e.to_string()))
    }

    /// Generate every tier of [`SIZE_TIERS`], in tier order. The original is
    /// probed alongside unless `probed` already describes it.
    pub async fn generate(
        &self,
        bytes: Bytes,
        probed: Option<ImageInfo>,
    ) -> Result<GeneratedRenditions, IngestError> {
        let started = Instant::now();
        let probe_bytes = bytes.clone();
        let original = async move {
            match probed {
                Some(info) => Ok(info),
                None => self.probe(probe_bytes).await,
            }
        };

        let tiers = SIZE_TIERS.iter().map(|tier| {
            let processor = self.processor.clone();
            let bytes = bytes.clone();
            let tier = *tier;

            async move {
                let resized = tokio::task::spawn_blocking(move || {
                    processor.resize(&bytes, tier.max_dimension, tier.max_dimension, tier.quality)
                })
                .await
                .map_err(|e| {
                    IngestError::ImageProcessing(format!("{} task failed: {e}", tier.label))
                })?
                .map_err(|e| IngestError::ImageProcessing(format!("{}: {e}", tier.label)))?;

                Ok::<_, IngestError>(Rendition {
                    label: tier.label,
                    bytes: Bytes::from(resized.bytes),
                    width: resized.width,
                    height: resized.height,
                    format: resized.format,
                })
            }
        });

        let work = async { futures::try_join!(original, try_join_all(tiers)) };

        let (original, renditions) = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| IngestError::ProcessingTimeout {
                operation: "rendition generation",
                timeout: self.timeout,
            })??;

        debug!(
            width = original.width,
            height = original.height,
            format = %original.format,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Renditions generated"
        );

        Ok(GeneratedRenditions {
            original,
            renditions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn test_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut buffer), format)
            .unwrap();
        buffer
    }

    /// Reports fixed sizes without touching pixels, optionally slowly.
    struct FakeProcessor {
        delay: Duration,
    }

    impl ImageProcessor for FakeProcessor {
        fn probe(&self, _bytes: &[u8]) -> Result<ImageInfo, ImageError> {
            Ok(ImageInfo {
                width: 4000,
                height: 3000,
                format: "jpeg".to_string(),
            })
        }

        fn resize(
            &self,
            _bytes: &[u8],
            max_width: u32,
            _max_height: u32,
            _quality: u8,
        ) -> Result<ResizedImage, ImageError> {
            std::thread::sleep(self.delay);
            Ok(ResizedImage {
                bytes: vec![0; 8],
                width: max_width,
                height: max_width * 3 / 4,
                format: "jpeg".to_string(),
            })
        }
    }

    #[test]
    fn test_resize_preserves_aspect_ratio() {
        let png = test_image(600, 400, ImageFormat::Png);
        let resized = ImageRsProcessor.resize(&png, 200, 200, 70).unwrap();

        assert_eq!(resized.width, 200);
        assert_eq!(resized.height, 133);
        assert_eq!(resized.format, "png");
    }

    #[test]
    fn test_resize_never_upscales() {
        let jpeg = test_image(300, 200, ImageFormat::Jpeg);
        let resized = ImageRsProcessor.resize(&jpeg, 2048, 2048, 85).unwrap();

        assert_eq!((resized.width, resized.height), (300, 200));
        assert_eq!(resized.format, "jpeg");
        assert_eq!(ImageRsProcessor.probe(&resized.bytes).unwrap().width, 300);
    }

    #[test]
    fn test_reads_image_info() {
        let png = test_image(64, 48, ImageFormat::Png);
        assert_eq!(
            ImageRsProcessor.probe(&png).unwrap(),
            ImageInfo {
                width: 64,
                height: 48,
                format: "png".to_string()
            }
        );
        assert!(ImageRsProcessor.probe(b"not an image").is_err());
    }

    #[tokio::test]
    async fn test_generate_all_tiers_in_order() {
        let generator = RenditionGenerator::new(Arc::new(ImageRsProcessor), Duration::from_secs(30));
        let jpeg = Bytes::from(test_image(1200, 800, ImageFormat::Jpeg));

        let generated = generator.generate(jpeg, None).await.unwrap();

        assert_eq!(generated.original.width, 1200);
        let labels: Vec<_> = generated.renditions.iter().map(|r| r.label).collect();
        assert_eq!(
            labels,
            vec![
                RenditionLabel::Large,
                RenditionLabel::Medium,
                RenditionLabel::Small,
                RenditionLabel::Thumb
            ]
        );
        let sizes: Vec<_> = generated
            .renditions
            .iter()
            .map(|r| (r.width, r.height))
            .collect();
        assert_eq!(sizes, vec![(1200, 800), (1024, 683), (512, 341), (200, 133)]);
    }

    #[tokio::test]
    async fn test_generate_reuses_known_dimensions() {
        let generator = RenditionGenerator::new(
            Arc::new(FakeProcessor {
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );
        let known = ImageInfo {
            width: 640,
            height: 480,
            format: "jpeg".to_string(),
        };

        let generated = generator
            .generate(Bytes::from_static(b"jpeg"), Some(known.clone()))
            .await
            .unwrap();

        // FakeProcessor would report 4000x3000 if it were probed again
        assert_eq!(generated.original, known);
        assert_eq!(generated.renditions.len(), 4);
    }

    #[tokio::test]
    async fn test_generate_times_out() {
        let generator = RenditionGenerator::new(
            Arc::new(FakeProcessor {
                delay: Duration::from_millis(500),
            }),
            Duration::from_millis(20),
        );

        match generator.generate(Bytes::from_static(b"jpeg"), None).await {
            Err(IngestError::ProcessingTimeout { operation, .. }) => {
                assert_eq!(operation, "rendition generation")
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_rejects_undecodable_input() {
        let generator = RenditionGenerator::new(Arc::new(ImageRsProcessor), Duration::from_secs(5));
        assert!(matches!(
            generator.generate(Bytes::from_static(b"garbage"), None).await,
            Err(IngestError::ImageProcessing(_))
        ));
    }
}
