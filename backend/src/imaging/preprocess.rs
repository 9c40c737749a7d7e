use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, Limits, RgbImage};
use ndarray::Array3;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;

use crate::config::ImageConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidImageError {
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("Image is empty")]
    Empty,
    #[error("Image too large: {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("Image could not be decoded: {0}")]
    Decode(String),
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Image dimensions too small: {width}x{height} (minimum {min} pixels per side)")]
    TooSmall { width: u32, height: u32, min: u32 },
    #[error("Image dimensions too large: {width}x{height} (maximum {max} pixels per side)")]
    TooLargeDimensions { width: u32, height: u32, max: u32 },
    #[error("Unsupported channel layout: {0}")]
    UnsupportedChannels(String),
}

/// Classifier-ready image: CHW tensor plus the RGB rendition it was computed from.
///
/// Tensor and rendition share the same spatial grid, so pixel coordinates from the
/// attention map, lesion mask and tensor line up. The decoded photograph is kept
/// at full resolution for the overlay.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    tensor: Array3<f32>,
    rgb: RgbImage,
    source: Arc<RgbImage>,
    digest: String,
}

impl NormalizedImage {
    /// Resizes and normalizes an already decoded RGB image.
    pub fn from_rgb(source: &RgbImage, config: &ImageConfig) -> Self {
        let digest = calculate_image_hash(source.as_raw());
        Self::build(source.clone(), config, digest)
    }

    fn build(source: RgbImage, config: &ImageConfig, digest: String) -> Self {
        let [width, height] = config.size;
        let rgb = if source.dimensions() == (width, height) {
            source.clone()
        } else {
            imageops::resize(&source, width, height, FilterType::Triangle)
        };

        let mean = config.mean;
        let std = config.std;
        let tensor = Array3::from_shape_fn(
            (3, height as usize, width as usize),
            |(c, y, x)| {
                let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
                (value - mean[c]) / std[c]
            },
        );

        Self {
            tensor,
            rgb,
            source: Arc::new(source),
            digest,
        }
    }

    pub fn tensor(&self) -> &Array3<f32> {
        &self.tensor
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// The decoded photograph before resizing.
    pub fn source(&self) -> &RgbImage {
        &self.source
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn source_dimensions(&self) -> (u32, u32) {
        self.source.dimensions()
    }

    /// Source pixels per normalized pixel along x and y.
    pub fn source_scale(&self) -> (f32, f32) {
        let (source_w, source_h) = self.source_dimensions();
        (
            source_w as f32 / self.width() as f32,
            source_h as f32 / self.height() as f32,
        )
    }

    /// SHA-256 of the bytes the image was decoded from.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

pub fn calculate_image_hash(image_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_data);
    hex::encode(hasher.finalize())
}

/// Decodes, checks and normalizes uploaded photographs.
#[derive(Debug, Clone)]
pub struct ImageValidator {
    config: ImageConfig,
    max_bytes: usize,
}

impl ImageValidator {
    pub fn new(config: ImageConfig, max_bytes: usize) -> Self {
        Self { config, max_bytes }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn validate(
        &self,
        image_data: &[u8],
        content_type: &str,
    ) -> Result<NormalizedImage, InvalidImageError> {
        let declared = normalize_content_type(content_type);
        if !self.is_allowed(&declared) {
            return Err(InvalidImageError::UnsupportedContentType(
                content_type.to_string(),
            ));
        }
        if image_data.is_empty() {
            return Err(InvalidImageError::Empty);
        }
        if image_data.len() > self.max_bytes {
            return Err(InvalidImageError::TooLarge {
                size: image_data.len(),
                limit: self.max_bytes,
            });
        }

        let format = reader(image_data)?
            .format()
            .ok_or_else(|| InvalidImageError::Decode("unrecognized image container".into()))?;
        let sniffed = format.to_mime_type();
        if !self.is_allowed(sniffed) {
            return Err(InvalidImageError::UnsupportedFormat(format!("{:?}", format)));
        }

        let (width, height) = reader(image_data)?
            .into_dimensions()
            .map_err(|e| InvalidImageError::Decode(e.to_string()))?;
        self.check_dimensions(width, height)?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.config.max_dimension);
        limits.max_image_height = Some(self.config.max_dimension);

        let mut decoder = reader(image_data)?;
        decoder.limits(limits);
        let decoded = decoder
            .decode()
            .map_err(|e| InvalidImageError::Decode(e.to_string()))?;
        let rgb = into_rgb(decoded)?;

        log::debug!(
            "Decoded {:?} image {}x{} ({} bytes)",
            format,
            width,
            height,
            image_data.len()
        );

        Ok(NormalizedImage::build(
            rgb,
            &self.config,
            calculate_image_hash(image_data),
        ))
    }

    fn is_allowed(&self, content_type: &str) -> bool {
        self.config
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
    }

    fn check_dimensions(&self, width: u32, height: u32) -> Result<(), InvalidImageError> {
        let min = self.config.min_dimension;
        let max = self.config.max_dimension;
        if width < min || height < min {
            return Err(InvalidImageError::TooSmall { width, height, min });
        }
        if width > max || height > max {
            return Err(InvalidImageError::TooLargeDimensions { width, height, max });
        }
        Ok(())
    }
}

fn reader(image_data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, InvalidImageError> {
    ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| InvalidImageError::Decode(e.to_string()))
}

fn normalize_content_type(content_type: &str) -> String {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-ms-bmp" => "image/bmp".to_string(),
        _ => essence,
    }
}

fn into_rgb(decoded: DynamicImage) -> Result<RgbImage, InvalidImageError> {
    match decoded {
        DynamicImage::ImageRgb8(rgb) => Ok(rgb),
        other @ (DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_)
        | DynamicImage::ImageRgb32F(_)
        | DynamicImage::ImageRgba32F(_)) => Ok(other.to_rgb8()),
        other => Err(InvalidImageError::UnsupportedChannels(format!(
            "{:?}",
            other.color()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    fn validator() -> ImageValidator {
        ImageValidator::new(ImageConfig::default(), 10 * 1024 * 1024)
    }

    #[test]
    fn rejects_images_below_minimum_side() {
        let bytes = encode(&RgbImage::from_pixel(10, 10, Rgb([120, 90, 80])), ImageFormat::Png);
        let err = validator().validate(&bytes, "image/png").unwrap_err();
        assert_eq!(
            err,
            InvalidImageError::TooSmall {
                width: 10,
                height: 10,
                min: 100
            }
        );
    }

    #[test]
    fn rejects_undecodable_bytes() {
        let err = validator()
            .validate(b"definitely not an image", "image/jpeg")
            .unwrap_err();
        assert!(matches!(err, InvalidImageError::Decode(_)));
    }

    #[test]
    fn rejects_oversized_payload_before_decoding() {
        let bytes = encode(&RgbImage::from_pixel(128, 128, Rgb([1, 2, 3])), ImageFormat::Png);
        let small = ImageValidator::new(ImageConfig::default(), 64);
        let err = small.validate(&bytes, "image/png").unwrap_err();
        assert!(matches!(err, InvalidImageError::TooLarge { limit: 64, .. }));
    }

    #[test]
    fn rejects_disallowed_content_type() {
        let bytes = encode(&RgbImage::from_pixel(128, 128, Rgb([1, 2, 3])), ImageFormat::Png);
        let err = validator().validate(&bytes, "application/pdf").unwrap_err();
        assert!(matches!(err, InvalidImageError::UnsupportedContentType(_)));
    }

    #[test]
    fn rejects_sniffed_format_outside_allowed_set() {
        let bytes = encode(&RgbImage::from_pixel(128, 128, Rgb([1, 2, 3])), ImageFormat::Tiff);
        let err = validator().validate(&bytes, "image/png").unwrap_err();
        assert!(matches!(err, InvalidImageError::UnsupportedFormat(_)));
    }

    #[test]
    fn normalizes_to_target_tensor() {
        let bytes = encode(
            &RgbImage::from_pixel(300, 200, Rgb([255, 0, 128])),
            ImageFormat::Png,
        );
        let image = validator().validate(&bytes, "image/png; charset=binary").unwrap();
        assert_eq!(image.tensor().dim(), (3, 224, 224));
        assert_eq!(image.source_dimensions(), (300, 200));
        assert_eq!(image.source().get_pixel(299, 199), &Rgb([255, 0, 128]));

        let config = ImageConfig::default();
        let red = (1.0 - config.mean[0]) / config.std[0];
        let green = (0.0 - config.mean[1]) / config.std[1];
        assert!((image.tensor()[[0, 10, 10]] - red).abs() < 1e-5);
        assert!((image.tensor()[[1, 100, 50]] - green).abs() < 1e-5);
        assert_eq!(image.digest(), calculate_image_hash(&bytes));
    }

    #[test]
    fn preprocessing_is_deterministic() {
        let mut img = RgbImage::new(256, 256);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Rgb([(x % 251) as u8, (y % 241) as u8, ((x * y) % 239) as u8]);
        }
        let bytes = encode(&img, ImageFormat::Png);
        let a = validator().validate(&bytes, "image/png").unwrap();
        let b = validator().validate(&bytes, "image/png").unwrap();
        assert_eq!(a.tensor(), b.tensor());
        assert_eq!(a.rgb(), b.rgb());
    }

    #[test]
    fn grayscale_input_resolves_to_rgb() {
        let gray = image::GrayImage::from_pixel(150, 150, image::Luma([90]));
        let mut bytes = Vec::new();
        gray.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let image = validator().validate(&bytes, "image/png").unwrap();
        assert_eq!(image.rgb().get_pixel(5, 5), &Rgb([90, 90, 90]));
    }
}
