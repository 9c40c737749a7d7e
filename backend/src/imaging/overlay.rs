use image::codecs::png::PngEncoder;
use image::{ImageEncoder, Rgb, RgbImage};
use lazy_static::lazy_static;
use ndarray::Array2;

lazy_static! {
    /// 256-entry JET colormap, blue (0.0) through red (1.0).
    static ref JET: Vec<Rgb<u8>> = (0..256)
        .map(|i| {
            let v = i as f32 / 255.0;
            let channel = |offset: f32| {
                ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8
            };
            Rgb([channel(3.0), channel(2.0), channel(1.0)])
        })
        .collect();
}

pub fn jet_color(value: f32) -> Rgb<u8> {
    let index = (value.clamp(0.0, 1.0) * 255.0).round() as usize;
    JET[index.min(255)]
}

/// Alpha-blends a color-mapped `[0,1]` heatmap onto `base`.
///
/// The heatmap must have the base image's `(height, width)`; extra cells are
/// ignored and missing cells leave the base pixel untouched.
pub fn render_overlay(base: &RgbImage, heatmap: &Array2<f32>, alpha: f32) -> RgbImage {
    let alpha = alpha.clamp(0.0, 1.0);
    let (rows, cols) = heatmap.dim();
    let mut overlay = base.clone();
    for (x, y, pixel) in overlay.enumerate_pixels_mut() {
        let (row, col) = (y as usize, x as usize);
        if row >= rows || col >= cols {
            continue;
        }
        let heat = jet_color(heatmap[[row, col]]);
        for c in 0..3 {
            let blended = alpha * heat[c] as f32 + (1.0 - alpha) * pixel[c] as f32;
            pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    overlay
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Vec::new();
    let encoder = PngEncoder::new(&mut buffer);
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}
