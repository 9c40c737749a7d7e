use image::{Rgb, RgbImage};
use shared::{AbcdeScore, Diameter, EVOLUTION_REASON, Measurement};
use std::f64::consts::{FRAC_PI_2, PI};

use super::segmentation::{LesionMask, MaskUnavailable, trace_contour};
use crate::imaging::NormalizedImage;

/// Smallest lesion, in normalized pixels, whose shape is worth measuring.
const MIN_MEASURABLE_AREA: usize = 16;

/// Dermoscopic reference palette.
const REFERENCE_COLORS: [(&str, [f32; 3]); 6] = [
    ("white", [235.0, 230.0, 225.0]),
    ("red", [190.0, 60.0, 55.0]),
    ("light brown", [165.0, 110.0, 70.0]),
    ("dark brown", [90.0, 55.0, 35.0]),
    ("blue-gray", [100.0, 115.0, 135.0]),
    ("black", [30.0, 25.0, 25.0]),
];

/// Diameter (mm) at which the diameter term of the risk score saturates.
pub const DIAMETER_SATURATION_MM: f32 = 12.0;

#[derive(Debug, Clone)]
pub struct MorphologyAnalyzer {
    default_mm_per_pixel: f32,
    min_color_share: f32,
}

impl MorphologyAnalyzer {
    pub fn new(default_mm_per_pixel: f32) -> Self {
        Self {
            default_mm_per_pixel,
            min_color_share: 0.05,
        }
    }

    pub fn default_mm_per_pixel(&self) -> f32 {
        self.default_mm_per_pixel
    }

    /// Scores a lesion, or reports every component undetermined when no usable mask
    /// is available. `mm_per_pixel` is millimetres per source-image pixel.
    pub fn analyze(
        &self,
        image: &NormalizedImage,
        mask: Result<&LesionMask, &MaskUnavailable>,
        mm_per_pixel: Option<f32>,
    ) -> AbcdeScore {
        let mask = match mask {
            Ok(mask) => mask,
            Err(reason) => return AbcdeScore::undetermined(&reason.to_string()),
        };
        if mask.dimensions() != (image.width(), image.height()) {
            let reason = MaskUnavailable::DimensionMismatch {
                mask: mask.dimensions(),
                image: (image.width(), image.height()),
            };
            return AbcdeScore::undetermined(&reason.to_string());
        }
        if mask.area() < MIN_MEASURABLE_AREA {
            return AbcdeScore::undetermined("lesion region too small to measure");
        }

        AbcdeScore {
            asymmetry: Measurement::determined(asymmetry(mask)),
            border: border_irregularity(mask),
            color: Measurement::determined(self.color_variation(image.rgb(), mask)),
            diameter: self.diameter(image, mask, mm_per_pixel),
            evolution: Measurement::undetermined(EVOLUTION_REASON),
        }
    }

    fn color_variation(&self, rgb: &RgbImage, mask: &LesionMask) -> f32 {
        let mut counts = [0usize; REFERENCE_COLORS.len()];
        for (x, y) in mask.iter_set() {
            counts[nearest_reference(rgb.get_pixel(x, y))] += 1;
        }
        let area = mask.area() as f32;
        let clusters = counts
            .iter()
            .filter(|count| **count as f32 / area >= self.min_color_share)
            .count();
        clusters.saturating_sub(1) as f32 / (REFERENCE_COLORS.len() - 1) as f32
    }

    fn diameter(
        &self,
        image: &NormalizedImage,
        mask: &LesionMask,
        mm_per_pixel: Option<f32>,
    ) -> Diameter {
        let Some(contour) = trace_contour(mask) else {
            return Diameter::Undetermined {
                reason: "lesion contour could not be traced".into(),
            };
        };
        let (scale_x, scale_y) = image.source_scale();
        let source_pixels = longest_chord(&contour.points, scale_x, scale_y);

        match mm_per_pixel {
            Some(ratio) if ratio.is_finite() && ratio > 0.0 => Diameter::Calibrated {
                millimeters: source_pixels * ratio,
                source_pixels,
                mm_per_pixel: ratio,
            },
            other => {
                if let Some(ratio) = other {
                    log::warn!("Ignoring unusable calibration ratio {}", ratio);
                }
                Diameter::Estimated {
                    millimeters: source_pixels * self.default_mm_per_pixel,
                    source_pixels,
                    assumed_mm_per_pixel: self.default_mm_per_pixel,
                }
            }
        }
    }
}

fn nearest_reference(pixel: &Rgb<u8>) -> usize {
    let mut best = (0usize, f32::INFINITY);
    for (i, (_, reference)) in REFERENCE_COLORS.iter().enumerate() {
        let distance: f32 = (0..3)
            .map(|c| (pixel[c] as f32 - reference[c]).powi(2))
            .sum();
        if distance < best.1 {
            best = (i, distance);
        }
    }
    best.0
}

/// Share of lesion pixels that land outside the mask after mapping through `transform`.
fn mismatch(mask: &LesionMask, transform: impl Fn(f64, f64) -> (f64, f64)) -> f64 {
    let outside = mask
        .iter_set()
        .filter(|&(x, y)| {
            let (tx, ty) = transform(f64::from(x), f64::from(y));
            !mask.contains(tx.round() as i64, ty.round() as i64)
        })
        .count();
    outside as f64 / mask.area() as f64
}

/// 0 for a shape identical to its 180° rotation and its mirrors across both principal
/// axes, rising towards 1 as the overlap shrinks.
pub fn asymmetry(mask: &LesionMask) -> f32 {
    let Some((cx, cy)) = mask.centroid() else {
        return 0.0;
    };

    let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in mask.iter_set() {
        let dx = f64::from(x) - cx;
        let dy = f64::from(y) - cy;
        mu20 += dx * dx;
        mu02 += dy * dy;
        mu11 += dx * dy;
    }
    let theta = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);

    let mirror = |angle: f64| {
        let (ux, uy) = (angle.cos(), angle.sin());
        move |x: f64, y: f64| {
            let (dx, dy) = (x - cx, y - cy);
            let along = dx * ux + dy * uy;
            (cx + 2.0 * along * ux - dx, cy + 2.0 * along * uy - dy)
        }
    };

    let rotation = mismatch(mask, |x, y| (2.0 * cx - x, 2.0 * cy - y));
    let major = mismatch(mask, mirror(theta));
    let minor = mismatch(mask, mirror(theta + FRAC_PI_2));

    let blended = 0.5 * rotation + 0.25 * (major + minor);
    (2.0 * blended).clamp(0.0, 1.0) as f32
}

/// Vossepoel-Smeulders length of an 8-connected chain code.
pub fn chain_perimeter(chain: &[u8]) -> f64 {
    if chain.is_empty() {
        return 0.0;
    }
    let odd = chain.iter().filter(|d| *d % 2 == 1).count() as f64;
    let even = chain.len() as f64 - odd;
    let corners = chain
        .iter()
        .zip(chain.iter().cycle().skip(1))
        .filter(|(a, b)| a != b)
        .count() as f64;
    0.980 * even + 1.406 * odd - 0.091 * corners
}

/// `1 - circularity`, where circularity compares the traced perimeter against a
/// circle of the same area.
pub fn border_irregularity(mask: &LesionMask) -> Measurement {
    let Some(contour) = trace_contour(mask) else {
        return Measurement::undetermined("lesion contour could not be traced");
    };
    let perimeter = chain_perimeter(&contour.chain);
    if perimeter <= 0.0 {
        return Measurement::undetermined("lesion perimeter is degenerate");
    }
    let circularity = 4.0 * PI * mask.area() as f64 / (perimeter * perimeter);
    Measurement::determined((1.0 - circularity).clamp(0.0, 1.0) as f32)
}

/// Longest distance between contour points after scaling each axis into source pixels.
fn longest_chord(points: &[(u32, u32)], scale_x: f32, scale_y: f32) -> f32 {
    let mut best = 0.0f32;
    for (i, &(ax, ay)) in points.iter().enumerate() {
        for &(bx, by) in &points[i + 1..] {
            let dx = (ax as f32 - bx as f32) * scale_x;
            let dy = (ay as f32 - by as f32) * scale_y;
            best = best.max(dx * dx + dy * dy);
        }
    }
    best.sqrt()
}
