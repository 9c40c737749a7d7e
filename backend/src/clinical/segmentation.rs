use image::{GrayImage, imageops};
use std::collections::VecDeque;

use crate::imaging::NormalizedImage;

/// Binary lesion mask on the normalized image grid, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LesionMask {
    width: u32,
    height: u32,
    pixels: Vec<bool>,
    area: usize,
}

impl LesionMask {
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        let area = pixels.iter().filter(|p| **p).count();
        Self {
            width,
            height,
            pixels,
            area,
        }
    }

    /// Returns `None` when `pixels` does not hold exactly `width * height` entries.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<bool>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize {
            return None;
        }
        let area = pixels.iter().filter(|p| **p).count();
        Some(Self {
            width,
            height,
            pixels,
            area,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn area(&self) -> usize {
        self.area
    }

    pub fn coverage(&self) -> f32 {
        let total = self.pixels.len();
        if total == 0 {
            0.0
        } else {
            self.area as f32 / total as f32
        }
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.pixels[self.offset(x, y)]
    }

    /// Bounds-safe lookup for signed coordinates; anything outside the grid is background.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && self.is_set(x as u32, y as u32)
    }

    pub fn iter_set(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let width = self.width as usize;
        self.pixels
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .map(move |(i, _)| ((i % width) as u32, (i / width) as u32))
    }

    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.area == 0 {
            return None;
        }
        let (sx, sy) = self
            .iter_set()
            .fold((0.0f64, 0.0f64), |(sx, sy), (x, y)| (sx + x as f64, sy + y as f64));
        Some((sx / self.area as f64, sy / self.area as f64))
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MaskUnavailable {
    #[error("insufficient contrast between lesion and surrounding skin ({contrast:.1} gray levels)")]
    LowContrast { contrast: f32 },
    #[error("no lesion region found ({coverage:.4} of the image)")]
    TooSmall { coverage: f32 },
    #[error("candidate lesion covers {coverage:.2} of the image, no surrounding skin to contrast against")]
    TooLarge { coverage: f32 },
    #[error("lesion mask is {mask:?} but the image is {image:?}")]
    DimensionMismatch { mask: (u32, u32), image: (u32, u32) },
}

#[derive(Debug, Clone)]
pub struct SegmentationSettings {
    pub blur_sigma: f32,
    /// Minimum gap between the mean gray levels of the two Otsu classes.
    pub min_contrast: f32,
    pub min_coverage: f32,
    pub max_coverage: f32,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            min_contrast: 12.0,
            min_coverage: 0.002,
            max_coverage: 0.9,
        }
    }
}

struct OtsuSplit {
    threshold: u8,
    lower_mean: f64,
    upper_mean: f64,
}

fn otsu(histogram: &[u32; 256], total: u64) -> Option<OtsuSplit> {
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as f64 * *count as f64)
        .sum();

    let mut below = 0u64;
    let mut below_sum = 0.0f64;
    let mut best: Option<(f64, OtsuSplit)> = None;

    for level in 0..255usize {
        below += u64::from(histogram[level]);
        below_sum += level as f64 * histogram[level] as f64;
        if below == 0 {
            continue;
        }
        let above = total - below;
        if above == 0 {
            break;
        }
        let lower_mean = below_sum / below as f64;
        let upper_mean = (weighted_total - below_sum) / above as f64;
        let spread = below as f64 * above as f64 * (upper_mean - lower_mean).powi(2);
        if best.as_ref().is_none_or(|(b, _)| spread > *b) {
            best = Some((
                spread,
                OtsuSplit {
                    threshold: level as u8,
                    lower_mean,
                    upper_mean,
                },
            ));
        }
    }
    best.map(|(_, split)| split)
}

/// Labels the darker Otsu class of the blurred luma, keeps its largest 4-connected
/// component and fills the holes inside it.
pub fn derive_lesion_mask(
    image: &NormalizedImage,
    settings: &SegmentationSettings,
) -> Result<LesionMask, MaskUnavailable> {
    let gray = imageops::grayscale(image.rgb());
    let blurred: GrayImage = if settings.blur_sigma > 0.0 {
        imageops::blur(&gray, settings.blur_sigma)
    } else {
        gray
    };
    let (width, height) = blurred.dimensions();

    let mut histogram = [0u32; 256];
    for pixel in blurred.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let total = u64::from(width) * u64::from(height);
    let split = otsu(&histogram, total).ok_or(MaskUnavailable::LowContrast { contrast: 0.0 })?;
    let contrast = (split.upper_mean - split.lower_mean) as f32;
    if contrast < settings.min_contrast {
        return Err(MaskUnavailable::LowContrast { contrast });
    }

    let dark = LesionMask::from_fn(width, height, |x, y| {
        blurred.get_pixel(x, y)[0] <= split.threshold
    });
    let mask = fill_holes(&largest_component(&dark));

    let coverage = mask.coverage();
    if mask.area() == 0 || coverage < settings.min_coverage {
        return Err(MaskUnavailable::TooSmall { coverage });
    }
    if coverage > settings.max_coverage {
        return Err(MaskUnavailable::TooLarge { coverage });
    }

    log::debug!(
        "Lesion mask: threshold {}, contrast {:.1}, coverage {:.3}",
        split.threshold,
        contrast,
        coverage
    );
    Ok(mask)
}

const NEIGHBOURS_4: [(i64, i64); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Largest 4-connected component; ties keep the component found first in raster order.
pub fn largest_component(mask: &LesionMask) -> LesionMask {
    let (width, height) = mask.dimensions();
    let mut labels = vec![0u32; mask.pixels.len()];
    let mut best = (0u32, 0usize);
    let mut next_label = 0u32;
    let mut queue = VecDeque::new();

    for start in 0..mask.pixels.len() {
        if !mask.pixels[start] || labels[start] != 0 {
            continue;
        }
        next_label += 1;
        labels[start] = next_label;
        queue.push_back(start);
        let mut size = 0usize;

        while let Some(index) = queue.pop_front() {
            size += 1;
            let x = (index % width as usize) as i64;
            let y = (index / width as usize) as i64;
            for (dx, dy) in NEIGHBOURS_4 {
                let (nx, ny) = (x + dx, y + dy);
                if mask.contains(nx, ny) {
                    let neighbour = ny as usize * width as usize + nx as usize;
                    if labels[neighbour] == 0 {
                        labels[neighbour] = next_label;
                        queue.push_back(neighbour);
                    }
                }
            }
        }

        if size > best.1 {
            best = (next_label, size);
        }
    }

    let keep = best.0;
    let pixels = labels.iter().map(|l| keep != 0 && *l == keep).collect();
    LesionMask {
        width,
        height,
        pixels,
        area: best.1,
    }
}

/// Background pixels not 4-connected to the image border become lesion.
pub fn fill_holes(mask: &LesionMask) -> LesionMask {
    let (width, height) = mask.dimensions();
    let mut outside = vec![false; mask.pixels.len()];
    let mut queue = VecDeque::new();

    let seed = |x: u32, y: u32, outside: &mut Vec<bool>, queue: &mut VecDeque<usize>| {
        let index = mask.offset(x, y);
        if !mask.pixels[index] && !outside[index] {
            outside[index] = true;
            queue.push_back(index);
        }
    };
    for x in 0..width {
        seed(x, 0, &mut outside, &mut queue);
        if height > 1 {
            seed(x, height - 1, &mut outside, &mut queue);
        }
    }
    for y in 0..height {
        seed(0, y, &mut outside, &mut queue);
        if width > 1 {
            seed(width - 1, y, &mut outside, &mut queue);
        }
    }

    while let Some(index) = queue.pop_front() {
        let x = (index % width as usize) as i64;
        let y = (index / width as usize) as i64;
        for (dx, dy) in NEIGHBOURS_4 {
            let (nx, ny) = (x + dx, y + dy);
            if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                continue;
            }
            let neighbour = ny as usize * width as usize + nx as usize;
            if !mask.pixels[neighbour] && !outside[neighbour] {
                outside[neighbour] = true;
                queue.push_back(neighbour);
            }
        }
    }

    let pixels: Vec<bool> = outside.iter().map(|o| !o).collect();
    let area = pixels.iter().filter(|p| **p).count();
    LesionMask {
        width,
        height,
        pixels,
        area,
    }
}

/// Chain code directions, `(dx, dy)` with y pointing down, counter-clockwise from east.
pub const DIRECTIONS: [(i64, i64); 8] = [
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Outer boundary of the first component in raster order.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub points: Vec<(u32, u32)>,
    pub chain: Vec<u8>,
}

/// Moore-neighbour trace of the outer boundary, 8-connected.
pub fn trace_contour(mask: &LesionMask) -> Option<Contour> {
    let (start_x, start_y) = mask.iter_set().next()?;
    let start = (i64::from(start_x), i64::from(start_y));
    let limit = 4 * mask.pixels.len() + 8;

    let mut points = vec![(start_x, start_y)];
    let mut chain: Vec<u8> = Vec::new();
    let mut current = start;
    let mut direction = 7usize;

    loop {
        let first = if direction % 2 == 0 {
            (direction + 7) % 8
        } else {
            (direction + 6) % 8
        };
        let next = (0..8).map(|i| (first + i) % 8).find(|&d| {
            let (dx, dy) = DIRECTIONS[d];
            mask.contains(current.0 + dx, current.1 + dy)
        });
        let Some(step) = next else {
            break;
        };
        if current == start && chain.first() == Some(&(step as u8)) {
            break;
        }
        let (dx, dy) = DIRECTIONS[step];
        current = (current.0 + dx, current.1 + dy);
        chain.push(step as u8);
        if current != start {
            points.push((current.0 as u32, current.1 as u32));
        }
        direction = step;
        if chain.len() > limit {
            log::warn!("Contour trace did not close after {} steps", limit);
            break;
        }
    }

    Some(Contour { points, chain })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;
    use image::{Rgb, RgbImage};

    fn disc(width: u32, height: u32, cx: i64, cy: i64, r: i64) -> LesionMask {
        LesionMask::from_fn(width, height, |x, y| {
            let dx = x as i64 - cx;
            let dy = y as i64 - cy;
            dx * dx + dy * dy <= r * r
        })
    }

    #[test]
    fn uniform_image_has_no_mask() {
        let img = RgbImage::from_pixel(224, 224, Rgb([128, 128, 128]));
        let image = NormalizedImage::from_rgb(&img, &ImageConfig::default());
        let err = derive_lesion_mask(&image, &SegmentationSettings::default()).unwrap_err();
        assert!(matches!(err, MaskUnavailable::LowContrast { .. }));
    }

    #[test]
    fn dark_spot_on_skin_is_segmented() {
        let mut img = RgbImage::from_pixel(224, 224, Rgb([225, 190, 170]));
        for (x, y, px) in img.enumerate_pixels_mut() {
            let dx = x as i64 - 100;
            let dy = y as i64 - 120;
            if dx * dx + dy * dy <= 40 * 40 {
                *px = Rgb([80, 45, 35]);
            }
        }
        let image = NormalizedImage::from_rgb(&img, &ImageConfig::default());
        let mask = derive_lesion_mask(&image, &SegmentationSettings::default()).unwrap();

        let expected = std::f32::consts::PI * 40.0 * 40.0;
        let area = mask.area() as f32;
        assert!((area - expected).abs() / expected < 0.1, "area {area}");
        let (cx, cy) = mask.centroid().unwrap();
        assert!((cx - 100.0).abs() < 1.5 && (cy - 120.0).abs() < 1.5);
    }

    #[test]
    fn keeps_only_the_largest_component() {
        let big = disc(64, 64, 20, 20, 8);
        let small = disc(64, 64, 50, 50, 3);
        let both = LesionMask::from_fn(64, 64, |x, y| big.is_set(x, y) || small.is_set(x, y));
        let largest = largest_component(&both);
        assert_eq!(largest, big);
    }

    #[test]
    fn interior_holes_are_filled() {
        let ring = LesionMask::from_fn(32, 32, |x, y| {
            let d = (x as i64 - 16).pow(2) + (y as i64 - 16).pow(2);
            (16..=81).contains(&d)
        });
        let filled = fill_holes(&ring);
        assert!(filled.is_set(16, 16));
        assert_eq!(filled, disc(32, 32, 16, 16, 9));
    }

    #[test]
    fn contour_of_a_square_closes() {
        let square = LesionMask::from_fn(10, 10, |x, y| (2..6).contains(&x) && (3..7).contains(&y));
        let contour = trace_contour(&square).unwrap();
        assert_eq!(contour.points.len(), 12);
        assert_eq!(contour.chain.len(), 12);
        assert!(contour.points.iter().all(|&(x, y)| square.is_set(x, y)));
    }

    #[test]
    fn single_pixel_contour_is_a_point() {
        let dot = LesionMask::from_fn(5, 5, |x, y| x == 2 && y == 2);
        let contour = trace_contour(&dot).unwrap();
        assert_eq!(contour.points, vec![(2, 2)]);
        assert!(contour.chain.is_empty());
    }
}
