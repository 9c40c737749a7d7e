use shared::{FitzpatrickType, SkinToneReading};

use super::segmentation::LesionMask;
use crate::imaging::NormalizedImage;

/// Lower ITA bounds (degrees, exclusive) for types I through V; anything at or
/// below the last bound is type VI.
const ITA_CUTS: [(f32, FitzpatrickType); 5] = [
    (55.0, FitzpatrickType::I),
    (41.0, FitzpatrickType::II),
    (28.0, FitzpatrickType::III),
    (10.0, FitzpatrickType::IV),
    (-30.0, FitzpatrickType::V),
];

// D65 reference white.
const WHITE: [f64; 3] = [0.950_47, 1.0, 1.088_83];

/// Median color of the skin around the lesion, mapped to a Fitzpatrick type.
///
/// Lesion pixels are excluded when a mask is available. A mask that leaves no skin
/// falls back to the whole image.
pub fn classify_skin_tone(image: &NormalizedImage, mask: Option<&LesionMask>) -> SkinToneReading {
    let rgb = image.rgb();
    let usable_mask = mask.filter(|m| {
        m.dimensions() == rgb.dimensions() && m.area() < (rgb.width() * rgb.height()) as usize
    });

    let mut histograms = [[0usize; 256]; 3];
    let mut sampled = 0usize;
    for (x, y, pixel) in rgb.enumerate_pixels() {
        if usable_mask.is_some_and(|m| m.is_set(x, y)) {
            continue;
        }
        for c in 0..3 {
            histograms[c][pixel[c] as usize] += 1;
        }
        sampled += 1;
    }

    let median_rgb = [
        median(&histograms[0], sampled),
        median(&histograms[1], sampled),
        median(&histograms[2], sampled),
    ];
    let ita_degrees = individual_typology_angle(median_rgb);
    let fitzpatrick = fitzpatrick_from_ita(ita_degrees);

    log::debug!(
        "Skin tone: median {:?}, ITA {:.1}, {}",
        median_rgb,
        ita_degrees,
        fitzpatrick
    );

    SkinToneReading {
        fitzpatrick,
        description: fitzpatrick.description().to_string(),
        ita_degrees,
        median_rgb,
        sampled_pixels: sampled,
    }
}

/// Lower median of a value histogram.
fn median(histogram: &[usize; 256], count: usize) -> u8 {
    if count == 0 {
        return 0;
    }
    let target = (count - 1) / 2;
    let mut seen = 0usize;
    for (value, n) in histogram.iter().enumerate() {
        seen += n;
        if seen > target {
            return value as u8;
        }
    }
    255
}

pub fn fitzpatrick_from_ita(ita: f32) -> FitzpatrickType {
    ITA_CUTS
        .iter()
        .find(|(bound, _)| ita > *bound)
        .map(|(_, kind)| *kind)
        .unwrap_or(FitzpatrickType::VI)
}

/// `atan2(L* - 50, b*)` in degrees, on the CIELAB coordinates of an sRGB color.
pub fn individual_typology_angle(rgb: [u8; 3]) -> f32 {
    let [l, _, b] = srgb_to_lab(rgb);
    (l - 50.0).atan2(b).to_degrees() as f32
}

fn srgb_to_lab(rgb: [u8; 3]) -> [f64; 3] {
    let linear = rgb.map(|v| {
        let c = f64::from(v) / 255.0;
        if c <= 0.040_45 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    });
    let [r, g, b] = linear;
    let xyz = [
        0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b,
        0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b,
        0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b,
    ];

    let f = |t: f64| {
        if t > 216.0 / 24389.0 {
            t.cbrt()
        } else {
            (24389.0 / 27.0 * t + 16.0) / 116.0
        }
    };
    let fx = f(xyz[0] / WHITE[0]);
    let fy = f(xyz[1] / WHITE[1]);
    let fz = f(xyz[2] / WHITE[2]);

    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;
    use image::{Rgb, RgbImage};

    fn uniform(color: [u8; 3]) -> NormalizedImage {
        let img = RgbImage::from_pixel(224, 224, Rgb(color));
        NormalizedImage::from_rgb(&img, &ImageConfig::default())
    }

    #[test]
    fn darker_skin_never_maps_to_a_lighter_type() {
        let shades = [
            [250, 235, 225],
            [235, 205, 185],
            [215, 175, 145],
            [190, 140, 105],
            [140, 95, 65],
            [90, 60, 45],
            [55, 38, 30],
        ];
        let types: Vec<FitzpatrickType> = shades
            .iter()
            .map(|c| classify_skin_tone(&uniform(*c), None).fitzpatrick)
            .collect();
        assert!(types.windows(2).all(|w| w[0] <= w[1]), "{types:?}");
        assert!(types[0] <= FitzpatrickType::II);
        assert_eq!(types[types.len() - 1], FitzpatrickType::VI);
    }

    #[test]
    fn cut_points_are_monotonic() {
        let mut previous = FitzpatrickType::I;
        for tenth in (-900..=900).rev() {
            let kind = fitzpatrick_from_ita(tenth as f32 / 10.0);
            assert!(kind >= previous);
            previous = kind;
        }
        assert_eq!(fitzpatrick_from_ita(60.0), FitzpatrickType::I);
        assert_eq!(fitzpatrick_from_ita(55.0), FitzpatrickType::II);
        assert_eq!(fitzpatrick_from_ita(-30.0), FitzpatrickType::VI);
    }

    #[test]
    fn lesion_pixels_are_excluded() {
        let mut img = RgbImage::from_pixel(224, 224, Rgb([240, 215, 200]));
        let mask = LesionMask::from_fn(224, 224, |x, y| x < 180 && y < 180);
        for (x, y) in mask.iter_set() {
            img.put_pixel(x, y, Rgb([40, 25, 20]));
        }
        let image = NormalizedImage::from_rgb(&img, &ImageConfig::default());

        let with_mask = classify_skin_tone(&image, Some(&mask));
        assert_eq!(with_mask.median_rgb, [240, 215, 200]);
        assert_eq!(with_mask.sampled_pixels, 224 * 224 - 180 * 180);

        let without = classify_skin_tone(&image, None);
        assert!(without.fitzpatrick > with_mask.fitzpatrick);
    }

    #[test]
    fn full_coverage_mask_falls_back_to_whole_image() {
        let image = uniform([200, 160, 130]);
        let everything = LesionMask::from_fn(224, 224, |_, _| true);
        let reading = classify_skin_tone(&image, Some(&everything));
        assert_eq!(reading.sampled_pixels, 224 * 224);
        assert_eq!(reading.median_rgb, [200, 160, 130]);
    }
}
