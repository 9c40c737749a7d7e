use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, RgbImage};
use ndarray::{Array2, Array3, Axis};
use shared::LesionClass;

use crate::clinical::LesionMask;
use crate::imaging::{NormalizedImage, overlay};
use crate::model::{InferenceError, Model};

/// Grad-CAM++ relevance of each image region for one target class, in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct AttentionMap {
    target: LesionClass,
    grid: Array2<f32>,
    values: Array2<f32>,
}

impl AttentionMap {
    pub fn target(&self) -> LesionClass {
        self.target
    }

    /// Values at feature-map resolution.
    pub fn grid(&self) -> &Array2<f32> {
        &self.grid
    }

    /// Values upsampled to the normalized image, indexed `[row, col]`.
    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn grid_rows(&self) -> Vec<Vec<f32>> {
        self.grid.outer_iter().map(|row| row.to_vec()).collect()
    }

    /// `(x, y)` of the strongest response; the first in raster order on ties.
    pub fn hotspot(&self) -> (u32, u32) {
        let mut best = ((0usize, 0usize), f32::NEG_INFINITY);
        for ((row, col), value) in self.values.indexed_iter() {
            if *value > best.1 {
                best = ((row, col), *value);
            }
        }
        let (row, col) = best.0;
        (col as u32, row as u32)
    }

    /// Share of total attention that falls on the lesion; `None` for an empty map or
    /// a mask on a different grid.
    pub fn lesion_focus(&self, mask: &LesionMask) -> Option<f32> {
        let (rows, cols) = self.values.dim();
        if mask.dimensions() != (cols as u32, rows as u32) {
            return None;
        }
        let total: f64 = self.values.iter().map(|v| f64::from(*v)).sum();
        if total <= f64::EPSILON {
            return None;
        }
        let inside: f64 = mask
            .iter_set()
            .map(|(x, y)| f64::from(self.values[[y as usize, x as usize]]))
            .sum();
        Some((inside / total) as f32)
    }

    /// Blends the map onto the decoded photograph. The feature grid is upsampled
    /// straight to the source resolution so non-square uploads are not stretched.
    pub fn render_overlay(&self, image: &NormalizedImage, alpha: f32) -> RgbImage {
        let (width, height) = image.source_dimensions();
        let heatmap = upsample(&self.grid, width, height);
        overlay::render_overlay(image.source(), &heatmap, alpha)
    }
}

/// Grad-CAM++ over one set of feature maps.
///
/// `alpha = g^2 / (2 g^2 + sum(A) g^3)` per cell (zero denominators count as one),
/// channel weight `w_k = sum(alpha * relu(g))`, map `relu(sum_k w_k A_k)` scaled to
/// `[0, 1]`. A flat map comes back as all zeros.
pub fn grad_cam_plus_plus(
    activations: &Array3<f32>,
    gradients: &Array3<f32>,
) -> Result<Array2<f32>, InferenceError> {
    if activations.dim() != gradients.dim() {
        return Err(InferenceError::MalformedOutput(format!(
            "activations {:?} and gradients {:?} differ in shape",
            activations.dim(),
            gradients.dim()
        )));
    }
    let (channels, rows, cols) = activations.dim();
    if channels == 0 || rows == 0 || cols == 0 {
        return Err(InferenceError::MalformedOutput(
            "empty feature maps".to_string(),
        ));
    }

    let mut cam = Array2::<f32>::zeros((rows, cols));
    for (activation, gradient) in activations
        .axis_iter(Axis(0))
        .zip(gradients.axis_iter(Axis(0)))
    {
        let activation_sum: f32 = activation.sum();
        let mut weight = 0.0f32;
        for &g in gradient.iter() {
            let g2 = g * g;
            let g3 = g2 * g;
            let denominator = 2.0 * g2 + activation_sum * g3;
            let denominator = if denominator == 0.0 { 1.0 } else { denominator };
            weight += (g2 / denominator) * g.max(0.0);
        }
        cam.scaled_add(weight, &activation);
    }

    cam.mapv_inplace(|v| v.max(0.0));
    if cam.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::NonFinite("attention map"));
    }

    let max = cam.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = cam.iter().copied().fold(f32::INFINITY, f32::min);
    let range = max - min;
    if range <= f32::EPSILON {
        cam.fill(0.0);
    } else {
        cam.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    }
    Ok(cam)
}

fn upsample(grid: &Array2<f32>, width: u32, height: u32) -> Array2<f32> {
    let (rows, cols) = grid.dim();
    let source: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([grid[[y as usize, x as usize]]])
        });
    let resized = imageops::resize(&source, width, height, FilterType::Triangle);
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        resized.get_pixel(x as u32, y as u32)[0].clamp(0.0, 1.0)
    })
}

/// Explains `target`, or the model's top-1 class when no target is given.
///
/// The gradient computation is isolated per call by the classifier backend.
pub fn explain(
    model: &Model,
    image: &NormalizedImage,
    target: Option<LesionClass>,
) -> Result<AttentionMap, InferenceError> {
    let target = match target {
        Some(class) => class,
        None => model.inference(image)?.top1().0,
    };
    let features = model.class_gradients(image, target)?;
    let grid = grad_cam_plus_plus(&features.activations, &features.gradients)?;
    let values = upsample(&grid, image.width(), image.height());

    log::debug!(
        "Attention map for {} from {:?} feature grid (score {:.3})",
        target,
        grid.dim(),
        features.score
    );

    Ok(AttentionMap {
        target,
        grid,
        values,
    })
}
