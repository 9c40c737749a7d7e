use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{CLASS_COUNT, LesionClass};
use std::path::Path;

use super::{
    ClassProbabilityVector, FeatureGradients, InferenceError, LesionClassifier, ModelDescriptor,
};
use crate::imaging::NormalizedImage;

pub const ARCHITECTURE: &str = "derm-cnn-v1";
const KERNEL: usize = 3;
const PADDING: usize = 1;
const RANDOM_LAYOUT: [(usize, usize); 3] = [(3, 8), (8, 16), (16, 32)];

/// On-disk weights artifact. Convolution kernels are laid out `[out][in][ky][kx]`,
/// the dense head `[out][in]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeWeights {
    pub architecture: String,
    pub conv: Vec<ConvWeights>,
    pub head: DenseWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvWeights {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseWeights {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl NativeWeights {
    pub fn load(path: &Path) -> Result<(Self, String), InferenceError> {
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());
        let weights = serde_json::from_slice(&bytes)
            .map_err(|e| InferenceError::Weights(format!("{}: {}", path.display(), e)))?;
        Ok((weights, digest))
    }
}

#[derive(Debug, Clone)]
struct ConvLayer {
    weight: Array4<f32>,
    bias: Array1<f32>,
    stride: usize,
}

impl ConvLayer {
    fn from_weights(index: usize, weights: &ConvWeights) -> Result<Self, InferenceError> {
        if weights.stride == 0 {
            return Err(InferenceError::Weights(format!(
                "conv[{index}] has zero stride"
            )));
        }
        if weights.bias.len() != weights.out_channels {
            return Err(InferenceError::Weights(format!(
                "conv[{index}] bias has {} entries, expected {}",
                weights.bias.len(),
                weights.out_channels
            )));
        }
        let weight = Array4::from_shape_vec(
            (weights.out_channels, weights.in_channels, KERNEL, KERNEL),
            weights.weight.clone(),
        )
        .map_err(|e| InferenceError::Weights(format!("conv[{index}] weight: {e}")))?;

        Ok(Self {
            weight,
            bias: Array1::from(weights.bias.clone()),
            stride: weights.stride,
        })
    }

    fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// 3x3 convolution with zero padding followed by ReLU. Output planes are
    /// computed in parallel; each plane accumulates in a fixed order.
    fn forward(&self, input: &Array3<f32>) -> Array3<f32> {
        let (in_c, height, width) = input.dim();
        let out_h = (height + 2 * PADDING - KERNEL) / self.stride + 1;
        let out_w = (width + 2 * PADDING - KERNEL) / self.stride + 1;
        let mut output = Array3::<f32>::zeros((self.out_channels(), out_h, out_w));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(o, mut plane)| {
                plane.fill(self.bias[o]);
                for i in 0..in_c {
                    let source = input.index_axis(Axis(0), i);
                    for ky in 0..KERNEL {
                        for kx in 0..KERNEL {
                            let k = self.weight[[o, i, ky, kx]];
                            for oy in 0..out_h {
                                let iy = (oy * self.stride + ky) as isize - PADDING as isize;
                                if iy < 0 || iy >= height as isize {
                                    continue;
                                }
                                let src_row = source.row(iy as usize);
                                let mut dst_row = plane.row_mut(oy);
                                for ox in 0..out_w {
                                    let ix = (ox * self.stride + kx) as isize - PADDING as isize;
                                    if ix < 0 || ix >= width as isize {
                                        continue;
                                    }
                                    dst_row[ox] += k * src_row[ix as usize];
                                }
                            }
                        }
                    }
                }
                plane.mapv_inplace(|v| v.max(0.0));
            });

        output
    }
}

/// Small convolutional classifier evaluated with ndarray on the CPU.
///
/// Convolution stack, global average pooling, then a dense layer to the class logits.
/// Gradients of a class score with respect to the last feature maps are analytic.
#[derive(Debug, Clone)]
pub struct NativeClassifier {
    convs: Vec<ConvLayer>,
    head_weight: Array2<f32>,
    head_bias: Array1<f32>,
    descriptor: ModelDescriptor,
}

impl NativeClassifier {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let (weights, digest) = NativeWeights::load(path)?;
        Self::from_weights(&weights, Some(digest))
    }

    pub fn random(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::random_with(&mut rng, format!("random (seed {seed})"))
    }

    pub fn random_from_os() -> Self {
        let mut rng = StdRng::from_os_rng();
        Self::random_with(&mut rng, "random".to_string())
    }

    /// He-uniform convolutions and a Glorot-uniform head, zero biases.
    fn random_with(rng: &mut StdRng, name: String) -> Self {
        let convs = RANDOM_LAYOUT
            .iter()
            .map(|&(in_channels, out_channels)| {
                let bound = (6.0 / (in_channels * KERNEL * KERNEL) as f32).sqrt();
                ConvLayer {
                    weight: Array4::from_shape_simple_fn(
                        (out_channels, in_channels, KERNEL, KERNEL),
                        || rng.random_range(-bound..bound),
                    ),
                    bias: Array1::zeros(out_channels),
                    stride: 2,
                }
            })
            .collect::<Vec<_>>();

        let features = RANDOM_LAYOUT[RANDOM_LAYOUT.len() - 1].1;
        let bound = (6.0 / (features + CLASS_COUNT) as f32).sqrt();
        let head_weight = Array2::from_shape_simple_fn((CLASS_COUNT, features), || {
            rng.random_range(-bound..bound)
        });

        Self {
            convs,
            head_weight,
            head_bias: Array1::zeros(CLASS_COUNT),
            descriptor: ModelDescriptor {
                name,
                backend: "native",
                weights_sha256: None,
            },
        }
    }

    pub fn from_weights(
        weights: &NativeWeights,
        digest: Option<String>,
    ) -> Result<Self, InferenceError> {
        if weights.architecture != ARCHITECTURE {
            return Err(InferenceError::Weights(format!(
                "unknown architecture {:?}",
                weights.architecture
            )));
        }
        if weights.conv.is_empty() {
            return Err(InferenceError::Weights("no convolution layers".into()));
        }

        let convs = weights
            .conv
            .iter()
            .enumerate()
            .map(|(i, w)| ConvLayer::from_weights(i, w))
            .collect::<Result<Vec<_>, _>>()?;

        if convs[0].in_channels() != 3 {
            return Err(InferenceError::Weights(format!(
                "first layer expects {} channels, images have 3",
                convs[0].in_channels()
            )));
        }
        for (i, pair) in convs.windows(2).enumerate() {
            if pair[0].out_channels() != pair[1].in_channels() {
                return Err(InferenceError::Weights(format!(
                    "conv[{}] emits {} channels but conv[{}] expects {}",
                    i,
                    pair[0].out_channels(),
                    i + 1,
                    pair[1].in_channels()
                )));
            }
        }

        let head = &weights.head;
        let features = convs[convs.len() - 1].out_channels();
        if head.in_features != features || head.out_features != CLASS_COUNT {
            return Err(InferenceError::Weights(format!(
                "head is {}x{}, expected {}x{}",
                head.out_features, head.in_features, CLASS_COUNT, features
            )));
        }
        if head.bias.len() != CLASS_COUNT {
            return Err(InferenceError::Weights(format!(
                "head bias has {} entries, expected {}",
                head.bias.len(),
                CLASS_COUNT
            )));
        }
        let head_weight = Array2::from_shape_vec((CLASS_COUNT, features), head.weight.clone())
            .map_err(|e| InferenceError::Weights(format!("head weight: {e}")))?;

        Ok(Self {
            convs,
            head_weight,
            head_bias: Array1::from(head.bias.clone()),
            descriptor: ModelDescriptor {
                name: weights.architecture.clone(),
                backend: "native",
                weights_sha256: digest,
            },
        })
    }

    pub fn to_weights(&self) -> NativeWeights {
        NativeWeights {
            architecture: ARCHITECTURE.to_string(),
            conv: self
                .convs
                .iter()
                .map(|layer| ConvWeights {
                    in_channels: layer.in_channels(),
                    out_channels: layer.out_channels(),
                    stride: layer.stride,
                    weight: layer.weight.iter().copied().collect(),
                    bias: layer.bias.to_vec(),
                })
                .collect(),
            head: DenseWeights {
                in_features: self.head_weight.ncols(),
                out_features: CLASS_COUNT,
                weight: self.head_weight.iter().copied().collect(),
                bias: self.head_bias.to_vec(),
            },
        }
    }

    fn features(&self, image: &NormalizedImage) -> Result<Array3<f32>, InferenceError> {
        let input = image.tensor();
        let (channels, height, width) = input.dim();
        if channels != 3 || height < KERNEL || width < KERNEL {
            return Err(InferenceError::InputShape {
                expected: format!("(3, >={KERNEL}, >={KERNEL})"),
                actual: vec![channels, height, width],
            });
        }

        let mut current = self.convs[0].forward(input);
        for layer in &self.convs[1..] {
            current = layer.forward(&current);
        }
        if current.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinite("feature maps"));
        }
        Ok(current)
    }

    fn logits(&self, features: &Array3<f32>) -> Array1<f32> {
        let (_, rows, cols) = features.dim();
        let cells = (rows * cols).max(1) as f32;
        let pooled: Array1<f32> = features
            .outer_iter()
            .map(|plane| plane.sum() / cells)
            .collect();
        self.head_weight.dot(&pooled) + &self.head_bias
    }
}

impl LesionClassifier for NativeClassifier {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn predict(&self, image: &NormalizedImage) -> Result<ClassProbabilityVector, InferenceError> {
        let features = self.features(image)?;
        let logits = self.logits(&features);
        ClassProbabilityVector::from_logits(&logits.to_vec())
    }

    fn class_gradients(
        &self,
        image: &NormalizedImage,
        target: LesionClass,
    ) -> Result<FeatureGradients, InferenceError> {
        let activations = self.features(image)?;
        let logits = self.logits(&activations);
        let score = logits[target.index()];

        // d score / d A[k, i, j] = W[target, k] / (rows * cols) after global average pooling.
        let (channels, rows, cols) = activations.dim();
        let cells = (rows * cols).max(1) as f32;
        let class_row = self.head_weight.row(target.index());
        let gradients =
            Array3::from_shape_fn((channels, rows, cols), |(k, _, _)| class_row[k] / cells);

        Ok(FeatureGradients {
            target,
            score,
            activations,
            gradients,
        })
    }
}
