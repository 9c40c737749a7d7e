pub mod native;
#[cfg(feature = "torch")]
pub mod torch;

use ndarray::Array3;
use shared::{CLASS_COUNT, ClassProbability, LesionClass, ModelInfo};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::{BackendKind, ModelConfig};
use crate::imaging::NormalizedImage;
use native::NativeClassifier;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Input tensor has shape {actual:?}, expected {expected}")]
    InputShape { expected: String, actual: Vec<usize> },
    #[error("Model produced non-finite values in {0}")]
    NonFinite(&'static str),
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),
    #[error("Invalid weights artifact: {0}")]
    Weights(String),
    #[error("Failed to read weights artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Model lock poisoned")]
    LockPoisoned,
    #[error("Backend {0:?} is not compiled into this build")]
    BackendUnavailable(BackendKind),
    #[cfg(feature = "torch")]
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
}

/// Probabilities over the fixed class set, stored in `LesionClass::ALL` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassProbabilityVector {
    probabilities: [f32; CLASS_COUNT],
}

impl ClassProbabilityVector {
    /// Numerically stable softmax over raw class scores.
    pub fn from_logits(logits: &[f32]) -> Result<Self, InferenceError> {
        if logits.len() != CLASS_COUNT {
            return Err(InferenceError::MalformedOutput(format!(
                "expected {} logits, got {}",
                CLASS_COUNT,
                logits.len()
            )));
        }
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(InferenceError::NonFinite("logits"));
        }

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut exps = [0.0f64; CLASS_COUNT];
        for (e, l) in exps.iter_mut().zip(logits) {
            *e = f64::from(l - max).exp();
        }
        let total: f64 = exps.iter().sum();

        let mut probabilities = [0.0f32; CLASS_COUNT];
        for (p, e) in probabilities.iter_mut().zip(exps) {
            *p = (e / total) as f32;
        }
        Ok(Self { probabilities })
    }

    /// Accepts probabilities that already sum to one within `1e-3` and renormalizes them.
    pub fn from_probabilities(values: &[f32]) -> Result<Self, InferenceError> {
        if values.len() != CLASS_COUNT {
            return Err(InferenceError::MalformedOutput(format!(
                "expected {} probabilities, got {}",
                CLASS_COUNT,
                values.len()
            )));
        }
        if values.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::NonFinite("probabilities"));
        }
        if values.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(InferenceError::MalformedOutput(
                "probability outside [0, 1]".into(),
            ));
        }
        let total: f64 = values.iter().map(|p| f64::from(*p)).sum();
        if (total - 1.0).abs() > 1e-3 {
            return Err(InferenceError::MalformedOutput(format!(
                "probabilities sum to {total}"
            )));
        }

        let mut probabilities = [0.0f32; CLASS_COUNT];
        for (p, v) in probabilities.iter_mut().zip(values) {
            *p = (f64::from(*v) / total) as f32;
        }
        Ok(Self { probabilities })
    }

    pub fn probability(&self, class: LesionClass) -> f32 {
        self.probabilities[class.index()]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn iter(&self) -> impl Iterator<Item = (LesionClass, f32)> + '_ {
        LesionClass::ALL.iter().copied().zip(self.probabilities.iter().copied())
    }

    /// Most probable class; ties resolve to the earlier class.
    pub fn top1(&self) -> (LesionClass, f32) {
        let mut best = (LesionClass::ALL[0], self.probabilities[0]);
        for (class, p) in self.iter().skip(1) {
            if p > best.1 {
                best = (class, p);
            }
        }
        best
    }

    /// All classes, most probable first.
    pub fn ranked(&self) -> Vec<ClassProbability> {
        let mut ranked: Vec<(LesionClass, f32)> = self.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.index().cmp(&b.0.index())));
        ranked
            .into_iter()
            .map(|(class, probability)| ClassProbability {
                class,
                name: class.display_name().to_string(),
                probability,
            })
            .collect()
    }

    pub fn malignant_mass(&self) -> f32 {
        self.iter()
            .filter(|(class, _)| class.is_malignant())
            .map(|(_, p)| p)
            .sum()
    }
}

/// Last feature-map activations of a forward pass and the gradient of one class
/// score with respect to them, both shaped `(channels, rows, cols)`.
#[derive(Debug, Clone)]
pub struct FeatureGradients {
    pub target: LesionClass,
    pub score: f32,
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub backend: &'static str,
    pub weights_sha256: Option<String>,
}

/// A frozen scorer over the fixed lesion class set.
///
/// Implementations must be safe to call from many threads at once. Every call to
/// `class_gradients` works in its own buffers or behind the implementation's own lock.
pub trait LesionClassifier: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    fn predict(&self, image: &NormalizedImage) -> Result<ClassProbabilityVector, InferenceError>;

    fn class_gradients(
        &self,
        image: &NormalizedImage,
        target: LesionClass,
    ) -> Result<FeatureGradients, InferenceError>;
}

/// Process-wide classifier handle, cheap to clone.
#[derive(Clone)]
pub struct Model {
    classifier: Arc<dyn LesionClassifier>,
    degraded: bool,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("descriptor", self.classifier.descriptor())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl Model {
    pub fn new(classifier: Arc<dyn LesionClassifier>) -> Self {
        Self {
            classifier,
            degraded: false,
        }
    }

    /// Loads the configured weights artifact. A missing artifact is not an error:
    /// the model comes up in degraded mode with random weights.
    pub fn load(config: &ModelConfig) -> Result<Self, InferenceError> {
        let path = config.weights_path.as_path();
        if !path.exists() {
            log::warn!(
                "Model weights not found at {}. Running in degraded mode: predictions are random and must not be presented as a diagnosis.",
                path.display()
            );
            return Ok(Self::degraded(config.degraded_seed));
        }

        let model = match config.backend {
            BackendKind::Native => Self::new(Arc::new(NativeClassifier::load(path)?)),
            BackendKind::Torch => Self::load_torch(path)?,
        };
        log::info!(
            "Loaded {} classifier from {}",
            model.classifier.descriptor().backend,
            path.display()
        );
        Ok(model)
    }

    #[cfg(feature = "torch")]
    fn load_torch(path: &Path) -> Result<Self, InferenceError> {
        Ok(Self::new(Arc::new(torch::TorchClassifier::load(path)?)))
    }

    #[cfg(not(feature = "torch"))]
    fn load_torch(_path: &Path) -> Result<Self, InferenceError> {
        Err(InferenceError::BackendUnavailable(BackendKind::Torch))
    }

    pub fn degraded(seed: Option<u64>) -> Self {
        let classifier = match seed {
            Some(seed) => NativeClassifier::random(seed),
            None => NativeClassifier::random_from_os(),
        };
        Self {
            classifier: Arc::new(classifier),
            degraded: true,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn inference(
        &self,
        image: &NormalizedImage,
    ) -> Result<ClassProbabilityVector, InferenceError> {
        self.classifier.predict(image)
    }

    pub fn class_gradients(
        &self,
        image: &NormalizedImage,
        target: LesionClass,
    ) -> Result<FeatureGradients, InferenceError> {
        self.classifier.class_gradients(image, target)
    }

    pub fn info(&self) -> ModelInfo {
        let descriptor = self.classifier.descriptor();
        ModelInfo {
            name: descriptor.name.clone(),
            backend: descriptor.backend.to_string(),
            classes: LesionClass::ALL.to_vec(),
            degraded: self.degraded,
            weights_sha256: descriptor.weights_sha256.clone(),
        }
    }
}
