use ndarray::Array3;
use sha2::{Digest, Sha256};
use shared::LesionClass;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, IValue, Kind, Tensor};

use super::{
    ClassProbabilityVector, FeatureGradients, InferenceError, LesionClassifier, ModelDescriptor,
};
use crate::imaging::NormalizedImage;

/// TorchScript classifier. The traced module must return `(logits, features)` where
/// `features` are the last convolutional maps the logits were computed from.
pub struct TorchClassifier {
    module: Mutex<CModule>,
    device: Device,
    descriptor: ModelDescriptor,
}

impl TorchClassifier {
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let device = Device::cuda_if_available();
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);

        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        log::info!("TorchScript module loaded on {:?}", device);

        Ok(Self {
            module: Mutex::new(module),
            device,
            descriptor: ModelDescriptor {
                name: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "torchscript".to_string()),
                backend: "torch",
                weights_sha256: Some(hex::encode(hasher.finalize())),
            },
        })
    }

    fn input_tensor(&self, image: &NormalizedImage) -> Tensor {
        let (c, h, w) = image.tensor().dim();
        let data: Vec<f32> = image.tensor().iter().copied().collect();
        Tensor::from_slice(&data)
            .view([1, c as i64, h as i64, w as i64])
            .to_device(self.device)
    }

    fn forward(
        module: &CModule,
        input: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>), InferenceError> {
        match module.forward_is(&[IValue::Tensor(input.shallow_clone())])? {
            IValue::Tensor(logits) => Ok((logits, None)),
            IValue::Tuple(values) => {
                let mut values = values.into_iter();
                match (values.next(), values.next()) {
                    (Some(IValue::Tensor(logits)), Some(IValue::Tensor(features))) => {
                        Ok((logits, Some(features)))
                    }
                    _ => Err(InferenceError::MalformedOutput(
                        "expected a (logits, features) tuple".into(),
                    )),
                }
            }
            _ => Err(InferenceError::MalformedOutput(
                "module returned neither a tensor nor a tuple".into(),
            )),
        }
    }
}

fn to_vec(tensor: &Tensor) -> Vec<f32> {
    let flat = tensor.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
    let numel = flat.size()[0] as usize;
    let mut out = vec![0.0f32; numel];
    flat.copy_data(&mut out, numel);
    out
}

impl LesionClassifier for TorchClassifier {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn predict(&self, image: &NormalizedImage) -> Result<ClassProbabilityVector, InferenceError> {
        let input = self.input_tensor(image);
        let module = self.module.lock().map_err(|_| InferenceError::LockPoisoned)?;
        let (logits, _) = tch::no_grad(|| Self::forward(&module, &input))?;
        ClassProbabilityVector::from_logits(&to_vec(&logits))
    }

    fn class_gradients(
        &self,
        image: &NormalizedImage,
        target: LesionClass,
    ) -> Result<FeatureGradients, InferenceError> {
        let input = self.input_tensor(image);
        // Forward and backward both run under the lock so two explanations never
        // share autograd state.
        let module = self.module.lock().map_err(|_| InferenceError::LockPoisoned)?;
        let (logits, features) = Self::forward(&module, &input)?;
        let features = features.ok_or_else(|| {
            InferenceError::MalformedOutput("module does not expose feature maps".into())
        })?;

        let score = logits.view([-1]).get(target.index() as i64);
        let gradient = Tensor::f_run_backward(&[&score], &[&features], false, false)?
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::MalformedOutput("no gradient returned".into()))?;

        let dims = features.size();
        if dims.len() != 4 || dims[0] != 1 {
            return Err(InferenceError::MalformedOutput(format!(
                "feature maps have shape {dims:?}, expected [1, K, H, W]"
            )));
        }
        let shape = (dims[1] as usize, dims[2] as usize, dims[3] as usize);
        let activations = Array3::from_shape_vec(shape, to_vec(&features.detach()))
            .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;
        let gradients = Array3::from_shape_vec(shape, to_vec(&gradient))
            .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;

        Ok(FeatureGradients {
            target,
            score: score.double_value(&[]) as f32,
            activations,
            gradients,
        })
    }
}
