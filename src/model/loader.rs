#[cfg(feature = "tch-backend")]
use std::sync::Arc;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{DigitClassifier, ImageProcessor},
};

#[cfg(feature = "tch-backend")]
pub use torchscript::TorchScriptNetwork;

/// Loads the image processor and the pretrained network named by the config.
pub fn load_classifier(config: &AppConfig) -> Result<DigitClassifier, ServiceError> {
    let processor = ImageProcessor::load(&config.preprocessor_config_path)?;

    #[cfg(feature = "tch-backend")]
    {
        let network =
            TorchScriptNetwork::new(&config.model_id, &config.model_path, config.device)?;
        Ok(DigitClassifier::new(processor, Arc::new(network)))
    }

    #[cfg(not(feature = "tch-backend"))]
    {
        let _ = processor;
        Err(ServiceError::ModelLoading(
            "built without a model backend; enable the `tch-backend` feature".into(),
        ))
    }
}

#[cfg(feature = "tch-backend")]
mod torchscript {
    use std::{fs, path::Path};

    use parking_lot::Mutex;
    use tch::{Device, IValue, Kind, Tensor, no_grad};

    use crate::{
        error::ServiceError,
        model::{DigitNetwork, ModelMetadata, PixelTensor},
    };

    /// A traced or scripted classifier exported with TorchScript.
    pub struct TorchScriptNetwork {
        name: String,
        size_bytes: u64,
        device: Device,
        module: Mutex<tch::CModule>,
    }

    impl TorchScriptNetwork {
        pub fn new(name: &str, module_path: &Path, device: Device) -> Result<Self, ServiceError> {
            if !module_path.exists() {
                return Err(ServiceError::ModelLoading(format!(
                    "model artifact missing: {}",
                    module_path.display()
                )));
            }
            let size_bytes = fs::metadata(module_path)?.len();
            let mut module = tch::CModule::load_on_device(module_path, device)
                .map_err(|e| ServiceError::ModelLoading(e.to_string()))?;
            module.set_eval();

            tracing::info!(
                name,
                path = %module_path.display(),
                size_bytes,
                ?device,
                "loaded TorchScript module"
            );

            Ok(Self {
                name: name.to_string(),
                size_bytes,
                device,
                module: Mutex::new(module),
            })
        }
    }

    impl DigitNetwork for TorchScriptNetwork {
        fn forward(&self, input: &PixelTensor) -> Result<Vec<f32>, ServiceError> {
            let pixel_values = Tensor::from_slice(&input.data)
                .reshape(input.shape())
                .to(self.device);

            let logits = no_grad(|| {
                let module = self.module.lock();
                let output = module
                    .forward_is(&[IValue::Tensor(pixel_values)])
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;

                // Traced Hugging Face models return `(logits,)` rather than a bare tensor.
                match output {
                    IValue::Tensor(t) => Ok(t),
                    IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        IValue::Tensor(t) => Ok(t.shallow_clone()),
                        _ => Err(ServiceError::Inference(
                            "expected tensor as first tuple element".into(),
                        )),
                    },
                    _ => Err(ServiceError::Inference(
                        "unexpected model output format".into(),
                    )),
                }
            })?;

            let flat = logits
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .view([-1]);
            Vec::<f32>::try_from(&flat).map_err(|e| ServiceError::Inference(e.to_string()))
        }

        fn metadata(&self) -> ModelMetadata {
            ModelMetadata {
                name: self.name.clone(),
                backend: "torchscript".to_string(),
                device: format!("{:?}", self.device),
                size_bytes: self.size_bytes,
            }
        }
    }

}
