mod classifier;
mod loader;
mod preprocess;
mod registry;
mod types;

pub use classifier::{DigitClassifier, DigitNetwork, softmax};
#[cfg(feature = "tch-backend")]
pub use loader::TorchScriptNetwork;
pub use loader::load_classifier;
pub use preprocess::{ImageProcessor, ImageSize};
pub use registry::{DEFAULT_MAX_IMAGE_DIMENSION, ModelRegistry, decode_image};
pub use types::{InferenceResponse, LABELS, ModelMetadata, PixelTensor, Predictions};
