pub mod config;
pub mod error;
pub mod model;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{DigitClassifier, DigitNetwork, InferenceResponse, ModelRegistry, Predictions};
pub use server::build_router;
