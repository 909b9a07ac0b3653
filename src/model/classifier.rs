use std::{sync::Arc, time::Instant};

use image::DynamicImage;

use crate::{
    error::ServiceError,
    model::{ImageProcessor, LABELS, ModelMetadata, PixelTensor, Predictions},
};

/// A pretrained network mapping one preprocessed image to raw class scores.
pub trait DigitNetwork: Send + Sync {
    fn forward(&self, input: &PixelTensor) -> Result<Vec<f32>, ServiceError>;

    fn metadata(&self) -> ModelMetadata;
}

/// Image processor plus network, immutable after construction.
pub struct DigitClassifier {
    processor: ImageProcessor,
    network: Arc<dyn DigitNetwork>,
}

impl DigitClassifier {
    pub fn new(processor: ImageProcessor, network: Arc<dyn DigitNetwork>) -> Self {
        Self { processor, network }
    }

    pub fn processor(&self) -> &ImageProcessor {
        &self.processor
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.network.metadata()
    }

    pub fn classify(&self, image: &DynamicImage) -> Result<Predictions, ServiceError> {
        let start = Instant::now();
        let input = self.processor.preprocess(image)?;
        let logits = self.network.forward(&input)?;
        if logits.len() != LABELS.len() {
            return Err(ServiceError::Inference(format!(
                "expected {} class scores, network produced {}",
                LABELS.len(),
                logits.len()
            )));
        }

        let predictions = Predictions::from_probabilities(&softmax(&logits));
        if let Some((label, probability)) = predictions.top() {
            tracing::debug!(
                label,
                probability,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "classified image"
            );
        }
        Ok(predictions)
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
