use std::{io::Cursor, sync::Arc};

use image::{DynamicImage, ImageReader, Limits};
use tokio::task;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{DigitClassifier, ModelMetadata, Predictions, loader::load_classifier},
};

/// Default cap on decoded upload width and height.
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 4096;

/// Process-wide handle to the loaded classifier.
pub struct ModelRegistry {
    classifier: Arc<DigitClassifier>,
    max_image_dimension: u32,
}

impl ModelRegistry {
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let classifier = load_classifier(config)?;
        Ok(Self::from_classifier(classifier).with_max_image_dimension(config.max_image_dimension))
    }

    pub fn from_classifier(classifier: DigitClassifier) -> Self {
        Self {
            classifier: Arc::new(classifier),
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
        }
    }

    pub fn with_max_image_dimension(mut self, max_image_dimension: u32) -> Self {
        self.max_image_dimension = max_image_dimension;
        self
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.classifier.metadata()
    }

    pub fn classifier(&self) -> &DigitClassifier {
        &self.classifier
    }

    /// Decodes an uploaded file and classifies it off the async runtime.
    pub async fn classify_bytes(&self, bytes: Vec<u8>) -> Result<Predictions, ServiceError> {
        let max_dimension = self.max_image_dimension;
        self.spawn_inference(move |classifier| {
            let image = decode_image(&bytes, max_dimension)?;
            classifier.classify(&image)
        })
        .await
    }

    pub async fn classify(&self, image: DynamicImage) -> Result<Predictions, ServiceError> {
        self.spawn_inference(move |classifier| classifier.classify(&image))
            .await
    }

    async fn spawn_inference<F>(&self, job: F) -> Result<Predictions, ServiceError>
    where
        F: FnOnce(&DigitClassifier) -> Result<Predictions, ServiceError> + Send + 'static,
    {
        let classifier = self.classifier.clone();
        task::spawn_blocking(move || job(&classifier))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

/// Decodes raw upload bytes, guessing the format from content. Images wider
/// or taller than `max_dimension` are refused before their pixels are
/// allocated.
pub fn decode_image(bytes: &[u8], max_dimension: u32) -> Result<DynamicImage, ServiceError> {
    let mut limits = Limits::default();
    limits.max_image_width = Some(max_dimension);
    limits.max_image_height = Some(max_dimension);
    // Room for one 16-bit RGBA frame at the largest accepted size.
    limits.max_alloc = Some(u64::from(max_dimension).pow(2) * 8);

    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits);
    Ok(reader.decode()?)
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;
    use crate::model::{DigitNetwork, ImageProcessor, PixelTensor};

    struct MeanNetwork;

    impl DigitNetwork for MeanNetwork {
        fn forward(&self, input: &PixelTensor) -> Result<Vec<f32>, ServiceError> {
            let mean = input.data.iter().sum::<f32>() / input.data.len() as f32;
            Ok((0..10).map(|i| mean * i as f32).collect())
        }

        fn metadata(&self) -> ModelMetadata {
            ModelMetadata {
                name: "mean".into(),
                backend: "test".into(),
                device: "cpu".into(),
                size_bytes: 0,
            }
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::from_classifier(DigitClassifier::new(
            ImageProcessor::default(),
            Arc::new(MeanNetwork),
        ))
    }

    #[tokio::test]
    async fn classify_runs_on_blocking_pool() {
        let registry = registry();
        let white = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([255])));
        let predictions = registry.classify(white).await.unwrap();
        assert_eq!(predictions.top().map(|(label, _)| label), Some("9"));

        let black = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([0])));
        let predictions = registry.classify(black).await.unwrap();
        assert_eq!(predictions.top().map(|(label, _)| label), Some("0"));
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageLuma8(GrayImage::new(width, height));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn classify_bytes_refuses_images_beyond_dimension_cap() {
        let registry = registry().with_max_image_dimension(64);

        let err = registry.classify_bytes(png(65, 8)).await.unwrap_err();
        assert!(matches!(err, ServiceError::ImageDecode(image::ImageError::Limits(_))));

        let err = registry.classify_bytes(png(8, 65)).await.unwrap_err();
        assert!(matches!(err, ServiceError::ImageDecode(image::ImageError::Limits(_))));

        assert!(registry.classify_bytes(png(64, 64)).await.is_ok());
    }

    #[test]
    fn small_file_with_huge_dimensions_is_refused() {
        // A blank 5000x5000 PNG compresses to well under a megabyte.
        let bytes = png(5_000, 5_000);
        assert!(bytes.len() < 1024 * 1024);
        let err = decode_image(&bytes, DEFAULT_MAX_IMAGE_DIMENSION).unwrap_err();
        assert!(matches!(err, ServiceError::ImageDecode(image::ImageError::Limits(_))));
    }

    #[tokio::test]
    async fn classify_bytes_surfaces_decode_errors() {
        let err = registry().classify_bytes(vec![0, 1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, ServiceError::ImageDecode(_)));
    }

    #[test]
    fn non_image_bytes_fail_to_decode() {
        let err = decode_image(b"definitely not a png", DEFAULT_MAX_IMAGE_DIMENSION).unwrap_err();
        assert!(matches!(err, ServiceError::ImageDecode(_)));
    }
}
