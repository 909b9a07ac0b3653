use std::{fs, path::Path};

use image::{DynamicImage, imageops::FilterType};
use serde::{Deserialize, Serialize};

use crate::{error::ServiceError, model::PixelTensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

/// Resize/rescale/normalize transform paired with the model, read from a
/// Hugging Face `preprocessor_config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageProcessor {
    pub do_resize: bool,
    pub size: ImageSize,
    /// PIL resampling code.
    pub resample: u8,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: ImageSize {
                height: 224,
                width: 224,
            },
            resample: 2,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5; 3],
            image_std: [0.5; 3],
        }
    }
}

impl ImageProcessor {
    /// Loads the processor config, or the defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "preprocessor config not found, using default image processor"
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ServiceError> {
        let processor: Self =
            serde_json::from_str(raw).map_err(|e| ServiceError::Preprocessor(e.to_string()))?;
        processor.validate()?;
        Ok(processor)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        if self.do_resize && (self.size.height == 0 || self.size.width == 0) {
            return Err(ServiceError::Preprocessor(
                "resize target must be non-empty".into(),
            ));
        }
        if self.do_normalize && self.image_std.iter().any(|&s| s == 0.0) {
            return Err(ServiceError::Preprocessor(
                "image_std must not contain zero".into(),
            ));
        }
        Ok(())
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            3 => FilterType::CatmullRom,
            _ => FilterType::Triangle,
        }
    }

    pub fn preprocess(&self, image: &DynamicImage) -> Result<PixelTensor, ServiceError> {
        let mut rgb = image.to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(ServiceError::BadRequest("image has no pixels".into()));
        }
        if self.do_resize && (rgb.width(), rgb.height()) != (self.size.width, self.size.height) {
            rgb = image::imageops::resize(&rgb, self.size.width, self.size.height, self.filter());
        }

        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let plane = width * height;
        let mut data = vec![0f32; PixelTensor::CHANNELS * plane];

        for (idx, pixel) in rgb.pixels().enumerate() {
            for channel in 0..PixelTensor::CHANNELS {
                let mut value = f32::from(pixel.0[channel]);
                if self.do_rescale {
                    value *= self.rescale_factor;
                }
                if self.do_normalize {
                    value = (value - self.image_mean[channel]) / self.image_std[channel];
                }
                data[channel * plane + idx] = value;
            }
        }

        Ok(PixelTensor {
            height,
            width,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, RgbImage};

    use super::*;

    #[test]
    fn parses_siglip_processor_config() {
        let raw = r#"{
            "do_normalize": true,
            "do_rescale": true,
            "do_resize": true,
            "image_mean": [0.5, 0.5, 0.5],
            "image_processor_type": "SiglipImageProcessor",
            "image_std": [0.5, 0.5, 0.5],
            "processor_class": "SiglipProcessor",
            "resample": 2,
            "rescale_factor": 0.00392156862745098,
            "size": {"height": 224, "width": 224}
        }"#;
        let processor = ImageProcessor::from_json(raw).unwrap();
        assert_eq!(processor.size, ImageSize { height: 224, width: 224 });
        assert_eq!(processor.filter(), FilterType::Triangle);
    }

    #[test]
    fn rejects_zero_std() {
        let err = ImageProcessor::from_json(r#"{"image_std": [0.5, 0.0, 0.5]}"#).unwrap_err();
        assert!(matches!(err, ServiceError::Preprocessor(_)));
    }

    #[test]
    fn grayscale_is_expanded_resized_and_normalized() {
        let processor = ImageProcessor {
            size: ImageSize {
                height: 4,
                width: 6,
            },
            ..ImageProcessor::default()
        };
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(28, 28, Luma([255])));
        let tensor = processor.preprocess(&image).unwrap();

        assert_eq!(tensor.shape(), [1, 3, 4, 6]);
        assert_eq!(tensor.data.len(), 3 * 4 * 6);
        assert!(tensor.data.iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn channels_are_planar() {
        let processor = ImageProcessor {
            do_resize: false,
            do_rescale: false,
            do_normalize: false,
            ..ImageProcessor::default()
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        }));
        let tensor = processor.preprocess(&image).unwrap();

        assert_eq!(tensor.shape(), [1, 3, 1, 2]);
        // red plane, green plane, blue plane
        assert_eq!(tensor.data, vec![255.0, 0.0, 0.0, 0.0, 0.0, 255.0]);
    }
}
