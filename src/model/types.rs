use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Class labels in network output order.
pub const LABELS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// Decimal places kept in reported probabilities.
pub const PROBABILITY_DECIMALS: i32 = 3;

/// Planar `[1, 3, height, width]` input for the network.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelTensor {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl PixelTensor {
    pub const CHANNELS: usize = 3;

    pub fn shape(&self) -> [i64; 4] {
        [1, Self::CHANNELS as i64, self.height as i64, self.width as i64]
    }
}

/// Probability per digit label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Predictions(BTreeMap<String, f64>);

impl Predictions {
    /// Pairs each probability with its label, rounding for presentation.
    pub fn from_probabilities(probabilities: &[f32]) -> Self {
        let scale = 10f64.powi(PROBABILITY_DECIMALS);
        let map = LABELS
            .iter()
            .zip(probabilities)
            .map(|(label, &p)| (label.to_string(), (f64::from(p) * scale).round() / scale))
            .collect();
        Self(map)
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.0.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(label, &p)| (label.as_str(), p))
    }

    /// Most likely label. Ties resolve to the lowest label.
    pub fn top(&self) -> Option<(&str, f64)> {
        self.iter().fold(None, |best, (label, p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((label, p)),
        })
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub predictions: Predictions,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub backend: String,
    pub device: String,
    pub size_bytes: u64,
}
