use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::model::DEFAULT_MAX_IMAGE_DIMENSION;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub model_path: PathBuf,
    pub preprocessor_config_path: PathBuf,
    /// Limit on the whole multipart request body, boundaries and part
    /// headers included, so the largest accepted file is slightly smaller.
    pub max_upload_bytes: usize,
    /// Largest decoded width or height accepted from an upload.
    pub max_image_dimension: u32,
    /// Empty means any origin is allowed.
    pub cors_allow_origins: Vec<String>,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unparsable values fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT));

        let model_id = lookup("MODEL_ID")
            .unwrap_or_else(|| "prithivMLmods/Mnist-Digits-SigLIP2".to_string());
        let model_path = PathBuf::from(
            lookup("MODEL_PATH").unwrap_or_else(|| "models/mnist_digits_siglip2.ts".to_string()),
        );
        let preprocessor_config_path = PathBuf::from(
            lookup("PREPROCESSOR_CONFIG_PATH")
                .unwrap_or_else(|| "models/preprocessor_config.json".to_string()),
        );

        let max_upload_bytes = lookup("MAX_UPLOAD_BYTES")
            .and_then(|v| v.parse().ok())
            .filter(|&bytes: &usize| bytes > 0)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let max_image_dimension = lookup("MAX_IMAGE_DIMENSION")
            .and_then(|v| v.parse().ok())
            .filter(|&dim: &u32| dim > 0)
            .unwrap_or(DEFAULT_MAX_IMAGE_DIMENSION);

        let cors_allow_origins = lookup("CORS_ALLOW_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .unwrap_or_default();

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            model_id,
            model_path,
            preprocessor_config_path,
            max_upload_bytes,
            max_image_dimension,
            cors_allow_origins,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if origins.iter().any(|o| o == "*") {
        Vec::new()
    } else {
        origins
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn defaults_listen_on_container_port() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr.port(), 8000);
        assert!(config.listen_addr.ip().is_unspecified());
        assert_eq!(config.model_id, "prithivMLmods/Mnist-Digits-SigLIP2");
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(config.max_image_dimension, 4096);
        assert!(config.cors_allow_origins.is_empty());
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = config_from(&[
            ("SERVER_ADDR", "not-an-addr"),
            ("MAX_UPLOAD_BYTES", "0"),
            ("MAX_IMAGE_DIMENSION", "-5"),
        ]);
        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert_eq!(config.max_image_dimension, DEFAULT_MAX_IMAGE_DIMENSION);
    }

    #[test]
    fn explicit_origins_are_trimmed() {
        let config = config_from(&[(
            "CORS_ALLOW_ORIGINS",
            " http://localhost:3000 , https://demo.example.com,",
        )]);
        assert_eq!(
            config.cors_allow_origins,
            vec!["http://localhost:3000", "https://demo.example.com"]
        );

        let wildcard = config_from(&[("CORS_ALLOW_ORIGINS", "http://a.test,*")]);
        assert!(wildcard.cors_allow_origins.is_empty());
    }
}
