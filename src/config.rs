//! Runtime configuration, stored as JSON under the user config directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::device::{DeviceOptions, DispatchConfig};
use crate::error::{DequantError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DeviceOptions,
    pub dispatch: DispatchConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceOptions::default(),
            dispatch: DispatchConfig::default(),
            log_filter: "info".into(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpu-dequant")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl RuntimeConfig {
    /// Read `path`. Missing or malformed files are errors.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| DequantError::Config {
            reason: format!("{}: {e}", path.display()),
        })?;
        serde_json::from_str(&data).map_err(|e| DequantError::Config {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Read `path` if given, else the default location. Without an explicit
    /// path a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => {
                let path = config_path();
                if !path.exists() {
                    return Ok(Self::default());
                }
                Self::from_path(&path)
            }
        }
    }

    /// Write to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| DequantError::Config {
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "dispatch": { "warp_size": 32 }, "device": { "allow_software_adapter": true } }"#)
            .unwrap();

        let config = RuntimeConfig::from_path(&path).unwrap();
        assert_eq!(config.dispatch.warp_size, 32);
        assert_eq!(config.dispatch.num_cores, 4);
        assert_eq!(config.dispatch.max_warps_per_core, 8);
        assert!(config.device.allow_software_adapter);
        assert!(config.device.adapter_name.is_none());
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = RuntimeConfig::default();
        config.device.adapter_name = Some("radeon".into());
        config.log_filter = "gpu_dequant=debug".into();
        config.save(&path).unwrap();

        let loaded = RuntimeConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.device.adapter_name.as_deref(), Some("radeon"));
        assert_eq!(loaded.log_filter, "gpu_dequant=debug");
        assert_eq!(loaded.dispatch, DispatchConfig::default());
    }

    #[test]
    fn test_bad_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(matches!(
            RuntimeConfig::from_path(&path),
            Err(DequantError::Config { .. })
        ));
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RuntimeConfig::from_path(&path),
            Err(DequantError::Config { .. })
        ));
    }
}
