//! Provisioning settings, stored as `config.json` in LINKEDLAMP_HOME

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use linkedlamp_proto::ble::DEVICE_NAME_PREFIX;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory, set LINKEDLAMP_HOME")]
    NoHome,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Only devices whose advertised name starts with this are candidates
    pub device_name_prefix: String,
    /// How long one scan listens before returning what it saw
    pub scan_timeout_ms: u64,
    /// Pause between empty scans while waiting for a device
    pub retry_delay_ms: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: DEVICE_NAME_PREFIX.to_string(),
            scan_timeout_ms: 10_000,
            retry_delay_ms: 500,
        }
    }
}

impl ProvisioningConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Read `home/config.json`, writing the defaults there if it does not exist
    pub fn load_or_create(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join("config.json");
        let io = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };

        if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(io)?;
            return serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            });
        }

        std::fs::create_dir_all(home).map_err(|source| ConfigError::Io {
            path: home.to_path_buf(),
            source,
        })?;
        let config = Self::default();
        let data = serde_json::to_string_pretty(&config).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, data).map_err(io)?;
        Ok(config)
    }
}

/// LINKEDLAMP_HOME, or `~/.linkedlamp`
pub fn linkedlamp_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var("LINKEDLAMP_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".linkedlamp"))
        .ok_or(ConfigError::NoHome)
}
