//! Unpacker configuration
//!
//! Stored as YAML, every field optional:
//!
//! ```yaml
//! cacheRoot: /var/cache/bundles
//! fetchTimeoutSecs: 300
//! insecureRegistries: ["localhost:5000"]
//! linkPolicy: skip
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, Stage, UnpackError};

/// Unpacker configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpackerConfig {
    /// Root of the per-bundle cache directories
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Upper bound for each network stage (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Registries reached over plain HTTP (e.g. a local test registry)
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// How symlinks and hardlinks inside archives are handled
    #[serde(default)]
    pub link_policy: LinkPolicy,

    /// User agent sent on every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bundle-unpack")
        .join("bundles")
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("bundle-unpack/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for UnpackerConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            fetch_timeout_secs: default_fetch_timeout(),
            insecure_registries: Vec::new(),
            link_policy: LinkPolicy::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl UnpackerConfig {
    /// Configuration rooted at a specific cache directory
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| UnpackError::io(Stage::Config, path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| UnpackError::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| UnpackError::io(Stage::Config, parent, e))?;
        }
        let content = serde_yaml::to_string(self).map_err(|e| UnpackError::InvalidConfig {
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| UnpackError::io(Stage::Config, path, e))?;
        Ok(())
    }

    /// Get default configuration path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| UnpackError::InvalidConfig {
            message: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("bundle-unpack").join("config.yaml"))
    }

    /// Timeout applied to each network stage
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(UnpackError::InvalidConfig {
                message: "cacheRoot must not be empty".to_string(),
            });
        }
        if self.fetch_timeout_secs == 0 {
            return Err(UnpackError::InvalidConfig {
                message: "fetchTimeoutSecs must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Link handling inside archives and image layers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPolicy {
    /// Skip symlinks and hardlinks with a diagnostic
    #[default]
    Skip,

    /// Recreate links whose target stays inside the destination root
    Preserve,
}
