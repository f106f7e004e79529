//! Configuration parsing and structures

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Mount points
    pub mounts: Vec<MountConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One mounted remote namespace
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    /// Remote mount point every virtual path is appended to
    pub remote: String,

    /// Pass virtual paths through as bare identifiers (catalog GUIDs)
    #[serde(default)]
    pub guid_mode: bool,

    /// Mount as read-only
    #[serde(default)]
    pub read_only: bool,

    /// Owner reported for every object; defaults to the process owner
    pub uid: Option<u32>,
    pub gid: Option<u32>,

    /// Kernel attribute cache lifetime
    #[serde(default, with = "humantime_serde")]
    pub attr_ttl: Option<Duration>,

    /// Answer create-intent attribute queries without a remote call.
    /// Derived from the remote scheme when unset.
    pub create_attr_shortcut: Option<bool>,

    /// Catalog upload workflow used when creating files
    pub upload: Option<UploadConfig>,
}

/// Parameters of the copy-then-register upload workflow
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Virtual organisation, first path component on the storage element
    pub vo: String,

    /// Storage element host new replicas are written to
    pub se: String,

    /// Catalog host stripped from remote paths to form catalog names
    pub lfc_host: String,

    /// Placeholder object copied to produce an empty replica
    pub empty_file: String,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one mount point is required".to_string(),
            ));
        }

        // Check for duplicate mount paths
        let mut paths = HashSet::new();
        for mount in &self.mounts {
            if !paths.insert(&mount.path) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate mount path: {:?}",
                    mount.path
                )));
            }
        }

        for mount in &self.mounts {
            if mount.remote.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Mount {:?}: remote cannot be empty",
                    mount.path
                )));
            }

            if let Some(upload) = &mount.upload {
                let fields = [
                    ("vo", &upload.vo),
                    ("se", &upload.se),
                    ("lfc_host", &upload.lfc_host),
                    ("empty_file", &upload.empty_file),
                ];
                for (name, value) in fields {
                    if value.is_empty() {
                        return Err(ConfigError::ValidationError(format!(
                            "Mount {:?}: upload.{} cannot be empty",
                            mount.path, name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
