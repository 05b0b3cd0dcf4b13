//! Configuration System
//!
//! Layered configuration for the reconciler: which descriptor to load, where
//! the generation store lives, which host backend applies actions, the
//! watchdog limit and logging. Values merge from defaults, the global XDG
//! file, per-host files and environment variables (see [`ConfigLoader`]).

use crate::host::CommandTemplates;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod facade;
mod merge {
    pub mod merge_policy;
}
pub mod paths;
mod sources {
    pub mod global_file;
    pub mod host_file;
}

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostformConfig {
    /// Descriptor to reconcile. Relative paths resolve against the directory
    /// hostform runs from.
    pub descriptor: PathBuf,

    pub storage: StorageConfig,

    pub backend: BackendConfig,

    pub reconcile: ReconcileConfig,

    pub logging: LoggingConfig,
}

impl Default for HostformConfig {
    fn default() -> Self {
        Self {
            descriptor: PathBuf::from("hostform.toml"),
            storage: StorageConfig::default(),
            backend: BackendConfig::default(),
            reconcile: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Storage paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for hostform data. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Generation store directory; relative paths resolve against `data_dir`.
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Host modelled by a JSON image file.
    #[default]
    StateFile,
    /// Real host driven through configured shell commands.
    Command,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Host image for the state-file backend.
    pub state_file: Option<PathBuf>,
    /// Managed environment file for the command backend.
    pub env_file: Option<PathBuf>,
    /// Architectures whose boot and driver probes the command backend can run.
    /// Empty means all.
    pub hardware_arches: Vec<String>,
    pub commands: CommandTemplates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Log a warning when one action runs longer than this.
    pub watchdog_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { watchdog_secs: 300 }
    }
}

impl ReconcileConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Descriptor(String),
    Storage(String),
    Backend(String),
    Reconcile(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Descriptor(msg) => write!(f, "Descriptor: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Backend(msg) => write!(f, "Backend: {}", msg),
            ValidationError::Reconcile(msg) => write!(f, "Reconcile: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl HostformConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.descriptor.as_os_str().is_empty() {
            errors.push(ValidationError::Descriptor(
                "Descriptor path cannot be empty".to_string(),
            ));
        }

        if matches!(&self.storage.store_path, Some(p) if p.as_os_str().is_empty()) {
            errors.push(ValidationError::Storage(
                "Store path cannot be empty".to_string(),
            ));
        }
        if matches!(&self.storage.data_dir, Some(p) if p.as_os_str().is_empty()) {
            errors.push(ValidationError::Storage(
                "Data directory cannot be empty".to_string(),
            ));
        }

        if self.backend.kind == BackendKind::Command && self.backend.env_file.is_none() {
            errors.push(ValidationError::Backend(
                "env_file is required for the command backend".to_string(),
            ));
        }
        if self.backend.hardware_arches.iter().any(|a| a.trim().is_empty()) {
            errors.push(ValidationError::Backend(
                "hardware_arches entries cannot be empty".to_string(),
            ));
        }

        if self.reconcile.watchdog_secs == 0 {
            errors.push(ValidationError::Reconcile(
                "watchdog_secs must be at least 1".to_string(),
            ));
        }

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn descriptor_path(&self, root: &Path) -> PathBuf {
        resolve(root, &self.descriptor)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(paths::default_data_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        let data_dir = self.data_dir();
        match &self.storage.store_path {
            Some(path) => resolve(&data_dir, path),
            None => data_dir.join("store"),
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}
