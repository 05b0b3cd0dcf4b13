//! Layered configuration loading.

use super::merge::merge_policy::builder_with_defaults;
use super::sources::{global_file, host_file};
use super::HostformConfig;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads `HostformConfig` from its sources.
///
/// Order, lowest precedence first: built-in defaults, the global XDG file,
/// `<root>/config/config.toml`, `<root>/config/{HOSTFORM_ENV}.toml`, then
/// `HOSTFORM__SECTION__KEY` environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(root: &Path) -> Result<HostformConfig, ConfigError> {
        let builder = builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = host_file::add_to_builder(builder, root)?;
        let config = finish(builder)?;
        debug!(root = %root.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load from one explicit file instead of the layered files. Defaults and
    /// environment variables still apply.
    pub fn load_from_file(path: &Path) -> Result<HostformConfig, ConfigError> {
        let builder = builder_with_defaults()?.add_source(File::from(path.to_path_buf()));
        let config = finish(builder)?;
        debug!(path = %path.display(), "Configuration loaded from file");
        Ok(config)
    }

    /// Location of the global config file, if a home directory is known.
    pub fn xdg_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }

    pub fn default() -> HostformConfig {
        HostformConfig::default()
    }
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<HostformConfig, ConfigError> {
    builder
        .add_source(
            Environment::with_prefix("HOSTFORM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
