//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("descriptor", "hostform.toml")?
        .set_default("backend.kind", "state-file")?
        .set_default("reconcile.watchdog_secs", 300)
}
