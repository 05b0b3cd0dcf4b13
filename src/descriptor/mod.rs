//! Descriptor Loader
//!
//! A descriptor is a TOML document declaring the desired end-state of one
//! host. Loading parses it into a `DesiredState` tree, validates everything
//! that can be checked statically and computes the state's content hash.
//! Loading has no side effects.

pub mod declared;
pub mod hash;
pub mod load;
pub mod validate;

pub use declared::DeclaredMap;
pub use hash::compute_state_hash;
pub use load::{load_descriptor, parse_descriptor, LoadedDescriptor};
pub use validate::{validate, ValidationProblem};

use crate::action::SettingValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Desired state of one host. Immutable once loaded.
///
/// Every optional field means "not managed": the reconciler leaves the
/// corresponding host setting alone when it is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredState {
    #[serde(default)]
    pub host: HostSelector,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub drivers: DeclaredMap<DriverSpec>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub users: DeclaredMap<UserSpec>,
    #[serde(default)]
    pub services: DeclaredMap<ServiceSpec>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub files: DeclaredMap<FileSpec>,
    #[serde(default)]
    pub environment: DeclaredMap<String>,
}

/// Which host a descriptor is meant for. Unset fields match any host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSelector {
    pub hostname: Option<String>,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootConfig {
    /// Boot loader identifier, e.g. `systemd-boot`.
    pub loader: Option<String>,
    /// Kernel command line parameters, in order.
    pub kernel_params: Option<Vec<String>>,
    /// Kernel modules loaded at boot.
    pub kernel_modules: Option<Vec<String>>,
    /// Boot menu timeout in seconds.
    pub timeout_secs: Option<u32>,
}

/// A hardware driver: the package shipping it and the modules it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverSpec {
    pub package: String,
    #[serde(default)]
    pub kernel_modules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub hostname: Option<String>,
    pub firewall: Option<FirewallConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub allowed_tcp_ports: Vec<u16>,
    #[serde(default)]
    pub allowed_udp_ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    pub description: Option<String>,
    pub shell: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Enabled (and started) when true; disabled when false.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Package providing the service. Must also be listed in `packages`;
    /// it is installed ahead of the service rather than with user packages.
    pub package: Option<String>,
    /// Services that must be brought up first. Each must be declared earlier.
    #[serde(default)]
    pub after: Vec<String>,
    /// Service-specific settings, applied after the service is enabled.
    #[serde(default)]
    pub settings: DeclaredMap<SettingValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    pub content: String,
    /// Octal permission string such as `0644`. Defaults to whatever the
    /// backend creates files with.
    pub mode: Option<String>,
}

fn default_true() -> bool {
    true
}

impl DesiredState {
    /// Packages that are installed as part of bringing up a service.
    pub fn service_packages(&self) -> impl Iterator<Item = &str> {
        self.services
            .values()
            .filter_map(|service| service.package.as_deref())
    }

    /// Whether a package from `packages` is installed in the services stage.
    pub fn is_service_package(&self, package: &str) -> bool {
        self.service_packages().any(|p| p == package)
    }

    /// Every package this state keeps installed, whichever subsystem owns it:
    /// `packages` plus each driver's package.
    pub fn required_packages(&self) -> BTreeSet<&str> {
        self.packages
            .iter()
            .map(String::as_str)
            .chain(self.drivers.values().map(|driver| driver.package.as_str()))
            .collect()
    }
}
