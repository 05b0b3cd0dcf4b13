//! Observed state: what the host looked like at probe time.
//!
//! The tree mirrors `DesiredState`, but every leaf is an `Observed<T>` so a
//! failed probe can mark exactly the fields it could not see. Named maps are
//! keyed by the probe scope; a name missing from a map is read as `Unknown`.

use crate::action::{Action, ActionKind, SettingValue};
use crate::descriptor::DesiredState;
use crate::subsystem::Subsystem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A probed value, or the reason it could not be probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observed<T> {
    Known(T),
    Unknown { reason: String },
}

impl<T> Observed<T> {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Observed::Unknown {
            reason: reason.into(),
        }
    }

    pub fn known(&self) -> Option<&T> {
        match self {
            Observed::Known(value) => Some(value),
            Observed::Unknown { .. } => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Observed::Unknown { .. })
    }
}

impl<T> Default for Observed<T> {
    fn default() -> Self {
        Observed::unknown("not probed")
    }
}

/// Host-identifying facts. Read-only inputs to probe selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub arch: String,
}

impl HostFacts {
    /// Read facts from the running host: `HOSTNAME`, then `/etc/hostname`,
    /// and the compile-time target architecture.
    pub fn detect() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            hostname,
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub boot: ObservedBoot,
    pub drivers: BTreeMap<String, ObservedDriver>,
    pub network: ObservedNetwork,
    /// `None` inside `Known` means the account does not exist.
    pub users: BTreeMap<String, Observed<Option<ObservedUser>>>,
    pub services: BTreeMap<String, Observed<ObservedService>>,
    /// `true` when installed.
    pub packages: BTreeMap<String, Observed<bool>>,
    pub files: BTreeMap<String, Observed<Option<ObservedFile>>>,
    pub environment: BTreeMap<String, Observed<Option<String>>>,
}

impl ObservedState {
    /// The host as it looks once `state` has been fully applied, assuming no
    /// drift. Used to plan a rollback from stored generations alone.
    pub fn converged(state: &DesiredState) -> Self {
        let mut observed = ObservedState {
            boot: ObservedBoot {
                loader: Observed::Known(state.boot.loader.clone()),
                kernel_params: Observed::Known(
                    state.boot.kernel_params.clone().unwrap_or_default(),
                ),
                kernel_modules: Observed::Known(
                    state.boot.kernel_modules.clone().unwrap_or_default(),
                ),
                timeout_secs: Observed::Known(state.boot.timeout_secs),
            },
            network: ObservedNetwork {
                hostname: Observed::Known(state.network.hostname.clone()),
                firewall_enabled: Observed::Known(
                    state.network.firewall.as_ref().map(|f| f.enable).unwrap_or(false),
                ),
                allowed_tcp_ports: Observed::Known(
                    state
                        .network
                        .firewall
                        .as_ref()
                        .map(|f| f.allowed_tcp_ports.clone())
                        .unwrap_or_default(),
                ),
                allowed_udp_ports: Observed::Known(
                    state
                        .network
                        .firewall
                        .as_ref()
                        .map(|f| f.allowed_udp_ports.clone())
                        .unwrap_or_default(),
                ),
            },
            ..Default::default()
        };

        for (name, driver) in state.drivers.iter() {
            observed.drivers.insert(
                name.to_string(),
                ObservedDriver {
                    package: driver.package.clone(),
                    installed: Observed::Known(true),
                    kernel_modules: Observed::Known(driver.kernel_modules.clone()),
                },
            );
        }
        for (name, user) in state.users.iter() {
            observed.users.insert(
                name.to_string(),
                Observed::Known(Some(ObservedUser {
                    description: user.description.clone(),
                    shell: user.shell.clone(),
                    groups: user.groups.clone(),
                })),
            );
        }
        for (name, service) in state.services.iter() {
            observed.services.insert(
                name.to_string(),
                Observed::Known(ObservedService {
                    enabled: service.enable,
                    settings: service
                        .settings
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                }),
            );
        }
        for package in state.required_packages() {
            observed
                .packages
                .insert(package.to_string(), Observed::Known(true));
        }
        for (path, file) in state.files.iter() {
            observed.files.insert(
                path.to_string(),
                Observed::Known(Some(ObservedFile {
                    content_hash: hex::encode(crate::descriptor::hash::compute_content_hash(
                        file.content.as_bytes(),
                    )),
                    mode: file.mode.clone(),
                })),
            );
        }
        for (name, value) in state.environment.iter() {
            observed
                .environment
                .insert(name.to_string(), Observed::Known(Some(value.clone())));
        }
        observed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedBoot {
    pub loader: Observed<Option<String>>,
    pub kernel_params: Observed<Vec<String>>,
    pub kernel_modules: Observed<Vec<String>>,
    pub timeout_secs: Observed<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedDriver {
    /// Package shipping the driver, taken from the probe scope.
    pub package: String,
    pub installed: Observed<bool>,
    pub kernel_modules: Observed<Vec<String>>,
}

impl ObservedDriver {
    pub fn unknown(package: impl Into<String>, reason: &str) -> Self {
        Self {
            package: package.into(),
            installed: Observed::unknown(reason),
            kernel_modules: Observed::unknown(reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedNetwork {
    pub hostname: Observed<Option<String>>,
    pub firewall_enabled: Observed<bool>,
    pub allowed_tcp_ports: Observed<Vec<u16>>,
    pub allowed_udp_ports: Observed<Vec<u16>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedUser {
    pub description: Option<String>,
    pub shell: Option<String>,
    /// Memberships among the groups in probe scope.
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedService {
    pub enabled: bool,
    /// Settings among the keys in probe scope.
    pub settings: BTreeMap<String, SettingValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedFile {
    /// Hex BLAKE3 digest of the current content.
    pub content_hash: String,
    pub mode: Option<String>,
}

/// Names the prober must look at: everything the desired state declares plus
/// everything a previously active generation managed (so removals are seen).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeScope {
    /// driver name -> package
    pub drivers: BTreeMap<String, String>,
    /// user -> groups
    pub users: BTreeMap<String, BTreeSet<String>>,
    /// service -> setting keys
    pub services: BTreeMap<String, BTreeSet<String>>,
    pub packages: BTreeSet<String>,
    pub files: BTreeSet<String>,
    pub environment: BTreeSet<String>,
}

impl ProbeScope {
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a DesiredState>) -> Self {
        let mut scope = ProbeScope::default();
        for state in states {
            scope.extend_with(state);
        }
        scope
    }

    /// Widen the scope with the targets of actions a run applied without
    /// committing a generation, so the next diff sees what they left behind.
    ///
    /// A driver's modules are only scoped when the same run installed its
    /// package; otherwise the driver cannot be named from its actions.
    pub fn extend_with_actions<'a>(&mut self, actions: impl IntoIterator<Item = &'a Action>) {
        let mut driver_package: Option<&str> = None;
        for action in actions {
            let target = action.target.as_str();
            match (action.subsystem, action.kind) {
                (Subsystem::Boot | Subsystem::Network, _) => {}
                (Subsystem::Drivers, ActionKind::Install | ActionKind::Remove) => {
                    self.packages.insert(target.to_string());
                    driver_package = Some(target);
                }
                (Subsystem::Drivers, _) => {
                    let name = target
                        .strip_prefix("drivers.")
                        .and_then(|rest| rest.strip_suffix(".kernel_modules"));
                    if let (Some(name), Some(package)) = (name, driver_package.take()) {
                        self.drivers
                            .entry(name.to_string())
                            .or_insert_with(|| package.to_string());
                    }
                }
                (_, ActionKind::Install | ActionKind::Remove) => {
                    self.packages.insert(target.to_string());
                }
                (Subsystem::Users, ActionKind::AddToGroup | ActionKind::RemoveFromGroup) => {
                    if let Some((user, group)) = target.split_once(':') {
                        self.users
                            .entry(user.to_string())
                            .or_default()
                            .insert(group.to_string());
                    }
                }
                (Subsystem::Users, _) => {
                    let user = target.split_once('.').map_or(target, |(user, _)| user);
                    self.users.entry(user.to_string()).or_default();
                }
                (Subsystem::Services, ActionKind::SetConfig) => {
                    if let Some((service, key)) = target.split_once('.') {
                        self.services
                            .entry(service.to_string())
                            .or_default()
                            .insert(key.to_string());
                    }
                }
                (Subsystem::Services, _) => {
                    self.services.entry(target.to_string()).or_default();
                }
                (Subsystem::Packages, _) => {
                    self.packages.insert(target.to_string());
                }
                (Subsystem::Files, _) => {
                    let path = target.strip_suffix(":mode").unwrap_or(target);
                    self.files.insert(path.to_string());
                }
                (Subsystem::Environment, _) => {
                    self.environment.insert(target.to_string());
                }
            }
        }
    }

    fn extend_with(&mut self, state: &DesiredState) {
        for (name, driver) in state.drivers.iter() {
            self.drivers
                .entry(name.to_string())
                .or_insert_with(|| driver.package.clone());
        }
        for (name, user) in state.users.iter() {
            self.users
                .entry(name.to_string())
                .or_default()
                .extend(user.groups.iter().cloned());
        }
        for (name, service) in state.services.iter() {
            self.services
                .entry(name.to_string())
                .or_default()
                .extend(service.settings.names().map(str::to_string));
        }
        self.packages.extend(state.packages.iter().cloned());
        self.files.extend(state.files.names().map(str::to_string));
        self.environment
            .extend(state.environment.names().map(str::to_string));
    }
}
