//! In-process model of a host: what the state-file and memory backends store.

use crate::action::{Action, ActionKind, SettingValue};
use crate::descriptor::hash::compute_content_hash;
use crate::observed::{
    Observed, ObservedDriver, ObservedFile, ObservedService, ObservedState, ObservedUser,
    ProbeScope,
};
use crate::subsystem::Subsystem;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostImage {
    pub boot: BootImage,
    /// driver name -> kernel modules loaded for it
    pub driver_modules: BTreeMap<String, Vec<String>>,
    pub network: NetworkImage,
    pub users: BTreeMap<String, UserImage>,
    pub services: BTreeMap<String, ServiceImage>,
    pub packages: BTreeSet<String>,
    pub files: BTreeMap<String, FileImage>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootImage {
    pub loader: Option<String>,
    pub kernel_params: Vec<String>,
    pub kernel_modules: Vec<String>,
    pub timeout_secs: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkImage {
    pub hostname: Option<String>,
    pub firewall_enabled: bool,
    pub allowed_tcp_ports: Vec<u16>,
    pub allowed_udp_ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserImage {
    pub description: Option<String>,
    pub shell: Option<String>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceImage {
    pub enabled: bool,
    pub settings: BTreeMap<String, SettingValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileImage {
    pub content: String,
    pub mode: Option<String>,
}

impl HostImage {
    /// Record what this image shows for the in-scope names of `subsystem`.
    pub fn observe(&self, subsystem: Subsystem, scope: &ProbeScope, observed: &mut ObservedState) {
        match subsystem {
            Subsystem::Boot => {
                observed.boot.loader = Observed::Known(self.boot.loader.clone());
                observed.boot.kernel_params = Observed::Known(self.boot.kernel_params.clone());
                observed.boot.kernel_modules = Observed::Known(self.boot.kernel_modules.clone());
                observed.boot.timeout_secs = Observed::Known(self.boot.timeout_secs);
            }
            Subsystem::Drivers => {
                for (name, package) in &scope.drivers {
                    observed.drivers.insert(
                        name.clone(),
                        ObservedDriver {
                            package: package.clone(),
                            installed: Observed::Known(self.packages.contains(package)),
                            kernel_modules: Observed::Known(
                                self.driver_modules.get(name).cloned().unwrap_or_default(),
                            ),
                        },
                    );
                }
            }
            Subsystem::Network => {
                observed.network.hostname = Observed::Known(self.network.hostname.clone());
                observed.network.firewall_enabled = Observed::Known(self.network.firewall_enabled);
                observed.network.allowed_tcp_ports =
                    Observed::Known(self.network.allowed_tcp_ports.clone());
                observed.network.allowed_udp_ports =
                    Observed::Known(self.network.allowed_udp_ports.clone());
            }
            Subsystem::Users => {
                for (name, groups) in &scope.users {
                    let user = self.users.get(name).map(|user| ObservedUser {
                        description: user.description.clone(),
                        shell: user.shell.clone(),
                        groups: user
                            .groups
                            .iter()
                            .filter(|g| groups.contains(*g))
                            .cloned()
                            .collect(),
                    });
                    observed.users.insert(name.clone(), Observed::Known(user));
                }
            }
            Subsystem::Services => {
                for (name, keys) in &scope.services {
                    let service = self.services.get(name);
                    observed.services.insert(
                        name.clone(),
                        Observed::Known(ObservedService {
                            enabled: service.map(|s| s.enabled).unwrap_or(false),
                            settings: service
                                .map(|s| {
                                    s.settings
                                        .iter()
                                        .filter(|(k, _)| keys.contains(*k))
                                        .map(|(k, v)| (k.clone(), v.clone()))
                                        .collect()
                                })
                                .unwrap_or_default(),
                        }),
                    );
                }
            }
            Subsystem::Packages => {
                for name in &scope.packages {
                    observed
                        .packages
                        .insert(name.clone(), Observed::Known(self.packages.contains(name)));
                }
            }
            Subsystem::Files => {
                for path in &scope.files {
                    let file = self.files.get(path).map(|file| ObservedFile {
                        content_hash: hex::encode(compute_content_hash(file.content.as_bytes())),
                        mode: file.mode.clone(),
                    });
                    observed.files.insert(path.clone(), Observed::Known(file));
                }
            }
            Subsystem::Environment => {
                for name in &scope.environment {
                    observed
                        .environment
                        .insert(name.clone(), Observed::Known(self.environment.get(name).cloned()));
                }
            }
        }
    }

    /// Apply one action to the image.
    pub fn apply(&mut self, action: &Action) -> Result<()> {
        let target = action.target.as_str();
        match action.kind {
            ActionKind::Install => {
                self.packages.insert(target.to_string());
            }
            ActionKind::Remove => {
                self.packages.remove(target);
            }
            ActionKind::EnableService => {
                self.services.entry(target.to_string()).or_default().enabled = true;
            }
            ActionKind::DisableService => {
                if let Some(service) = self.services.get_mut(target) {
                    service.enabled = false;
                }
            }
            ActionKind::SetConfig => self.set_config(action)?,
            ActionKind::WriteFile => {
                let content = required_text(action)?;
                self.files.entry(target.to_string()).or_default().content = content;
            }
            ActionKind::RemoveFile => {
                self.files.remove(target);
            }
            ActionKind::SetEnv => {
                let value = required_text(action)?;
                self.environment.insert(target.to_string(), value);
            }
            ActionKind::UnsetEnv => {
                self.environment.remove(target);
            }
            ActionKind::CreateUser => {
                self.users.entry(target.to_string()).or_default();
            }
            ActionKind::RemoveUser => {
                self.users.remove(target);
            }
            ActionKind::AddToGroup => {
                let (user, group) = membership(action)?;
                let user = self
                    .users
                    .get_mut(user)
                    .ok_or_else(|| anyhow!("user '{}' does not exist", user))?;
                if !user.groups.iter().any(|g| g == group) {
                    user.groups.push(group.to_string());
                }
            }
            ActionKind::RemoveFromGroup => {
                let (user, group) = membership(action)?;
                if let Some(user) = self.users.get_mut(user) {
                    user.groups.retain(|g| g != group);
                }
            }
        }
        Ok(())
    }

    fn set_config(&mut self, action: &Action) -> Result<()> {
        let target = action.target.as_str();
        match action.subsystem {
            Subsystem::Boot => match target {
                "boot.loader" => self.boot.loader = optional_text(action)?,
                "boot.kernel_params" => self.boot.kernel_params = list(action)?,
                "boot.kernel_modules" => self.boot.kernel_modules = list(action)?,
                "boot.timeout_secs" => {
                    self.boot.timeout_secs = match &action.after {
                        None => None,
                        Some(SettingValue::Integer(t)) => {
                            Some(u32::try_from(*t).context("boot timeout out of range")?)
                        }
                        Some(other) => bail!("expected an integer timeout, got {}", other),
                    }
                }
                other => bail!("unknown boot setting '{}'", other),
            },
            Subsystem::Drivers => {
                let name = target
                    .strip_prefix("drivers.")
                    .and_then(|t| t.strip_suffix(".kernel_modules"))
                    .ok_or_else(|| anyhow!("malformed driver target '{}'", target))?;
                let modules = list(action)?;
                if modules.is_empty() {
                    self.driver_modules.remove(name);
                } else {
                    self.driver_modules.insert(name.to_string(), modules);
                }
            }
            Subsystem::Network => match target {
                "network.hostname" => self.network.hostname = optional_text(action)?,
                "network.firewall.enable" => {
                    self.network.firewall_enabled = match &action.after {
                        Some(SettingValue::Bool(b)) => *b,
                        other => bail!("expected a boolean, got {:?}", other),
                    }
                }
                "network.firewall.allowed_tcp_ports" => {
                    self.network.allowed_tcp_ports = ports(action)?
                }
                "network.firewall.allowed_udp_ports" => {
                    self.network.allowed_udp_ports = ports(action)?
                }
                other => bail!("unknown network setting '{}'", other),
            },
            Subsystem::Users => {
                let (name, field) = target
                    .rsplit_once('.')
                    .ok_or_else(|| anyhow!("malformed user target '{}'", target))?;
                let value = optional_text(action)?;
                let user = self
                    .users
                    .get_mut(name)
                    .ok_or_else(|| anyhow!("user '{}' does not exist", name))?;
                match field {
                    "description" => user.description = value,
                    "shell" => user.shell = value,
                    other => bail!("unknown user field '{}'", other),
                }
            }
            Subsystem::Services => {
                let (name, key) = target
                    .split_once('.')
                    .ok_or_else(|| anyhow!("malformed service setting '{}'", target))?;
                let service = self.services.entry(name.to_string()).or_default();
                match &action.after {
                    Some(value) => {
                        service.settings.insert(key.to_string(), value.clone());
                    }
                    None => {
                        service.settings.remove(key);
                    }
                }
            }
            Subsystem::Files => {
                let path = target
                    .strip_suffix(":mode")
                    .ok_or_else(|| anyhow!("malformed file mode target '{}'", target))?;
                let file = self
                    .files
                    .get_mut(path)
                    .ok_or_else(|| anyhow!("file '{}' does not exist", path))?;
                file.mode = optional_text(action)?;
            }
            Subsystem::Packages | Subsystem::Environment => {
                bail!("{} has no settings", action.subsystem)
            }
        }
        Ok(())
    }
}

fn membership(action: &Action) -> Result<(&str, &str)> {
    action
        .membership()
        .ok_or_else(|| anyhow!("malformed membership target '{}'", action.target))
}

fn required_text(action: &Action) -> Result<String> {
    optional_text(action)?.ok_or_else(|| anyhow!("{} requires a value", action.kind))
}

fn optional_text(action: &Action) -> Result<Option<String>> {
    match &action.after {
        None => Ok(None),
        Some(SettingValue::Text(text)) => Ok(Some(text.clone())),
        Some(other) => bail!("expected text, got {}", other),
    }
}

fn list(action: &Action) -> Result<Vec<String>> {
    match &action.after {
        None => Ok(Vec::new()),
        Some(SettingValue::List(items)) => Ok(items.clone()),
        Some(other) => bail!("expected a list, got {}", other),
    }
}

fn ports(action: &Action) -> Result<Vec<u16>> {
    list(action)?
        .iter()
        .map(|p| {
            p.parse::<u16>()
                .with_context(|| format!("invalid port '{}'", p))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_requires_user() {
        let mut image = HostImage::default();
        let action = Action::new(ActionKind::AddToGroup, Subsystem::Users, "alice:wheel");
        assert!(image.apply(&action).is_err());

        image
            .apply(&Action::new(ActionKind::CreateUser, Subsystem::Users, "alice"))
            .unwrap();
        image.apply(&action).unwrap();
        image.apply(&action).unwrap();
        assert_eq!(image.users["alice"].groups, vec!["wheel".to_string()]);
    }

    #[test]
    fn test_service_setting_round_trip_through_observe() {
        let mut image = HostImage::default();
        image
            .apply(
                &Action::new(ActionKind::SetConfig, Subsystem::Services, "ollama.host")
                    .with_after(Some("0.0.0.0".into())),
            )
            .unwrap();

        let mut scope = ProbeScope::default();
        scope
            .services
            .insert("ollama".to_string(), ["host".to_string()].into_iter().collect());
        let mut observed = ObservedState::default();
        image.observe(Subsystem::Services, &scope, &mut observed);

        let service = observed.services["ollama"].known().unwrap();
        assert!(!service.enabled);
        assert_eq!(service.settings["host"], SettingValue::from("0.0.0.0"));
    }

    #[test]
    fn test_port_list_must_be_numeric() {
        let mut image = HostImage::default();
        let action = Action::new(
            ActionKind::SetConfig,
            Subsystem::Network,
            "network.firewall.allowed_tcp_ports",
        )
        .with_after(Some(SettingValue::List(vec!["ssh".to_string()])));
        assert!(image.apply(&action).is_err());
    }
}
