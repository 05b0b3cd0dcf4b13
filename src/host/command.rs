//! Host driven by shell command templates.
//!
//! Templates come from configuration and use `{name}`, `{key}`, `{value}`,
//! `{user}` and `{group}` placeholders; every substitution is shell-quoted.
//! Query templates report through their exit status (0 = yes, 1 = no) or
//! their stdout. A probe whose query template is missing fails, which leaves
//! its fields `Unknown`; an action whose template is missing fails with an
//! `ActionError`.
//!
//! Managed files are written directly and the environment is rendered to a
//! single env file, so neither needs a template.

use crate::action::{Action, ActionKind, SettingValue};
use crate::descriptor::hash::compute_content_hash;
use crate::error::{ActionError, ProbeError};
use crate::executor::ActionApplier;
use crate::host::HostBackend;
use crate::observed::{
    HostFacts, Observed, ObservedDriver, ObservedFile, ObservedService, ObservedState,
    ObservedUser, ProbeScope,
};
use crate::subsystem::Subsystem;
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Shell command templates, keyed by operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    /// `{name}`; exit 0 when installed.
    pub package_query: Option<String>,
    pub package_install: Option<String>,
    pub package_remove: Option<String>,
    /// `{name}`; exit 0 when enabled.
    pub service_query: Option<String>,
    pub service_enable: Option<String>,
    pub service_disable: Option<String>,
    /// `{name}` `{key}`; prints the value, nothing when unset.
    pub service_get: Option<String>,
    pub service_set: Option<String>,
    pub service_unset: Option<String>,
    /// `{name}`; exit 1 when absent, otherwise prints `key=value` lines
    /// (`description`, `shell`, `groups` comma separated).
    pub user_query: Option<String>,
    pub user_create: Option<String>,
    pub user_remove: Option<String>,
    pub user_set: Option<String>,
    pub group_add: Option<String>,
    pub group_remove: Option<String>,
    /// `{key}`; prints the boot setting.
    pub boot_get: Option<String>,
    pub boot_set: Option<String>,
    /// `{name}`; prints the modules loaded for a driver.
    pub driver_modules_get: Option<String>,
    pub driver_modules_set: Option<String>,
    /// `{key}`; prints the network setting.
    pub network_get: Option<String>,
    pub network_set: Option<String>,
}

/// Quote a value for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Reverse of [`shell_quote`] for the env file.
fn shell_unquote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut command = template.to_string();
    for (name, value) in vars {
        command = command.replace(&format!("{{{}}}", name), &shell_quote(value));
    }
    command
}

/// Parse a printed setting: JSON scalars and arrays keep their type,
/// anything else is text.
fn parse_setting(output: &str) -> SettingValue {
    serde_json::from_str::<SettingValue>(output)
        .unwrap_or_else(|_| SettingValue::Text(output.to_string()))
}

fn words(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}

pub struct CommandHost {
    templates: CommandTemplates,
    env_file: PathBuf,
    hardware_arches: Vec<String>,
    env_lock: Mutex<()>,
}

impl CommandHost {
    pub fn new(templates: CommandTemplates, env_file: impl Into<PathBuf>) -> Self {
        Self {
            templates,
            env_file: env_file.into(),
            hardware_arches: Vec::new(),
            env_lock: Mutex::new(()),
        }
    }

    /// Restrict boot and driver probing to these architectures. Empty means any.
    pub fn with_hardware_arches(mut self, arches: Vec<String>) -> Self {
        self.hardware_arches = arches;
        self
    }

    fn template<'a>(&self, template: &'a Option<String>, operation: &str) -> Result<&'a str> {
        template
            .as_deref()
            .ok_or_else(|| anyhow!("no '{}' command configured", operation))
    }

    fn run(&self, command: &str) -> Result<std::process::Output> {
        debug!(command, "Running host command");
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .with_context(|| format!("Failed to spawn `{}`", command))
    }

    /// Run a command that must succeed; returns trimmed stdout.
    fn run_checked(&self, command: &str) -> Result<String> {
        let output = self.run(command)?;
        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a yes/no query: exit 0 is yes, exit 1 is no, anything else fails.
    fn run_query(&self, command: &str) -> Result<bool> {
        let output = self.run(command)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    fn get(
        &self,
        template: &Option<String>,
        operation: &str,
        vars: &[(&str, &str)],
    ) -> Result<String> {
        let template = self.template(template, operation)?;
        self.run_checked(&render(template, vars))
    }

    fn exec(
        &self,
        template: &Option<String>,
        operation: &str,
        vars: &[(&str, &str)],
    ) -> Result<()> {
        let template = self.template(template, operation)?;
        self.run_checked(&render(template, vars)).map(|_| ())
    }

    fn read_env_file(&self) -> Result<BTreeMap<String, String>> {
        let text = match std::fs::read_to_string(&self.env_file) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.env_file.display()))
            }
        };
        Ok(text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(name, value)| (name.trim().to_string(), shell_unquote(value.trim())))
            .collect())
    }

    fn write_env_file(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        let mut text = String::from("# Managed by hostform\n");
        for (name, value) in vars {
            text.push_str(&format!("{}={}\n", name, shell_quote(value)));
        }
        write_atomic(&self.env_file, text.as_bytes())
    }

    fn probe_inner(
        &self,
        subsystem: Subsystem,
        scope: &ProbeScope,
        observed: &mut ObservedState,
    ) -> Result<()> {
        let t = &self.templates;
        match subsystem {
            Subsystem::Boot => {
                let get = |key: &str| self.get(&t.boot_get, "boot_get", &[("key", key)]);
                let loader = get("loader")?;
                let params = get("kernel_params")?;
                let modules = get("kernel_modules")?;
                let timeout = get("timeout_secs")?;
                observed.boot.loader = Observed::Known(Some(loader).filter(|l| !l.is_empty()));
                observed.boot.kernel_params = Observed::Known(words(&params));
                observed.boot.kernel_modules = Observed::Known(words(&modules));
                let timeout = if timeout.is_empty() {
                    None
                } else {
                    Some(
                        timeout
                            .parse::<u32>()
                            .with_context(|| format!("invalid boot timeout '{}'", timeout))?,
                    )
                };
                observed.boot.timeout_secs = Observed::Known(timeout);
            }
            Subsystem::Drivers => {
                let query = self.template(&t.package_query, "package_query")?;
                for (name, package) in &scope.drivers {
                    let installed = self.run_query(&render(query, &[("name", package)]))?;
                    let modules = self.get(
                        &t.driver_modules_get,
                        "driver_modules_get",
                        &[("name", name)],
                    )?;
                    observed.drivers.insert(
                        name.clone(),
                        ObservedDriver {
                            package: package.clone(),
                            installed: Observed::Known(installed),
                            kernel_modules: Observed::Known(words(&modules)),
                        },
                    );
                }
            }
            Subsystem::Network => {
                let get = |key: &str| self.get(&t.network_get, "network_get", &[("key", key)]);
                let hostname = get("hostname")?;
                let enabled = get("firewall.enable")?;
                let tcp = get("firewall.allowed_tcp_ports")?;
                let udp = get("firewall.allowed_udp_ports")?;
                observed.network.hostname =
                    Observed::Known(Some(hostname).filter(|h| !h.is_empty()));
                observed.network.firewall_enabled =
                    Observed::Known(matches!(enabled.as_str(), "true" | "yes" | "1" | "on"));
                observed.network.allowed_tcp_ports = Observed::Known(parse_ports(&tcp)?);
                observed.network.allowed_udp_ports = Observed::Known(parse_ports(&udp)?);
            }
            Subsystem::Users => {
                let query = self.template(&t.user_query, "user_query")?;
                for (name, groups) in &scope.users {
                    let output = self.run(&render(query, &[("name", name)]))?;
                    let user = match output.status.code() {
                        Some(1) => None,
                        Some(0) => {
                            let stdout = String::from_utf8_lossy(&output.stdout);
                            let mut user = ObservedUser::default();
                            for (key, value) in stdout.lines().filter_map(|l| l.split_once('=')) {
                                let value = value.trim();
                                match key.trim() {
                                    "description" if !value.is_empty() => {
                                        user.description = Some(value.to_string())
                                    }
                                    "shell" if !value.is_empty() => {
                                        user.shell = Some(value.to_string())
                                    }
                                    "groups" => {
                                        user.groups = value
                                            .split(',')
                                            .map(str::trim)
                                            .filter(|g| groups.contains(*g))
                                            .map(str::to_string)
                                            .collect()
                                    }
                                    _ => {}
                                }
                            }
                            Some(user)
                        }
                        _ => bail!("user query for '{}' exited with {}", name, output.status),
                    };
                    observed.users.insert(name.clone(), Observed::Known(user));
                }
            }
            Subsystem::Services => {
                let query = self.template(&t.service_query, "service_query")?;
                for (name, keys) in &scope.services {
                    let enabled = self.run_query(&render(query, &[("name", name)]))?;
                    let mut settings = BTreeMap::new();
                    for key in keys {
                        let value = self.get(
                            &t.service_get,
                            "service_get",
                            &[("name", name), ("key", key)],
                        )?;
                        if !value.is_empty() {
                            settings.insert(key.clone(), parse_setting(&value));
                        }
                    }
                    observed.services.insert(
                        name.clone(),
                        Observed::Known(ObservedService { enabled, settings }),
                    );
                }
            }
            Subsystem::Packages => {
                let query = self.template(&t.package_query, "package_query")?;
                for name in &scope.packages {
                    let installed = self.run_query(&render(query, &[("name", name)]))?;
                    observed.packages.insert(name.clone(), Observed::Known(installed));
                }
            }
            Subsystem::Files => {
                for path in &scope.files {
                    let seen = observe_file(Path::new(path))?;
                    observed.files.insert(path.clone(), Observed::Known(seen));
                }
            }
            Subsystem::Environment => {
                let vars = self.read_env_file()?;
                for name in &scope.environment {
                    observed
                        .environment
                        .insert(name.clone(), Observed::Known(vars.get(name).cloned()));
                }
            }
        }
        Ok(())
    }

    fn apply_inner(&self, action: &Action) -> Result<()> {
        let t = &self.templates;
        let target = action.target.as_str();
        let value = action
            .after
            .as_ref()
            .map(SettingValue::render)
            .unwrap_or_default();
        let named = &[("name", target)];
        match action.kind {
            ActionKind::Install => self.exec(&t.package_install, "package_install", named),
            ActionKind::Remove => self.exec(&t.package_remove, "package_remove", named),
            ActionKind::EnableService => self.exec(&t.service_enable, "service_enable", named),
            ActionKind::DisableService => self.exec(&t.service_disable, "service_disable", named),
            ActionKind::CreateUser => self.exec(&t.user_create, "user_create", named),
            ActionKind::RemoveUser => self.exec(&t.user_remove, "user_remove", named),
            ActionKind::AddToGroup | ActionKind::RemoveFromGroup => {
                let (user, group) = action
                    .membership()
                    .ok_or_else(|| anyhow!("malformed membership target '{}'", target))?;
                if action.kind == ActionKind::AddToGroup {
                    self.exec(&t.group_add, "group_add", &[("user", user), ("group", group)])
                } else {
                    self.exec(&t.group_remove, "group_remove", &[("user", user), ("group", group)])
                }
            }
            ActionKind::SetConfig => match action.subsystem {
                Subsystem::Boot => {
                    let key = target.strip_prefix("boot.").unwrap_or(target);
                    self.exec(&t.boot_set, "boot_set", &[("key", key), ("value", &value)])
                }
                Subsystem::Drivers => {
                    let name = target
                        .strip_prefix("drivers.")
                        .and_then(|t| t.strip_suffix(".kernel_modules"))
                        .ok_or_else(|| anyhow!("malformed driver target '{}'", target))?;
                    self.exec(
                        &t.driver_modules_set,
                        "driver_modules_set",
                        &[("name", name), ("value", &value)],
                    )
                }
                Subsystem::Network => {
                    let key = target.strip_prefix("network.").unwrap_or(target);
                    self.exec(&t.network_set, "network_set", &[("key", key), ("value", &value)])
                }
                Subsystem::Users => {
                    let (name, key) = target
                        .rsplit_once('.')
                        .ok_or_else(|| anyhow!("malformed user target '{}'", target))?;
                    self.exec(
                        &t.user_set,
                        "user_set",
                        &[("name", name), ("key", key), ("value", &value)],
                    )
                }
                Subsystem::Services => {
                    let (name, key) = target
                        .split_once('.')
                        .ok_or_else(|| anyhow!("malformed service setting '{}'", target))?;
                    match &action.after {
                        Some(_) => self.exec(
                            &t.service_set,
                            "service_set",
                            &[("name", name), ("key", key), ("value", &value)],
                        ),
                        None => self.exec(
                            &t.service_unset,
                            "service_unset",
                            &[("name", name), ("key", key)],
                        ),
                    }
                }
                Subsystem::Files => {
                    let path = target
                        .strip_suffix(":mode")
                        .ok_or_else(|| anyhow!("malformed file mode target '{}'", target))?;
                    let mode = action.after.as_ref().and_then(SettingValue::as_text);
                    set_mode(Path::new(path), mode)
                }
                Subsystem::Packages | Subsystem::Environment => {
                    bail!("{} has no settings", action.subsystem)
                }
            },
            ActionKind::WriteFile => {
                let content = action
                    .after
                    .as_ref()
                    .and_then(SettingValue::as_text)
                    .ok_or_else(|| anyhow!("write-file requires content"))?;
                write_atomic(Path::new(target), content.as_bytes())
            }
            ActionKind::RemoveFile => match std::fs::remove_file(target) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(e).with_context(|| format!("Failed to remove {}", target))
                }
                _ => Ok(()),
            },
            ActionKind::SetEnv | ActionKind::UnsetEnv => {
                let _guard = self.env_lock.lock();
                let mut vars = self.read_env_file()?;
                if action.kind == ActionKind::SetEnv {
                    vars.insert(target.to_string(), value);
                } else {
                    vars.remove(target);
                }
                self.write_env_file(&vars)
            }
        }
    }
}

fn parse_ports(output: &str) -> Result<Vec<u16>> {
    output
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u16>().with_context(|| format!("invalid port '{}'", p)))
        .collect()
}

fn observe_file(path: &Path) -> Result<Option<ObservedFile>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    Ok(Some(ObservedFile {
        content_hash: hex::encode(compute_content_hash(&bytes)),
        mode: file_mode(path)?,
    }))
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<Option<String>> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path)?;
    Ok(Some(format!("{:04o}", metadata.permissions().mode() & 0o7777)))
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<Option<String>> {
    Ok(None)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<&str>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let Some(mode) = mode else { return Ok(()) };
    let bits =
        u32::from_str_radix(mode, 8).with_context(|| format!("invalid mode '{}'", mode))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(bits))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<&str>) -> Result<()> {
    bail!("file modes are not supported on this platform")
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let temp = dir.join(format!(".{}.hostform-tmp", name));
    std::fs::write(&temp, bytes)
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    if let Ok(existing) = std::fs::metadata(path) {
        // Keep the permissions of the file being replaced.
        std::fs::set_permissions(&temp, existing.permissions())?;
    }
    std::fs::rename(&temp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))
}

impl ActionApplier for CommandHost {
    fn apply(&self, action: &Action) -> Result<(), ActionError> {
        self.apply_inner(action).map_err(|e| ActionError {
            kind: action.kind,
            target: action.target.clone(),
            cause: format!("{:#}", e),
        })
    }
}

impl HostBackend for CommandHost {
    fn name(&self) -> &str {
        "command"
    }

    fn supports(&self, subsystem: Subsystem, facts: &HostFacts) -> bool {
        !subsystem.is_hardware_specific()
            || self.hardware_arches.is_empty()
            || self.hardware_arches.iter().any(|a| *a == facts.arch)
    }

    fn probe_subsystem(
        &self,
        subsystem: Subsystem,
        scope: &ProbeScope,
        observed: &mut ObservedState,
    ) -> Result<(), ProbeError> {
        self.probe_inner(subsystem, scope, observed).map_err(|e| ProbeError {
            subsystem,
            cause: format!("{:#}", e),
        })
    }
}
