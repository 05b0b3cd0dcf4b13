//! Static validation of a parsed desired state.
//!
//! All problems are collected so an operator can fix a descriptor in one pass.

use crate::action::SettingValue;
use crate::descriptor::DesiredState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path};

/// One thing wrong with a descriptor, located by its dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationProblem {
    pub path: String,
    pub message: String,
}

impl ValidationProblem {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a desired state, returning every problem found.
pub fn validate(state: &DesiredState) -> Result<(), Vec<ValidationProblem>> {
    let mut problems = Vec::new();

    validate_host(state, &mut problems);
    validate_boot(state, &mut problems);
    validate_drivers(state, &mut problems);
    validate_network(state, &mut problems);
    validate_users(state, &mut problems);
    validate_services(state, &mut problems);
    validate_packages(state, &mut problems);
    validate_files(state, &mut problems);
    validate_environment(state, &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+'))
}

fn validate_host(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    if matches!(state.host.hostname.as_deref(), Some(h) if h.trim().is_empty()) {
        problems.push(ValidationProblem::new("host.hostname", "must not be empty"));
    }
    if matches!(state.host.arch.as_deref(), Some(a) if a.trim().is_empty()) {
        problems.push(ValidationProblem::new("host.arch", "must not be empty"));
    }
}

fn validate_boot(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    if matches!(state.boot.loader.as_deref(), Some(l) if !is_identifier(l)) {
        problems.push(ValidationProblem::new(
            "boot.loader",
            "must be a non-empty identifier",
        ));
    }
    if let Some(params) = &state.boot.kernel_params {
        for (index, param) in params.iter().enumerate() {
            if param.is_empty() || param.chars().any(char::is_whitespace) {
                problems.push(ValidationProblem::new(
                    format!("boot.kernel_params[{}]", index),
                    format!("invalid kernel parameter {:?}", param),
                ));
            }
        }
    }
    if let Some(modules) = &state.boot.kernel_modules {
        check_names("boot.kernel_modules", modules, problems);
    }
}

fn validate_drivers(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    for (name, driver) in state.drivers.iter() {
        if !is_identifier(name) {
            problems.push(ValidationProblem::new(
                format!("drivers.{}", name),
                "invalid driver name",
            ));
        }
        if !is_identifier(&driver.package) {
            problems.push(ValidationProblem::new(
                format!("drivers.{}.package", name),
                "must be a non-empty package name",
            ));
        }
        check_names(
            &format!("drivers.{}.kernel_modules", name),
            &driver.kernel_modules,
            problems,
        );
    }
}

fn validate_network(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    if let Some(hostname) = &state.network.hostname {
        let valid = !hostname.is_empty()
            && hostname.len() <= 253
            && hostname.split('.').all(|label| {
                !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
        if !valid {
            problems.push(ValidationProblem::new(
                "network.hostname",
                format!("invalid hostname {:?}", hostname),
            ));
        }
    }
    if let Some(firewall) = &state.network.firewall {
        check_ports(
            "network.firewall.allowed_tcp_ports",
            &firewall.allowed_tcp_ports,
            problems,
        );
        check_ports(
            "network.firewall.allowed_udp_ports",
            &firewall.allowed_udp_ports,
            problems,
        );
    }
}

fn check_ports(path: &str, ports: &[u16], problems: &mut Vec<ValidationProblem>) {
    let mut seen = BTreeSet::new();
    for port in ports {
        if *port == 0 {
            problems.push(ValidationProblem::new(path, "port 0 is not a valid binding"));
        } else if !seen.insert(*port) {
            problems.push(ValidationProblem::new(
                path,
                format!("conflicting binding: port {} declared more than once", port),
            ));
        }
    }
}

fn check_names(path: &str, names: &[String], problems: &mut Vec<ValidationProblem>) {
    let mut seen = BTreeSet::new();
    for name in names {
        if !is_identifier(name) {
            problems.push(ValidationProblem::new(
                path,
                format!("invalid name {:?}", name),
            ));
        } else if !seen.insert(name.as_str()) {
            problems.push(ValidationProblem::new(
                path,
                format!("'{}' listed more than once", name),
            ));
        }
    }
}

fn validate_users(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    for (name, user) in state.users.iter() {
        if !is_identifier(name) || name.contains([':', '.']) {
            problems.push(ValidationProblem::new(
                format!("users.{}", name),
                "invalid user name",
            ));
        }
        if matches!(user.shell.as_deref(), Some(shell) if !shell.starts_with('/')) {
            problems.push(ValidationProblem::new(
                format!("users.{}.shell", name),
                "shell must be an absolute path",
            ));
        }
        check_names(&format!("users.{}.groups", name), &user.groups, problems);
    }
}

fn validate_services(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    let declared_packages: BTreeSet<&str> = state.packages.iter().map(String::as_str).collect();
    let mut port_owners: BTreeMap<i64, &str> = BTreeMap::new();

    for (index, (name, service)) in state.services.iter().enumerate() {
        if !is_identifier(name) || name.contains('.') {
            problems.push(ValidationProblem::new(
                format!("services.{}", name),
                "invalid service name",
            ));
        }

        if let Some(package) = &service.package {
            if !declared_packages.contains(package.as_str()) {
                problems.push(ValidationProblem::new(
                    format!("services.{}.package", name),
                    format!("references undefined package '{}'", package),
                ));
            }
        }

        for dependency in &service.after {
            match state.services.position(dependency) {
                None => problems.push(ValidationProblem::new(
                    format!("services.{}.after", name),
                    format!("references unknown service '{}'", dependency),
                )),
                Some(position) if position >= index => problems.push(ValidationProblem::new(
                    format!("services.{}.after", name),
                    format!("service '{}' must be declared before '{}'", dependency, name),
                )),
                Some(_) => {}
            }
        }

        for (key, value) in service.settings.iter() {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                problems.push(ValidationProblem::new(
                    format!("services.{}.settings", name),
                    format!("invalid setting key {:?}", key),
                ));
            }
            if key == "port" {
                match value {
                    SettingValue::Integer(port) if (1..=65535).contains(port) => {
                        if let Some(owner) = port_owners.insert(*port, name) {
                            problems.push(ValidationProblem::new(
                                format!("services.{}.settings.port", name),
                                format!(
                                    "conflicting binding: port {} is also bound by service '{}'",
                                    port, owner
                                ),
                            ));
                        }
                    }
                    _ => problems.push(ValidationProblem::new(
                        format!("services.{}.settings.port", name),
                        format!("port must be an integer in 1..=65535, got {}", value),
                    )),
                }
            }
        }
    }
}

fn validate_packages(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    check_names("packages", &state.packages, problems);
    for (name, driver) in state.drivers.iter() {
        if state.packages.contains(&driver.package) {
            problems.push(ValidationProblem::new(
                format!("drivers.{}.package", name),
                format!(
                    "'{}' is managed by the driver and must not also be listed in packages",
                    driver.package
                ),
            ));
        }
    }
}

fn validate_files(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    for (path, file) in state.files.iter() {
        let as_path = Path::new(path);
        if !as_path.is_absolute() {
            problems.push(ValidationProblem::new(
                format!("files.{}", path),
                "path must be absolute",
            ));
        }
        if as_path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            problems.push(ValidationProblem::new(
                format!("files.{}", path),
                "path must not contain '..'",
            ));
        }
        if let Some(mode) = &file.mode {
            let valid = (3..=4).contains(&mode.len()) && u32::from_str_radix(mode, 8).is_ok();
            if !valid {
                problems.push(ValidationProblem::new(
                    format!("files.{}.mode", path),
                    format!("invalid octal mode {:?}", mode),
                ));
            }
        }
    }
}

fn validate_environment(state: &DesiredState, problems: &mut Vec<ValidationProblem>) {
    for (name, value) in state.environment.iter() {
        let valid = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            problems.push(ValidationProblem::new(
                format!("environment.{}", name),
                "invalid environment variable name",
            ));
        }
        // Env files hold one variable per line.
        if value.chars().any(char::is_control) {
            problems.push(ValidationProblem::new(
                format!("environment.{}", name),
                "value must not contain control characters such as newlines",
            ));
        }
    }
}
