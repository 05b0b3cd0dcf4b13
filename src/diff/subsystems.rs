//! Per-subsystem structural comparison.
//!
//! Every `Unknown` observation yields an action touching that field.

use super::{Declared, Planned};
use crate::action::{Action, ActionKind, SettingValue};
use crate::descriptor::hash::compute_content_hash;
use crate::descriptor::DesiredState;
use crate::observed::{Observed, ObservedDriver, ObservedState, ObservedUser};
use crate::subsystem::Subsystem;
use std::collections::BTreeSet;

const PHASE_CREATE: u8 = 0;
const PHASE_CONFIGURE: u8 = 1;
const PHASE_MEMBERSHIP: u8 = 2;

fn list_value<T: ToString>(items: &[T]) -> SettingValue {
    SettingValue::List(items.iter().map(ToString::to_string).collect())
}

fn same_set<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    let a: BTreeSet<T> = a.iter().cloned().collect();
    let b: BTreeSet<T> = b.iter().cloned().collect();
    a == b
}

fn text(value: &Option<String>) -> Option<SettingValue> {
    value.clone().map(SettingValue::Text)
}

/// Emit a `set-config` when the desired scalar differs from what was seen.
#[allow(clippy::too_many_arguments)]
fn set_config_if_changed<T, F>(
    out: &mut Vec<Planned>,
    subsystem: Subsystem,
    index: usize,
    target: &str,
    desired: &T,
    observed: &Observed<T>,
    equal: impl Fn(&T, &T) -> bool,
    to_value: F,
) where
    F: Fn(&T) -> Option<SettingValue>,
{
    let before = match observed {
        Observed::Known(current) if equal(current, desired) => return,
        Observed::Known(current) => to_value(current),
        Observed::Unknown { .. } => None,
    };
    out.push(Planned::new(
        Declared::At(index),
        PHASE_CONFIGURE,
        0,
        Action::new(ActionKind::SetConfig, subsystem, target)
            .with_before(before)
            .with_after(to_value(desired)),
    ));
}

pub(super) fn diff_boot(desired: &DesiredState, observed: &ObservedState, out: &mut Vec<Planned>) {
    let boot = &desired.boot;
    let seen = &observed.boot;

    if let Some(loader) = &boot.loader {
        set_config_if_changed(
            out,
            Subsystem::Boot,
            0,
            "boot.loader",
            &Some(loader.clone()),
            &seen.loader,
            |a, b| a == b,
            text,
        );
    }
    if let Some(params) = &boot.kernel_params {
        set_config_if_changed(
            out,
            Subsystem::Boot,
            1,
            "boot.kernel_params",
            params,
            &seen.kernel_params,
            |a, b| a == b,
            |v| Some(list_value(v)),
        );
    }
    if let Some(modules) = &boot.kernel_modules {
        set_config_if_changed(
            out,
            Subsystem::Boot,
            2,
            "boot.kernel_modules",
            modules,
            &seen.kernel_modules,
            |a, b| same_set(a, b),
            |v| Some(list_value(v)),
        );
    }
    if let Some(timeout) = boot.timeout_secs {
        set_config_if_changed(
            out,
            Subsystem::Boot,
            3,
            "boot.timeout_secs",
            &Some(timeout),
            &seen.timeout_secs,
            |a, b| a == b,
            |v| v.map(|t| SettingValue::Integer(i64::from(t))),
        );
    }
}

pub(super) fn diff_drivers(
    desired: &DesiredState,
    observed: &ObservedState,
    out: &mut Vec<Planned>,
) {
    for (index, (name, driver)) in desired.drivers.iter().enumerate() {
        let seen = observed
            .drivers
            .get(name)
            .cloned()
            .unwrap_or_else(|| ObservedDriver::unknown(driver.package.clone(), "not probed"));

        if !matches!(seen.installed, Observed::Known(true)) {
            out.push(Planned::new(
                Declared::At(index),
                PHASE_CREATE,
                0,
                Action::new(ActionKind::Install, Subsystem::Drivers, driver.package.clone()),
            ));
        }

        let modules_target = format!("drivers.{}.kernel_modules", name);
        match &seen.kernel_modules {
            Observed::Known(current) if same_set(current, &driver.kernel_modules) => {}
            Observed::Known(current) => out.push(Planned::new(
                Declared::At(index),
                PHASE_CONFIGURE,
                0,
                Action::new(ActionKind::SetConfig, Subsystem::Drivers, modules_target)
                    .with_before(Some(list_value(current)))
                    .with_after(Some(list_value(&driver.kernel_modules))),
            )),
            Observed::Unknown { .. } => out.push(Planned::new(
                Declared::At(index),
                PHASE_CONFIGURE,
                0,
                Action::new(ActionKind::SetConfig, Subsystem::Drivers, modules_target)
                    .with_after(Some(list_value(&driver.kernel_modules))),
            )),
        }
    }

    let required = desired.required_packages();
    for (name, seen) in &observed.drivers {
        if desired.drivers.contains(name) {
            continue;
        }
        let modules_loaded = match &seen.kernel_modules {
            Observed::Known(current) => !current.is_empty(),
            Observed::Unknown { .. } => true,
        };
        if modules_loaded {
            out.push(Planned::new(
                Declared::Undeclared,
                PHASE_CREATE,
                0,
                Action::new(
                    ActionKind::SetConfig,
                    Subsystem::Drivers,
                    format!("drivers.{}.kernel_modules", name),
                )
                .with_before(seen.kernel_modules.known().map(|m| list_value(m)))
                .with_after(Some(SettingValue::List(Vec::new()))),
            ));
        }
        // The package may have moved to `packages` or to a renamed driver.
        if required.contains(seen.package.as_str()) {
            continue;
        }
        if !matches!(seen.installed, Observed::Known(false)) {
            out.push(Planned::new(
                Declared::Undeclared,
                PHASE_CONFIGURE,
                0,
                Action::new(ActionKind::Remove, Subsystem::Drivers, seen.package.clone()),
            ));
        }
    }
}

pub(super) fn diff_network(
    desired: &DesiredState,
    observed: &ObservedState,
    out: &mut Vec<Planned>,
) {
    let seen = &observed.network;

    if let Some(hostname) = &desired.network.hostname {
        set_config_if_changed(
            out,
            Subsystem::Network,
            0,
            "network.hostname",
            &Some(hostname.clone()),
            &seen.hostname,
            |a, b| a == b,
            text,
        );
    }

    if let Some(firewall) = &desired.network.firewall {
        set_config_if_changed(
            out,
            Subsystem::Network,
            1,
            "network.firewall.enable",
            &firewall.enable,
            &seen.firewall_enabled,
            |a, b| a == b,
            |v| Some(SettingValue::Bool(*v)),
        );
        set_config_if_changed(
            out,
            Subsystem::Network,
            2,
            "network.firewall.allowed_tcp_ports",
            &firewall.allowed_tcp_ports,
            &seen.allowed_tcp_ports,
            |a, b| same_set(a, b),
            |v| Some(list_value(v)),
        );
        set_config_if_changed(
            out,
            Subsystem::Network,
            3,
            "network.firewall.allowed_udp_ports",
            &firewall.allowed_udp_ports,
            &seen.allowed_udp_ports,
            |a, b| same_set(a, b),
            |v| Some(list_value(v)),
        );
    }
}

pub(super) fn diff_users(desired: &DesiredState, observed: &ObservedState, out: &mut Vec<Planned>) {
    for (index, (name, user)) in desired.users.iter().enumerate() {
        let declared = Declared::At(index);
        let existing: Option<&ObservedUser> = match observed.users.get(name) {
            Some(Observed::Known(Some(existing))) => Some(existing),
            _ => None,
        };

        if existing.is_none() {
            out.push(Planned::new(
                declared,
                PHASE_CREATE,
                0,
                Action::new(ActionKind::CreateUser, Subsystem::Users, name),
            ));
        }

        let fields = [
            ("description", &user.description, existing.map(|u| &u.description)),
            ("shell", &user.shell, existing.map(|u| &u.shell)),
        ];
        for (minor, (field, wanted, current)) in fields.into_iter().enumerate() {
            let Some(wanted) = wanted else { continue };
            if current.and_then(|c| c.as_ref()) == Some(wanted) {
                continue;
            }
            out.push(Planned::new(
                declared,
                PHASE_CONFIGURE,
                minor,
                Action::new(
                    ActionKind::SetConfig,
                    Subsystem::Users,
                    format!("{}.{}", name, field),
                )
                .with_before(current.and_then(text))
                .with_after(Some(SettingValue::Text(wanted.clone()))),
            ));
        }

        let current_groups: &[String] = existing.map(|u| u.groups.as_slice()).unwrap_or(&[]);
        for (minor, group) in user.groups.iter().enumerate() {
            if !current_groups.contains(group) {
                out.push(Planned::new(
                    declared,
                    PHASE_MEMBERSHIP,
                    minor,
                    Action::new(
                        ActionKind::AddToGroup,
                        Subsystem::Users,
                        format!("{}:{}", name, group),
                    ),
                ));
            }
        }
        for group in current_groups {
            if !user.groups.contains(group) {
                out.push(Planned::new(
                    declared,
                    PHASE_MEMBERSHIP,
                    usize::MAX,
                    Action::new(
                        ActionKind::RemoveFromGroup,
                        Subsystem::Users,
                        format!("{}:{}", name, group),
                    ),
                ));
            }
        }
    }

    for (name, seen) in &observed.users {
        if desired.users.contains(name) || matches!(seen, Observed::Known(None)) {
            continue;
        }
        out.push(Planned::new(
            Declared::Undeclared,
            PHASE_CREATE,
            0,
            Action::new(ActionKind::RemoveUser, Subsystem::Users, name),
        ));
    }
}

pub(super) fn diff_services(
    desired: &DesiredState,
    observed: &ObservedState,
    out: &mut Vec<Planned>,
) {
    for (index, (name, service)) in desired.services.iter().enumerate() {
        let declared = Declared::At(index);

        if let Some(package) = &service.package {
            if !matches!(observed.packages.get(package), Some(Observed::Known(true))) {
                out.push(Planned::new(
                    declared,
                    PHASE_CREATE,
                    0,
                    Action::new(ActionKind::Install, Subsystem::Services, package.clone()),
                ));
            }
        }

        let seen = match observed.services.get(name) {
            Some(Observed::Known(seen)) => Some(seen),
            _ => None,
        };

        if seen.map(|s| s.enabled) != Some(service.enable) {
            let kind = if service.enable {
                ActionKind::EnableService
            } else {
                ActionKind::DisableService
            };
            out.push(Planned::new(
                declared,
                PHASE_CREATE,
                1,
                Action::new(kind, Subsystem::Services, name),
            ));
        }

        for (minor, (key, value)) in service.settings.iter().enumerate() {
            let current = seen.and_then(|s| s.settings.get(key));
            if current == Some(value) {
                continue;
            }
            out.push(Planned::new(
                declared,
                PHASE_CONFIGURE,
                minor,
                Action::new(
                    ActionKind::SetConfig,
                    Subsystem::Services,
                    format!("{}.{}", name, key),
                )
                .with_before(current.cloned())
                .with_after(Some(value.clone())),
            ));
        }

        if let Some(seen) = seen {
            for (key, value) in &seen.settings {
                if service.settings.contains(key) {
                    continue;
                }
                out.push(Planned::new(
                    declared,
                    PHASE_CONFIGURE,
                    usize::MAX,
                    Action::new(
                        ActionKind::SetConfig,
                        Subsystem::Services,
                        format!("{}.{}", name, key),
                    )
                    .with_before(Some(value.clone())),
                ));
            }
        }
    }

    for (name, seen) in &observed.services {
        if desired.services.contains(name) {
            continue;
        }
        let enabled = match seen {
            Observed::Known(seen) => seen.enabled,
            Observed::Unknown { .. } => true,
        };
        if enabled {
            out.push(Planned::new(
                Declared::Undeclared,
                PHASE_CREATE,
                0,
                Action::new(ActionKind::DisableService, Subsystem::Services, name),
            ));
        }
    }
}

pub(super) fn diff_packages(
    desired: &DesiredState,
    observed: &ObservedState,
    out: &mut Vec<Planned>,
) {
    for (index, package) in desired.packages.iter().enumerate() {
        if desired.is_service_package(package) {
            continue;
        }
        if !matches!(observed.packages.get(package), Some(Observed::Known(true))) {
            out.push(Planned::new(
                Declared::At(index),
                PHASE_CREATE,
                0,
                Action::new(ActionKind::Install, Subsystem::Packages, package.clone()),
            ));
        }
    }

    let required = desired.required_packages();
    for (package, seen) in &observed.packages {
        if required.contains(package.as_str()) || matches!(seen, Observed::Known(false)) {
            continue;
        }
        // Driver packages belong to the driver diff.
        if observed.drivers.values().any(|d| &d.package == package) {
            continue;
        }
        out.push(Planned::new(
            Declared::Undeclared,
            PHASE_CREATE,
            0,
            Action::new(ActionKind::Remove, Subsystem::Packages, package.clone()),
        ));
    }
}

pub(super) fn diff_files(desired: &DesiredState, observed: &ObservedState, out: &mut Vec<Planned>) {
    for (index, (path, file)) in desired.files.iter().enumerate() {
        let wanted_hash = hex::encode(compute_content_hash(file.content.as_bytes()));
        let current = match observed.files.get(path) {
            Some(Observed::Known(current)) => Some(current.as_ref()),
            _ => None,
        };
        let existing = current.flatten();

        let content_matches = existing.map(|f| f.content_hash == wanted_hash) == Some(true);
        if !content_matches {
            out.push(Planned::new(
                Declared::At(index),
                PHASE_CREATE,
                0,
                Action::new(ActionKind::WriteFile, Subsystem::Files, path)
                    .with_before(existing.map(|f| SettingValue::Text(f.content_hash.clone())))
                    .with_after(Some(SettingValue::Text(file.content.clone()))),
            ));
        }

        if let Some(mode) = &file.mode {
            let current_mode = existing.and_then(|f| f.mode.as_ref());
            // A fresh write carries no mode guarantee, so mode is set whenever
            // content is rewritten as well.
            if !content_matches || current_mode != Some(mode) {
                out.push(Planned::new(
                    Declared::At(index),
                    PHASE_CONFIGURE,
                    0,
                    Action::new(ActionKind::SetConfig, Subsystem::Files, format!("{}:mode", path))
                        .with_before(current_mode.cloned().map(SettingValue::Text))
                        .with_after(Some(SettingValue::Text(mode.clone()))),
                ));
            }
        }
    }

    for (path, seen) in &observed.files {
        if desired.files.contains(path) || matches!(seen, Observed::Known(None)) {
            continue;
        }
        out.push(Planned::new(
            Declared::Undeclared,
            PHASE_CREATE,
            0,
            Action::new(ActionKind::RemoveFile, Subsystem::Files, path),
        ));
    }
}

pub(super) fn diff_environment(
    desired: &DesiredState,
    observed: &ObservedState,
    out: &mut Vec<Planned>,
) {
    for (index, (name, value)) in desired.environment.iter().enumerate() {
        let current = match observed.environment.get(name) {
            Some(Observed::Known(current)) => Some(current.as_ref()),
            _ => None,
        };
        if current.flatten() == Some(value) {
            continue;
        }
        out.push(Planned::new(
            Declared::At(index),
            PHASE_CREATE,
            0,
            Action::new(ActionKind::SetEnv, Subsystem::Environment, name)
                .with_before(current.flatten().cloned().map(SettingValue::Text))
                .with_after(Some(SettingValue::Text(value.clone()))),
        ));
    }

    for (name, seen) in &observed.environment {
        if desired.environment.contains(name) || matches!(seen, Observed::Known(None)) {
            continue;
        }
        out.push(Planned::new(
            Declared::Undeclared,
            PHASE_CREATE,
            0,
            Action::new(ActionKind::UnsetEnv, Subsystem::Environment, name)
                .with_before(seen.known().cloned().flatten().map(SettingValue::Text)),
        ));
    }
}
