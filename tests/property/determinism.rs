//! Property-based tests for determinism and convergence guarantees

use hostform::action::SettingValue;
use hostform::descriptor::{
    compute_state_hash, DeclaredMap, DesiredState, DriverSpec, ServiceSpec,
};
use hostform::diff::diff;
use hostform::host::HostImage;
use hostform::observed::{ObservedState, ProbeScope};
use hostform::subsystem::Subsystem;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// A valid descriptor state: packages, a service for some of them and
/// environment variables.
fn desired_state() -> impl Strategy<Value = DesiredState> {
    (
        prop::collection::btree_set("[a-z][a-z0-9-]{0,8}", 0..6),
        prop::collection::btree_map("[A-Z][A-Z0-9_]{0,6}", "[a-z0-9/]{1,10}", 0..5),
        any::<u8>(),
        "[a-z0-9.]{1,12}",
    )
        .prop_map(|(packages, environment, service_mask, host_setting)| {
            build_state(packages, environment, service_mask, host_setting)
        })
}

fn build_state(
    packages: BTreeSet<String>,
    environment: BTreeMap<String, String>,
    service_mask: u8,
    host_setting: String,
) -> DesiredState {
    let mut state = DesiredState {
        packages: packages.iter().cloned().collect(),
        ..Default::default()
    };
    for (i, package) in packages.iter().enumerate() {
        if service_mask & (1 << (i % 8)) == 0 {
            continue;
        }
        let mut settings = DeclaredMap::new();
        settings.insert("host", SettingValue::Text(host_setting.clone()));
        state.services.insert(
            format!("svc-{}", package),
            ServiceSpec {
                enable: true,
                package: Some(package.clone()),
                after: Vec::new(),
                settings,
            },
        );
    }
    for (name, value) in environment {
        state.environment.insert(name, value);
    }
    state
}

/// A state where each of a few packages is unmanaged, listed in `packages`,
/// or owned by a driver under one of two names.
fn ownership_state() -> impl Strategy<Value = DesiredState> {
    prop::collection::vec(0u8..4, 4).prop_map(|owners| {
        let mut state = DesiredState::default();
        for (i, owner) in owners.into_iter().enumerate() {
            let package = format!("pkg-{}", i);
            let driver = match owner {
                1 => {
                    state.packages.push(package);
                    continue;
                }
                2 => format!("drv-{}", i),
                3 => format!("alt-{}", i),
                _ => continue,
            };
            state.drivers.insert(
                driver,
                DriverSpec {
                    package,
                    kernel_modules: vec![format!("mod-{}", i)],
                },
            );
        }
        state
    })
}

fn observe(image: &HostImage, scope: &ProbeScope) -> ObservedState {
    let mut observed = ObservedState::default();
    for subsystem in Subsystem::ALL {
        image.observe(subsystem, scope, &mut observed);
    }
    observed
}

/// Diffing the same inputs twice yields the same action list
#[test]
fn test_diff_determinism_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&desired_state(), |desired| {
            let scope = ProbeScope::from_states([&desired]);
            let observed = observe(&HostImage::default(), &scope);

            let first = diff(&desired, &observed);
            let second = diff(&desired, &observed);
            prop_assert_eq!(first, second);

            Ok(())
        })
        .unwrap();
}

/// Applying a plan to an empty host converges it: the next diff is empty
#[test]
fn test_apply_converges_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&desired_state(), |desired| {
            let scope = ProbeScope::from_states([&desired]);
            let mut image = HostImage::default();

            let actions = diff(&desired, &observe(&image, &scope));
            for action in &actions {
                image.apply(action).unwrap();
            }

            let remaining = diff(&desired, &observe(&image, &scope));
            prop_assert!(remaining.is_empty(), "left over: {:?}", remaining);

            Ok(())
        })
        .unwrap();
}

/// A host that already matches the descriptor needs nothing
#[test]
fn test_converged_host_is_noop_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&desired_state(), |desired| {
            let observed = ObservedState::converged(&desired);
            prop_assert!(diff(&desired, &observed).is_empty());
            Ok(())
        })
        .unwrap();
}

/// Services are always enabled after their package is installed and
/// configured after they are enabled
#[test]
fn test_service_ordering_property() {
    use hostform::action::ActionKind;
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&desired_state(), |desired| {
            let scope = ProbeScope::from_states([&desired]);
            let actions = diff(&desired, &observe(&HostImage::default(), &scope));
            let position = |kind: ActionKind, target: &str| {
                actions
                    .iter()
                    .position(|a| a.kind == kind && a.target == target)
            };

            for (name, service) in desired.services.iter() {
                let enable = position(ActionKind::EnableService, name).unwrap();
                if let Some(package) = &service.package {
                    let install = position(ActionKind::Install, package).unwrap();
                    prop_assert!(install < enable);
                }
                let configure = position(ActionKind::SetConfig, &format!("{}.host", name)).unwrap();
                prop_assert!(enable < configure);
            }

            Ok(())
        })
        .unwrap();
}

/// The state hash depends only on the state's content
#[test]
fn test_state_hash_stability_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(desired_state(), "[a-z]{1,8}"), |(desired, extra)| {
            let hash1 = compute_state_hash(&desired).unwrap();
            let hash2 = compute_state_hash(&desired.clone()).unwrap();
            prop_assert_eq!(hash1, hash2);

            let mut changed = desired.clone();
            changed.environment.insert("HOSTFORM_PROPERTY_EXTRA", extra);
            let hash3 = compute_state_hash(&changed).unwrap();
            prop_assert_ne!(hash1, hash3);

            Ok(())
        })
        .unwrap();
}

/// Moving packages between `packages` and drivers converges in one apply and
/// leaves exactly the packages the new state needs
#[test]
fn test_package_ownership_changes_converge_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(ownership_state(), ownership_state()), |(old, new)| {
            let mut image = HostImage::default();
            let old_scope = ProbeScope::from_states([&old]);
            for action in diff(&old, &observe(&image, &old_scope)) {
                image.apply(&action).unwrap();
            }

            let scope = ProbeScope::from_states([&new, &old]);
            for action in diff(&new, &observe(&image, &scope)) {
                image.apply(&action).unwrap();
            }

            let remaining = diff(&new, &observe(&image, &scope));
            prop_assert!(remaining.is_empty(), "left over: {:?}", remaining);

            let expected: BTreeSet<String> = new
                .required_packages()
                .into_iter()
                .map(str::to_string)
                .collect();
            prop_assert_eq!(&image.packages, &expected);
            let loaded: BTreeSet<&str> = new.drivers.names().collect();
            prop_assert_eq!(
                image.driver_modules.keys().map(String::as_str).collect::<BTreeSet<_>>(),
                loaded
            );

            Ok(())
        })
        .unwrap();
}
