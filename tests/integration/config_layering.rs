//! Configuration layering: defaults, the global XDG file, the host's
//! config directory and the environment-specific file.

use super::test_utils::with_xdg_env;
use hostform::config::{BackendKind, ConfigLoader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Run `f` with HOSTFORM_ENV set to `value`, restoring it afterwards.
fn with_hostform_env<R>(value: Option<&str>, f: impl FnOnce() -> R) -> R {
    let saved = std::env::var("HOSTFORM_ENV").ok();
    match value {
        Some(v) => std::env::set_var("HOSTFORM_ENV", v),
        None => std::env::remove_var("HOSTFORM_ENV"),
    }
    let result = f();
    match saved {
        Some(v) => std::env::set_var("HOSTFORM_ENV", v),
        None => std::env::remove_var("HOSTFORM_ENV"),
    }
    result
}

#[test]
fn test_defaults_without_any_file() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("host");
    std::fs::create_dir_all(&root).unwrap();

    let config = with_xdg_env(&dir, || {
        with_hostform_env(None, || ConfigLoader::load(&root)).unwrap()
    });
    assert_eq!(config.descriptor, PathBuf::from("hostform.toml"));
    assert_eq!(config.backend.kind, BackendKind::StateFile);
    assert_eq!(config.reconcile.watchdog(), Duration::from_secs(300));
    assert_eq!(config.descriptor_path(&root), root.join("hostform.toml"));
}

#[test]
fn test_global_file_is_picked_up() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("host");
    std::fs::create_dir_all(&root).unwrap();
    write(
        &dir.path().join("config/hostform/config.toml"),
        "descriptor = \"machines/desk.toml\"\n\n[reconcile]\nwatchdog_secs = 45\n",
    );

    let config = with_xdg_env(&dir, || {
        with_hostform_env(None, || ConfigLoader::load(&root)).unwrap()
    });
    assert_eq!(config.descriptor, PathBuf::from("machines/desk.toml"));
    assert_eq!(config.reconcile.watchdog_secs, 45);
}

#[test]
fn test_host_file_overrides_global_file() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("host");
    write(
        &dir.path().join("config/hostform/config.toml"),
        "[reconcile]\nwatchdog_secs = 45\n\n[backend]\nkind = \"command\"\n",
    );
    write(
        &root.join("config/config.toml"),
        "[reconcile]\nwatchdog_secs = 90\n",
    );

    let config = with_xdg_env(&dir, || {
        with_hostform_env(None, || ConfigLoader::load(&root)).unwrap()
    });
    assert_eq!(config.reconcile.watchdog_secs, 90);
    // Keys the host file leaves alone keep the global value.
    assert_eq!(config.backend.kind, BackendKind::Command);
}

#[test]
fn test_environment_file_overrides_host_file() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("host");
    write(
        &root.join("config/config.toml"),
        "[reconcile]\nwatchdog_secs = 90\n",
    );
    write(
        &root.join("config/staging.toml"),
        "[reconcile]\nwatchdog_secs = 15\n",
    );
    write(
        &root.join("config/production.toml"),
        "[reconcile]\nwatchdog_secs = 600\n",
    );

    let (staging, production) = with_xdg_env(&dir, || {
        let staging = with_hostform_env(Some("staging"), || ConfigLoader::load(&root)).unwrap();
        let production = with_hostform_env(None, || ConfigLoader::load(&root)).unwrap();
        (staging, production)
    });
    assert_eq!(staging.reconcile.watchdog_secs, 15);
    assert_eq!(production.reconcile.watchdog_secs, 600);
}

#[test]
fn test_data_dir_follows_xdg_data_home() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("host");
    std::fs::create_dir_all(&root).unwrap();

    let (data_dir, store_path) = with_xdg_env(&dir, || {
        let config = with_hostform_env(None, || ConfigLoader::load(&root)).unwrap();
        (config.data_dir(), config.store_path())
    });
    assert!(data_dir.starts_with(dir.path().join("data")));
    assert_eq!(store_path, data_dir.join("store"));
}

#[test]
fn test_malformed_global_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("host");
    std::fs::create_dir_all(&root).unwrap();
    write(
        &dir.path().join("config/hostform/config.toml"),
        "[reconcile\nwatchdog_secs = ",
    );

    let result = with_xdg_env(&dir, || {
        with_hostform_env(None, || ConfigLoader::load(&root))
    });
    assert!(result.is_err());
}
