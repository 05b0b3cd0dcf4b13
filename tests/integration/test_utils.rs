//! Shared test utilities for integration tests
//!
//! Centralizes XDG isolation for in-process config loading and for spawned
//! `hostform` processes, so tests never read or write the real user's
//! configuration, data or state directories.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Mutex;
use tempfile::TempDir;

/// Global mutex to serialize XDG environment variable access across all tests
/// This prevents race conditions when tests run in parallel
static XDG_ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Environment variable state to restore after test
struct EnvState {
    vars: Vec<(&'static str, Option<String>)>,
}

const XDG_VARS: [&str; 4] = ["HOME", "XDG_CONFIG_HOME", "XDG_DATA_HOME", "XDG_STATE_HOME"];

impl EnvState {
    fn capture() -> Self {
        Self {
            vars: XDG_VARS
                .iter()
                .map(|key| (*key, std::env::var(key).ok()))
                .collect(),
        }
    }

    fn restore(self) {
        for (key, value) in self.vars {
            match value {
                Some(orig) => std::env::set_var(key, orig),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Run `f` with HOME and the XDG base directories pointing into `test_dir`.
///
/// Layout: `config/` is XDG_CONFIG_HOME, `data/` XDG_DATA_HOME, `state/`
/// XDG_STATE_HOME and `home/` HOME. The original environment is restored
/// afterwards.
pub fn with_xdg_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = XDG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    for (key, dir) in xdg_dirs(test_dir.path()) {
        std::fs::create_dir_all(&dir).unwrap();
        std::env::set_var(key, &dir);
    }

    let result = f();

    env_state.restore();

    result
}

fn xdg_dirs(root: &Path) -> [(&'static str, PathBuf); 4] {
    [
        ("HOME", root.join("home")),
        ("XDG_CONFIG_HOME", root.join("config")),
        ("XDG_DATA_HOME", root.join("data")),
        ("XDG_STATE_HOME", root.join("state")),
    ]
}

/// An isolated directory to run the `hostform` binary in.
pub struct HostformEnv {
    pub dir: TempDir,
}

impl HostformEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        for (_, path) in xdg_dirs(dir.path()) {
            std::fs::create_dir_all(path).unwrap();
        }
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `hostform.toml` in the working directory.
    pub fn write_descriptor(&self, text: &str) {
        std::fs::write(self.root().join("hostform.toml"), text).unwrap();
    }

    /// Path of the state-file host image the binary uses by default.
    pub fn host_image_path(&self) -> PathBuf {
        self.root().join("data").join("hostform").join("host.json")
    }

    pub fn host_image(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.host_image_path()).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_hostform"));
        command.current_dir(self.root());
        for (key, path) in xdg_dirs(self.root()) {
            command.env(key, path);
        }
        command
            .env_remove("HOSTFORM_ENV")
            .env_remove("HOSTFORM_LOG")
            .env("HOSTFORM_LOG_OUTPUT", "stderr");
        command
    }

    /// Run `hostform <args>` quietly.
    pub fn run(&self, args: &[&str]) -> Output {
        self.command().arg("--quiet").args(args).output().unwrap()
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// The workstation descriptor used across tests.
pub fn workstation_fixture() -> String {
    std::fs::read_to_string(
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("workstation.toml"),
    )
    .unwrap()
}
