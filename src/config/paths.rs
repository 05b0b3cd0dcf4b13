//! Platform directories for hostform data, state and configuration.

use directories::ProjectDirs;
use std::path::PathBuf;

const APP_NAME: &str = "hostform";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Where the generation store and the state-file host image live by default:
/// `$XDG_DATA_HOME/hostform` on Linux, `./.hostform` when no home is known.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".hostform"))
}

/// Where log files go: `$XDG_STATE_HOME/hostform`, falling back to the data
/// directory on platforms without a state directory.
pub fn default_state_dir() -> PathBuf {
    project_dirs()
        .and_then(|dirs| dirs.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(default_data_dir)
}
