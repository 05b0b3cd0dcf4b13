//! Descriptor parsing: TOML text -> validated `DesiredState`.

use crate::descriptor::hash::compute_state_hash;
use crate::descriptor::validate::validate;
use crate::descriptor::DesiredState;
use crate::error::LoadError;
use crate::types::StateHash;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A validated desired state together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedDescriptor {
    pub state: DesiredState,
    pub hash: StateHash,
    pub origin: String,
    pub path: Option<PathBuf>,
}

/// Read and load a descriptor file.
pub fn load_descriptor(path: &Path) -> Result<LoadedDescriptor, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let canonical = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut loaded = parse_descriptor(&text, &canonical.display().to_string())?;
    loaded.path = Some(canonical);
    Ok(loaded)
}

/// Parse and validate descriptor text. `origin` names the source in errors.
pub fn parse_descriptor(text: &str, origin: &str) -> Result<LoadedDescriptor, LoadError> {
    let state: DesiredState = toml::from_str(text).map_err(|e| LoadError::Parse {
        origin: origin.to_string(),
        message: e.message().to_string(),
    })?;

    validate(&state).map_err(|problems| LoadError::Validation {
        origin: origin.to_string(),
        problems,
    })?;

    let hash = compute_state_hash(&state).map_err(|e| LoadError::Parse {
        origin: origin.to_string(),
        message: format!("cannot encode desired state: {}", e),
    })?;

    debug!(
        origin,
        services = state.services.len(),
        packages = state.packages.len(),
        users = state.users.len(),
        state_hash = %crate::types::short_hash(&hash),
        "Descriptor loaded"
    );

    Ok(LoadedDescriptor {
        state,
        hash,
        origin: origin.to_string(),
        path: None,
    })
}
