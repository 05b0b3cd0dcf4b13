//! Host modelled as a JSON image on disk.
//!
//! Every action is a read-modify-write of the image; the write goes to a
//! sibling temp file which is then renamed over the image, so a crash never
//! leaves a half-written host.

use crate::action::Action;
use crate::error::{ActionError, ProbeError};
use crate::executor::ActionApplier;
use crate::host::image::HostImage;
use crate::host::HostBackend;
use crate::observed::{ObservedState, ProbeScope};
use crate::subsystem::Subsystem;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct StateFileHost {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateFileHost {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the image. A missing file is an empty host.
    pub fn load(&self) -> Result<HostImage> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Malformed host image {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HostImage::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read host image {}", self.path.display())),
        }
    }

    /// Replace the image atomically.
    pub fn store(&self, image: &HostImage) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "host.json".to_string());
        let temp = dir.join(format!(".{}.tmp", file_name));

        let json = serde_json::to_vec_pretty(image).context("Failed to encode host image")?;
        {
            let mut file = std::fs::File::create(&temp)
                .with_context(|| format!("Failed to create {}", temp.display()))?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn apply_inner(&self, action: &Action) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut image = self.load()?;
        image.apply(action)?;
        self.store(&image)?;
        debug!(path = %self.path.display(), action = %action, "Host image updated");
        Ok(())
    }
}

impl ActionApplier for StateFileHost {
    fn apply(&self, action: &Action) -> Result<(), ActionError> {
        self.apply_inner(action).map_err(|e| ActionError {
            kind: action.kind,
            target: action.target.clone(),
            cause: format!("{:#}", e),
        })
    }
}

impl HostBackend for StateFileHost {
    fn name(&self) -> &str {
        "state-file"
    }

    fn probe_subsystem(
        &self,
        subsystem: Subsystem,
        scope: &ProbeScope,
        observed: &mut ObservedState,
    ) -> Result<(), ProbeError> {
        let image = self.load().map_err(|e| ProbeError {
            subsystem,
            cause: format!("{:#}", e),
        })?;
        image.observe(subsystem, scope, observed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::observed::Observed;
    use tempfile::TempDir;

    #[test]
    fn test_missing_image_is_empty_host() {
        let dir = TempDir::new().unwrap();
        let host = StateFileHost::new(dir.path().join("host.json"));
        assert_eq!(host.load().unwrap(), HostImage::default());
    }

    #[test]
    fn test_apply_persists_image() {
        let dir = TempDir::new().unwrap();
        let host = StateFileHost::new(dir.path().join("nested/host.json"));
        host.apply(&Action::new(ActionKind::Install, Subsystem::Packages, "git"))
            .unwrap();

        let reopened = StateFileHost::new(dir.path().join("nested/host.json"));
        let mut scope = ProbeScope::default();
        scope.packages.insert("git".to_string());
        let mut observed = ObservedState::default();
        reopened
            .probe_subsystem(Subsystem::Packages, &scope, &mut observed)
            .unwrap();
        assert_eq!(observed.packages["git"], Observed::Known(true));
        assert!(!dir.path().join("nested/.host.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_image_fails_probe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, "{ not json").unwrap();
        let host = StateFileHost::new(&path);

        let err = host
            .probe_subsystem(Subsystem::Boot, &ProbeScope::default(), &mut ObservedState::default())
            .unwrap_err();
        assert_eq!(err.subsystem, Subsystem::Boot);
        assert!(err.cause.contains("Malformed host image"));

        let err = host
            .apply(&Action::new(ActionKind::Install, Subsystem::Packages, "git"))
            .unwrap_err();
        assert_eq!(err.target, "git");
    }
}
