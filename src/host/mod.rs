//! Host backends: the opaque collaborators that observe and change the host.
//!
//! Package installation, service management and account handling are never
//! implemented here; a backend either models them ([`StateFileHost`],
//! [`MemoryHost`]) or delegates them to configured commands ([`CommandHost`]).

pub mod command;
pub mod image;
pub mod memory;
pub mod state_file;

pub use command::{shell_quote, CommandHost, CommandTemplates};
pub use image::HostImage;
pub use memory::MemoryHost;
pub use state_file::StateFileHost;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{ProbeError, ReconcileError};
use crate::executor::ActionApplier;
use crate::observed::{HostFacts, ObservedState, ProbeScope};
use crate::subsystem::Subsystem;
use std::path::Path;
use std::sync::Arc;

/// A host that can be probed per subsystem and changed one action at a time.
pub trait HostBackend: ActionApplier {
    fn name(&self) -> &str;

    /// Whether `subsystem` can be observed on a host with these facts.
    fn supports(&self, _subsystem: Subsystem, _facts: &HostFacts) -> bool {
        true
    }

    fn probe_subsystem(
        &self,
        subsystem: Subsystem,
        scope: &ProbeScope,
        observed: &mut ObservedState,
    ) -> Result<(), ProbeError>;
}

/// Build the backend named by configuration. Relative paths resolve against
/// `data_dir`.
pub fn build_backend(
    config: &BackendConfig,
    data_dir: &Path,
) -> Result<Arc<dyn HostBackend>, ReconcileError> {
    match config.kind {
        BackendKind::StateFile => {
            let path = config
                .state_file
                .clone()
                .unwrap_or_else(|| data_dir.join("host.json"));
            let path = if path.is_relative() {
                data_dir.join(path)
            } else {
                path
            };
            Ok(Arc::new(StateFileHost::new(path)))
        }
        BackendKind::Command => {
            let env_file = config.env_file.clone().ok_or_else(|| {
                ReconcileError::Config(
                    "backend.env_file is required for the command backend".to_string(),
                )
            })?;
            Ok(Arc::new(
                CommandHost::new(config.commands.clone(), env_file)
                    .with_hardware_arches(config.hardware_arches.clone()),
            ))
        }
    }
}
