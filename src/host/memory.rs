//! In-memory host with failure injection, for embedding and tests.

use crate::action::{Action, ActionKind};
use crate::error::{ActionError, ProbeError};
use crate::executor::ActionApplier;
use crate::host::image::HostImage;
use crate::host::HostBackend;
use crate::observed::{ObservedState, ProbeScope};
use crate::subsystem::Subsystem;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryHost {
    image: Mutex<HostImage>,
    applied: Mutex<Vec<Action>>,
    fail_on: Mutex<Option<(ActionKind, String)>>,
    broken_probes: Mutex<BTreeSet<Subsystem>>,
    action_delay: Mutex<Option<Duration>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(image: HostImage) -> Self {
        Self {
            image: Mutex::new(image),
            ..Default::default()
        }
    }

    pub fn image(&self) -> HostImage {
        self.image.lock().clone()
    }

    /// Every action applied so far, in order.
    pub fn applied(&self) -> Vec<Action> {
        self.applied.lock().clone()
    }

    /// Make the action with this kind and target fail.
    pub fn fail_on(&self, kind: ActionKind, target: impl Into<String>) {
        *self.fail_on.lock() = Some((kind, target.into()));
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock() = None;
    }

    /// Make probing `subsystem` fail.
    pub fn break_probe(&self, subsystem: Subsystem) {
        self.broken_probes.lock().insert(subsystem);
    }

    /// Sleep this long inside every action.
    pub fn set_action_delay(&self, delay: Duration) {
        *self.action_delay.lock() = Some(delay);
    }
}

impl ActionApplier for MemoryHost {
    fn apply(&self, action: &Action) -> Result<(), ActionError> {
        if let Some(delay) = *self.action_delay.lock() {
            std::thread::sleep(delay);
        }

        let injected = self
            .fail_on
            .lock()
            .as_ref()
            .map(|(kind, target)| *kind == action.kind && *target == action.target)
            .unwrap_or(false);
        if injected {
            return Err(ActionError {
                kind: action.kind,
                target: action.target.clone(),
                cause: "injected failure".to_string(),
            });
        }

        self.image
            .lock()
            .apply(action)
            .map_err(|e| ActionError {
                kind: action.kind,
                target: action.target.clone(),
                cause: format!("{:#}", e),
            })?;
        self.applied.lock().push(action.clone());
        Ok(())
    }
}

impl HostBackend for MemoryHost {
    fn name(&self) -> &str {
        "memory"
    }

    fn probe_subsystem(
        &self,
        subsystem: Subsystem,
        scope: &ProbeScope,
        observed: &mut ObservedState,
    ) -> Result<(), ProbeError> {
        if self.broken_probes.lock().contains(&subsystem) {
            return Err(ProbeError {
                subsystem,
                cause: "injected probe failure".to_string(),
            });
        }
        self.image.lock().observe(subsystem, scope, observed);
        Ok(())
    }
}
