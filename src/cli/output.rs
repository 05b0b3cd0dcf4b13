//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::action::Action;
use crate::error::{LoadError, ReconcileError};

pub const EXIT_PARSE: i32 = 2;
pub const EXIT_VALIDATION: i32 = 3;
pub const EXIT_ACTION: i32 = 4;
pub const EXIT_CANCELLED: i32 = 5;
pub const EXIT_STORAGE: i32 = 6;
pub const EXIT_LOCKED: i32 = 7;
pub const EXIT_CONFIG: i32 = 8;
pub const EXIT_UNKNOWN_GENERATION: i32 = 9;
pub const EXIT_INTERNAL: i32 = 1;

/// Process exit code for an error.
pub fn exit_code(e: &ReconcileError) -> i32 {
    match e {
        ReconcileError::Load(LoadError::Read { .. })
        | ReconcileError::Load(LoadError::Parse { .. }) => EXIT_PARSE,
        ReconcileError::Load(LoadError::Validation { .. }) => EXIT_VALIDATION,
        ReconcileError::ActionFailed { .. } => EXIT_ACTION,
        ReconcileError::Cancelled { .. } => EXIT_CANCELLED,
        ReconcileError::Storage(_) => EXIT_STORAGE,
        ReconcileError::StoreLocked => EXIT_LOCKED,
        ReconcileError::Config(_) => EXIT_CONFIG,
        ReconcileError::UnknownGeneration(_) => EXIT_UNKNOWN_GENERATION,
        ReconcileError::Internal(_) => EXIT_INTERNAL,
    }
}

/// Render an error for stderr. Failed and cancelled runs list exactly what
/// was applied and what was not.
pub fn map_error(e: &ReconcileError) -> String {
    match e {
        ReconcileError::ActionFailed {
            run_id,
            error,
            applied,
            pending,
        } => {
            let mut out = format!("Error: {}\nRecorded as {}", error, run_id);
            push_actions(&mut out, "Applied", applied, None);
            push_actions(&mut out, "Not applied", pending, Some(0));
            out
        }
        ReconcileError::Cancelled { applied, pending } => {
            let mut out =
                "Error: reconciliation cancelled; no generation was committed".to_string();
            push_actions(&mut out, "Applied", applied, None);
            push_actions(&mut out, "Not applied", pending, None);
            out
        }
        other => format!("Error: {}", other),
    }
}

fn push_actions(out: &mut String, title: &str, actions: &[Action], failed: Option<usize>) {
    out.push_str(&format!("\n{} ({}):", title, actions.len()));
    for (i, action) in actions.iter().enumerate() {
        if failed == Some(i) {
            out.push_str(&format!("\n  ! {}  (failed)", action));
        } else {
            out.push_str(&format!("\n  - {}", action));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::error::ActionError;
    use crate::subsystem::Subsystem;

    #[test]
    fn test_action_failure_lists_both_sides() {
        let err = ReconcileError::ActionFailed {
            run_id: "run-7".to_string(),
            error: ActionError {
                kind: ActionKind::EnableService,
                target: "ollama".to_string(),
                cause: "unit not found".to_string(),
            },
            applied: vec![Action::new(ActionKind::Install, Subsystem::Services, "ollama")],
            pending: vec![
                Action::new(ActionKind::EnableService, Subsystem::Services, "ollama"),
                Action::new(ActionKind::Install, Subsystem::Packages, "git"),
            ],
        };
        assert_eq!(exit_code(&err), EXIT_ACTION);
        let text = map_error(&err);
        assert!(text.contains("run-7"));
        assert!(text.contains("Applied (1):\n  - install ollama"));
        assert!(text.contains("! enable-service ollama  (failed)"));
        assert!(text.contains("  - install git"));
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(exit_code(&ReconcileError::StoreLocked), EXIT_LOCKED);
        assert_eq!(exit_code(&ReconcileError::UnknownGeneration(4)), EXIT_UNKNOWN_GENERATION);
        assert_eq!(exit_code(&ReconcileError::Config("x".into())), EXIT_CONFIG);
    }
}
