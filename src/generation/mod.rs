//! Generation Store
//!
//! A generation records one successful convergence: the desired state that
//! was applied (by content hash, with the state itself kept as a snapshot)
//! and the actions that got the host there. History is linear and append
//! only. Failed or cancelled attempts are kept separately as run records and
//! never become generations.

pub mod store;

pub use store::{GcReport, GenerationIter, GenerationStore, RollbackPlan, StoreLock};

use crate::action::Action;
use crate::descriptor::DesiredState;
use crate::types::{GenerationId, StateHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a generation came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationOrigin {
    Apply,
    Rollback { target: GenerationId },
}

impl fmt::Display for GenerationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationOrigin::Apply => f.write_str("apply"),
            GenerationOrigin::Rollback { target } => write!(f, "rollback to {}", target),
        }
    }
}

/// Immutable record of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
    pub parent: Option<GenerationId>,
    #[serde(with = "crate::types::hex_hash")]
    pub desired_hash: StateHash,
    pub created_at: DateTime<Utc>,
    pub actions: Vec<Action>,
    pub success: bool,
    pub origin: GenerationOrigin,
    /// Descriptor the state was loaded from, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
}

/// What to record alongside a new generation.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub state: &'a DesiredState,
    pub hash: StateHash,
    pub actions: Vec<Action>,
    pub origin: GenerationOrigin,
    pub descriptor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Failed,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Failed => f.write_str("failed"),
            RunOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A reconciliation attempt that did not produce a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Assigned by the store when the record is written.
    #[serde(default)]
    pub id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "crate::types::hex_hash")]
    pub desired_hash: StateHash,
    pub origin: GenerationOrigin,
    pub applied: Vec<Action>,
    pub pending: Vec<Action>,
    pub failed_index: Option<usize>,
    pub error: Option<String>,
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn label(&self) -> String {
        format!("run-{}", self.id)
    }
}
