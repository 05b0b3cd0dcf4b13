//! Error types for the hostform reconciler.

use crate::action::{Action, ActionKind};
use crate::descriptor::validate::ValidationProblem;
use crate::subsystem::Subsystem;
use crate::types::GenerationId;
use std::path::PathBuf;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Generation store database error: {0}")]
    Database(String),

    #[error("Corrupt record in generation store: {0}")]
    Corrupt(String),

    #[error("Generation store is locked: {0}")]
    Locked(String),

    #[error("Generation {0} not found")]
    NotFound(GenerationId),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock => {
                StorageError::Locked(io.to_string())
            }
            sled::Error::Io(io) => StorageError::IoError(io),
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

/// Descriptor loading errors. Both variants fail a run before any side effect.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Cannot read descriptor {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("Validation failed for {origin}:\n{}", render_problems(.problems))]
    Validation {
        origin: String,
        problems: Vec<ValidationProblem>,
    },
}

fn render_problems(problems: &[ValidationProblem]) -> String {
    problems
        .iter()
        .map(|p| format!("  - {}", p))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A subsystem probe that could not observe the host. Absorbed into an
/// `Unknown` observation and reported as a warning.
#[derive(Debug, Clone, Error)]
#[error("Probe for {subsystem} failed: {cause}")]
pub struct ProbeError {
    pub subsystem: Subsystem,
    pub cause: String,
}

/// A single action that could not be applied.
#[derive(Debug, Clone, Error)]
#[error("Action {kind} on '{target}' failed: {cause}")]
pub struct ActionError {
    pub kind: ActionKind,
    pub target: String,
    pub cause: String,
}

/// Subsystem dependency graph errors.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("Subsystem dependency cycle involving: {0:?}")]
    Cycle(Vec<Subsystem>),
}

/// Top-level errors surfaced by the reconciler and the CLI.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("{error}; {} action(s) applied, {} pending (run {run_id})", .applied.len(), .pending.len())]
    ActionFailed {
        run_id: String,
        error: ActionError,
        applied: Vec<Action>,
        pending: Vec<Action>,
    },

    #[error("Reconciliation cancelled; {} action(s) applied, {} pending", .applied.len(), .pending.len())]
    Cancelled {
        applied: Vec<Action>,
        pending: Vec<Action>,
    },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Another reconciliation holds the generation store lock")]
    StoreLocked,

    #[error("Generation {0} not found")]
    UnknownGeneration(GenerationId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for ReconcileError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Locked(_) => ReconcileError::StoreLocked,
            StorageError::NotFound(id) => ReconcileError::UnknownGeneration(id),
            other => ReconcileError::Storage(other),
        }
    }
}

impl From<config::ConfigError> for ReconcileError {
    fn from(err: config::ConfigError) -> Self {
        ReconcileError::Config(err.to_string())
    }
}

impl From<GraphError> for ReconcileError {
    fn from(err: GraphError) -> Self {
        ReconcileError::Internal(err.to_string())
    }
}
