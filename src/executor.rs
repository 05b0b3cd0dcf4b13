//! Action Executor: applies an ordered action list to the host, one at a time.
//!
//! The first failure halts the run. Nothing is retried and nothing already
//! applied is undone; the report says exactly which actions took effect and
//! which did not.

use crate::action::Action;
use crate::error::ActionError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Applies one action to the host.
pub trait ActionApplier: Send + Sync {
    fn apply(&self, action: &Action) -> Result<(), ActionError>;
}

impl<T: ActionApplier + ?Sized> ActionApplier for Arc<T> {
    fn apply(&self, action: &Action) -> Result<(), ActionError> {
        (**self).apply(action)
    }
}

/// What a cancellation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No action was running; the run stops before the next one.
    Immediate,
    /// An action is in flight; the run stops once it completes.
    Deferred,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    in_flight: AtomicBool,
}

/// Cooperative cancellation shared between the CLI and a running reconcile.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) -> CancelOutcome {
        self.state.requested.store(true, Ordering::SeqCst);
        if self.state.in_flight.load(Ordering::SeqCst) {
            CancelOutcome::Deferred
        } else {
            CancelOutcome::Immediate
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn set_in_flight(&self, in_flight: bool) {
        self.state.in_flight.store(in_flight, Ordering::SeqCst);
    }
}

/// Snapshot of a run in progress, read by the watchdog.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub applied: usize,
    pub current: Option<Action>,
    pub current_started: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionProgress {
    inner: Arc<Mutex<ProgressSnapshot>>,
}

impl ExecutionProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().clone()
    }

    /// How long the current action has been running, if any.
    pub fn current_elapsed(&self) -> Option<Duration> {
        self.inner.lock().current_started.map(|s| s.elapsed())
    }

    fn start(&self, total: usize) {
        *self.inner.lock() = ProgressSnapshot {
            total,
            ..Default::default()
        };
    }

    fn begin(&self, action: &Action) {
        let mut inner = self.inner.lock();
        inner.current = Some(action.clone());
        inner.current_started = Some(Instant::now());
    }

    fn finish(&self, succeeded: bool) {
        let mut inner = self.inner.lock();
        if succeeded {
            inner.applied += 1;
        }
        inner.current = None;
        inner.current_started = None;
    }
}

/// Outcome of executing an action list.
///
/// `applied` and `pending` always partition the input in order. On failure
/// the failed action is the first pending one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub applied: Vec<Action>,
    pub pending: Vec<Action>,
    #[serde(skip)]
    pub failure: Option<ActionError>,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    /// Index of the failed action in the original list.
    pub fn failed_index(&self) -> Option<usize> {
        self.failure.as_ref().map(|_| self.applied.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionExecutor {
    cancel: CancelToken,
    progress: ExecutionProgress,
}

impl ActionExecutor {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            progress: ExecutionProgress::default(),
        }
    }

    pub fn progress(&self) -> ExecutionProgress {
        self.progress.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Apply `actions` in order, halting at the first failure or cancellation.
    pub fn execute<A: ActionApplier + ?Sized>(
        &self,
        applier: &A,
        actions: &[Action],
    ) -> ExecutionReport {
        let total = actions.len();
        let mut report = ExecutionReport::default();
        self.progress.start(total);
        info!(total, "Executing actions");

        for (index, action) in actions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(applied = index, pending = total - index, "Execution cancelled");
                report.cancelled = true;
                report.pending = actions[index..].to_vec();
                return report;
            }

            info!(step = index + 1, total, action = %action, "Applying action");
            self.cancel.set_in_flight(true);
            self.progress.begin(action);
            let outcome = applier.apply(action);
            self.cancel.set_in_flight(false);
            self.progress.finish(outcome.is_ok());

            match outcome {
                Ok(()) => report.applied.push(action.clone()),
                Err(err) => {
                    error!(
                        step = index + 1,
                        total,
                        kind = %err.kind,
                        target = %err.target,
                        cause = %err.cause,
                        "Action failed; halting"
                    );
                    report.pending = actions[index..].to_vec();
                    report.failure = Some(err);
                    return report;
                }
            }
        }

        info!(applied = report.applied.len(), "All actions applied");
        report
    }
}
