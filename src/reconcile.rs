//! Reconciler: one serialized run from descriptor to committed generation.
//!
//! A run holds the generation store lock throughout. The descriptor is loaded
//! while the host is probed, the diff waits for both, and the executor applies
//! the result one action at a time under a soft watchdog. Only a fully applied
//! action list becomes a generation; anything else is kept as a run record.

use crate::action::Action;
use crate::descriptor::validate::ValidationProblem;
use crate::descriptor::{load_descriptor, parse_descriptor, DesiredState, LoadedDescriptor};
use crate::diff::DiffEngine;
use crate::error::{LoadError, ProbeError, ReconcileError};
use crate::executor::{ActionExecutor, CancelToken, ExecutionProgress, ExecutionReport};
use crate::generation::{
    CommitRequest, Generation, GenerationOrigin, GenerationStore, RunOutcome, RunRecord,
};
use crate::host::HostBackend;
use crate::observed::{HostFacts, ProbeScope};
use crate::probe::{ProbeReport, StateProber};
use crate::types::{short_hash, GenerationId, StateHash};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default soft watchdog for a single action.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(300);

/// Where the desired state comes from.
#[derive(Debug, Clone)]
pub enum DescriptorSource {
    File(PathBuf),
    Inline { text: String, origin: String },
}

impl DescriptorSource {
    pub fn load(&self) -> Result<LoadedDescriptor, LoadError> {
        match self {
            DescriptorSource::File(path) => load_descriptor(path),
            DescriptorSource::Inline { text, origin } => parse_descriptor(text, origin),
        }
    }
}

/// Everything computed before the executor runs.
#[derive(Debug, Clone)]
pub struct Plan {
    pub descriptor: LoadedDescriptor,
    pub facts: HostFacts,
    pub active: Option<Generation>,
    pub actions: Vec<Action>,
    pub warnings: Vec<ProbeError>,
}

impl Plan {
    /// Nothing to apply and nothing new to record.
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
            && self
                .active
                .as_ref()
                .map(|g| g.desired_hash == self.descriptor.hash)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Committed(Generation),
    /// The host already matched and the active generation records this state.
    Unchanged { active: GenerationId },
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    pub warnings: Vec<ProbeError>,
}

impl ApplyReport {
    pub fn generation(&self) -> Option<&Generation> {
        match &self.outcome {
            ApplyOutcome::Committed(generation) => Some(generation),
            ApplyOutcome::Unchanged { .. } => None,
        }
    }
}

/// Desired state and provenance for a run about to execute.
struct RunInput<'a> {
    state: &'a DesiredState,
    hash: StateHash,
    origin: GenerationOrigin,
    descriptor: Option<String>,
    started_at: DateTime<Utc>,
}

pub struct Reconciler {
    store: GenerationStore,
    backend: Arc<dyn HostBackend>,
    prober: StateProber,
    engine: DiffEngine,
    facts: Option<HostFacts>,
    watchdog: Duration,
    cancel: CancelToken,
}

impl Reconciler {
    pub fn new(store: GenerationStore, backend: Arc<dyn HostBackend>) -> Self {
        Self {
            prober: StateProber::for_backend(Arc::clone(&backend)),
            store,
            backend,
            engine: DiffEngine::standard(),
            facts: None,
            watchdog: DEFAULT_WATCHDOG,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_prober(mut self, prober: StateProber) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_engine(mut self, engine: DiffEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Use these facts instead of reading them from the running host.
    pub fn with_facts(mut self, facts: HostFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &GenerationStore {
        &self.store
    }

    /// Load, probe and diff without touching the host.
    pub async fn plan(&self, source: &DescriptorSource) -> Result<Plan, ReconcileError> {
        let facts = self.facts.clone().unwrap_or_else(HostFacts::detect);
        let active = self.store.active()?;
        let active_state = match &active {
            Some(generation) => Some(self.store.desired_state(generation.id)?),
            None => None,
        };
        let uncommitted = self.uncommitted_actions(active.as_ref())?;
        let mut active_scope = ProbeScope::from_states(active_state.iter());
        active_scope.extend_with_actions(&uncommitted);

        // The probe only knows the active scope until the descriptor is parsed.
        let load = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || source.load())
        };
        let probe = self.spawn_probe(active_scope.clone(), facts.clone());
        let (loaded, probed) = tokio::join!(load, probe);
        let descriptor = loaded.map_err(join_error)??;
        let mut report = probed.map_err(join_error)?;

        check_selector(&descriptor, &facts)?;

        let mut scope =
            ProbeScope::from_states(std::iter::once(&descriptor.state).chain(active_state.iter()));
        scope.extend_with_actions(&uncommitted);
        if scope != active_scope {
            debug!("Descriptor widens probe scope; probing again");
            report = self.spawn_probe(scope, facts.clone()).await.map_err(join_error)?;
        }

        let actions = self.engine.diff(&descriptor.state, &report.observed);
        info!(
            origin = %descriptor.origin,
            state_hash = %short_hash(&descriptor.hash),
            actions = actions.len(),
            warnings = report.warnings.len(),
            "Plan computed"
        );

        Ok(Plan {
            descriptor,
            facts,
            active,
            actions,
            warnings: report.warnings,
        })
    }

    /// Actions applied by failed or cancelled runs since the active
    /// generation was committed. The host may still carry their effects.
    fn uncommitted_actions(
        &self,
        active: Option<&Generation>,
    ) -> Result<Vec<Action>, ReconcileError> {
        let since = active.map(|generation| generation.created_at);
        let runs = self.store.runs()?;
        let actions: Vec<Action> = runs
            .into_iter()
            .rev()
            .filter(|run| since.map_or(true, |since| run.started_at >= since))
            .flat_map(|run| run.applied)
            .collect();
        if !actions.is_empty() {
            debug!(actions = actions.len(), "Scoping actions left by uncommitted runs");
        }
        Ok(actions)
    }

    /// Converge the host to the descriptor and record a generation.
    pub async fn apply(&self, source: &DescriptorSource) -> Result<ApplyReport, ReconcileError> {
        let _lock = self.store.lock()?;
        let started_at = Utc::now();
        let plan = self.plan(source).await?;

        if plan.is_noop() {
            if let Some(active) = &plan.active {
                info!(generation = active.id, "Host already converged; nothing to do");
                return Ok(ApplyReport {
                    outcome: ApplyOutcome::Unchanged { active: active.id },
                    warnings: plan.warnings,
                });
            }
        }

        let generation = self
            .execute(
                plan.actions,
                RunInput {
                    state: &plan.descriptor.state,
                    hash: plan.descriptor.hash,
                    origin: GenerationOrigin::Apply,
                    descriptor: Some(plan.descriptor.origin.clone()),
                    started_at,
                },
            )
            .await?;

        Ok(ApplyReport {
            outcome: ApplyOutcome::Committed(generation),
            warnings: plan.warnings,
        })
    }

    /// Return the host to a stored generation's state as a new generation.
    ///
    /// The plan comes from stored snapshots alone: the target's state against
    /// the active generation's state as if fully converged.
    pub async fn rollback(&self, target: GenerationId) -> Result<Generation, ReconcileError> {
        let _lock = self.store.lock()?;
        let started_at = Utc::now();
        let plan = self.store.rollback(target, &self.engine)?;
        info!(
            target,
            active = ?plan.active,
            actions = plan.actions.len(),
            "Rolling back"
        );

        self.execute(
            plan.actions,
            RunInput {
                state: &plan.state,
                hash: plan.target.desired_hash,
                origin: GenerationOrigin::Rollback { target },
                descriptor: plan.target.descriptor.clone(),
                started_at,
            },
        )
        .await
    }

    fn spawn_probe(
        &self,
        scope: ProbeScope,
        facts: HostFacts,
    ) -> tokio::task::JoinHandle<ProbeReport> {
        let prober = self.prober.clone();
        tokio::task::spawn_blocking(move || prober.probe(&scope, &facts))
    }

    async fn execute(
        &self,
        actions: Vec<Action>,
        input: RunInput<'_>,
    ) -> Result<Generation, ReconcileError> {
        if self.cancel.is_cancelled() {
            warn!(pending = actions.len(), "Cancelled before execution");
            return Err(ReconcileError::Cancelled {
                applied: Vec::new(),
                pending: actions,
            });
        }

        let executor = ActionExecutor::new(self.cancel.clone());
        let watchdog = tokio::spawn(watch(executor.progress(), self.watchdog));
        let backend = Arc::clone(&self.backend);
        let report = tokio::task::spawn_blocking(move || executor.execute(&backend, &actions))
            .await;
        watchdog.abort();
        let report = report.map_err(join_error)?;

        if report.is_success() {
            let generation = self.store.commit(CommitRequest {
                state: input.state,
                hash: input.hash,
                actions: report.applied,
                origin: input.origin,
                descriptor: input.descriptor,
            })?;
            return Ok(generation);
        }

        Err(self.record_failure(report, &input))
    }

    fn record_failure(&self, report: ExecutionReport, input: &RunInput<'_>) -> ReconcileError {
        let outcome = if report.cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Failed
        };
        let record = RunRecord {
            id: 0,
            started_at: input.started_at,
            finished_at: Utc::now(),
            desired_hash: input.hash,
            origin: input.origin,
            applied: report.applied.clone(),
            pending: report.pending.clone(),
            failed_index: report.failed_index(),
            error: report.failure.as_ref().map(|e| e.to_string()),
            outcome,
        };
        let run_id = match self.store.record_run(record) {
            Ok(record) => record.label(),
            Err(err) => {
                error!(error = %err, "Failed to record run");
                "unrecorded".to_string()
            }
        };

        match report.failure {
            Some(error) => ReconcileError::ActionFailed {
                run_id,
                error,
                applied: report.applied,
                pending: report.pending,
            },
            None => ReconcileError::Cancelled {
                applied: report.applied,
                pending: report.pending,
            },
        }
    }
}

/// Reject a descriptor written for a different host.
fn check_selector(descriptor: &LoadedDescriptor, facts: &HostFacts) -> Result<(), LoadError> {
    let selector = &descriptor.state.host;
    let mut problems = Vec::new();
    if let Some(hostname) = &selector.hostname {
        if *hostname != facts.hostname {
            problems.push(ValidationProblem::new(
                "host.hostname",
                format!("descriptor targets '{}' but this host is '{}'", hostname, facts.hostname),
            ));
        }
    }
    if let Some(arch) = &selector.arch {
        if *arch != facts.arch {
            problems.push(ValidationProblem::new(
                "host.arch",
                format!("descriptor targets '{}' but this host is '{}'", arch, facts.arch),
            ));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(LoadError::Validation {
            origin: descriptor.origin.clone(),
            problems,
        })
    }
}

/// Log, once per action, any action running longer than `limit`.
async fn watch(progress: ExecutionProgress, limit: Duration) {
    let period = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(5));
    let mut ticker = tokio::time::interval(period);
    let mut warned_step = None;
    loop {
        ticker.tick().await;
        let snapshot = progress.snapshot();
        let (Some(action), Some(started)) = (&snapshot.current, snapshot.current_started) else {
            continue;
        };
        let elapsed = started.elapsed();
        if elapsed >= limit && warned_step != Some(snapshot.applied) {
            warned_step = Some(snapshot.applied);
            warn!(
                step = snapshot.applied + 1,
                total = snapshot.total,
                action = %action,
                elapsed_secs = elapsed.as_secs(),
                "Action is taking longer than the watchdog limit; still waiting"
            );
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> ReconcileError {
    ReconcileError::Internal(format!("background task failed: {}", err))
}
