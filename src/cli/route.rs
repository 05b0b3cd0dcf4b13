//! CLI route: single route table and run context. Dispatches to the
//! reconciler, the generation store and presentation.

use crate::cli::help::{command_name, mutates_host};
use crate::cli::parse::Commands;
use crate::cli::presentation::{
    format_apply_result, format_gc_result, format_generation_json, format_generation_text,
    format_generations_json, format_generations_text, format_plan_json, format_plan_text,
    format_rollback_result, format_runs_json, format_runs_text, format_validate_result, Style,
};
use crate::config::HostformConfig;
use crate::error::ReconcileError;
use crate::executor::CancelToken;
use crate::generation::{Generation, GenerationStore};
use crate::host::build_backend;
use crate::observed::HostFacts;
use crate::reconcile::{DescriptorSource, Reconciler};
use crate::types::GenerationId;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Runtime context for CLI execution: resolved paths, configuration and the
/// cancel token wired to Ctrl-C.
pub struct RunContext {
    config: HostformConfig,
    descriptor: PathBuf,
    store_path: PathBuf,
    style: Style,
    cancel: CancelToken,
    facts: Option<HostFacts>,
}

impl RunContext {
    /// Build the context from loaded configuration. Command-line overrides
    /// for the descriptor and store resolve against `root`.
    pub fn new(
        root: &Path,
        config: HostformConfig,
        descriptor: Option<PathBuf>,
        store: Option<PathBuf>,
    ) -> Result<Self, ReconcileError> {
        config.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ReconcileError::Config(format!("Configuration validation failed:\n{}", msgs.join("\n")))
        })?;

        let descriptor = match descriptor {
            Some(path) => root.join(path),
            None => config.descriptor_path(root),
        };
        let store_path = match store {
            Some(path) => root.join(path),
            None => config.store_path(),
        };
        debug!(
            descriptor = %descriptor.display(),
            store = %store_path.display(),
            backend = ?config.backend.kind,
            "Run context resolved"
        );

        Ok(Self {
            config,
            descriptor,
            store_path,
            style: Style::plain(),
            cancel: CancelToken::new(),
            facts: None,
        })
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use fixed host facts instead of reading them from the running host.
    pub fn with_facts(mut self, facts: HostFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, ReconcileError> {
        let started = Instant::now();
        info!(
            command = command_name(command),
            mutates_host = mutates_host(command),
            "Command started"
        );
        let result = self.execute_inner(command).await;
        info!(
            command = command_name(command),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    async fn execute_inner(&self, command: &Commands) -> Result<String, ReconcileError> {
        match command {
            Commands::Apply => self.handle_apply().await,
            Commands::Diff { format } => self.handle_diff(format).await,
            Commands::Rollback { generation } => self.handle_rollback(*generation).await,
            Commands::ListGenerations { format, limit } => {
                self.handle_list_generations(format, *limit)
            }
            Commands::Show { generation, format } => self.handle_show(*generation, format),
            Commands::Runs { format, limit } => self.handle_runs(format, *limit),
            Commands::Gc { keep, force } => self.handle_gc(*keep, *force),
            Commands::Validate => self.handle_validate(),
        }
    }

    fn source(&self) -> DescriptorSource {
        DescriptorSource::File(self.descriptor.clone())
    }

    fn open_store(&self) -> Result<GenerationStore, ReconcileError> {
        Ok(GenerationStore::open(&self.store_path)?)
    }

    fn reconciler(&self) -> Result<Reconciler, ReconcileError> {
        let store = self.open_store()?;
        let backend = build_backend(&self.config.backend, &self.config.data_dir())?;
        debug!(backend = backend.name(), "Host backend ready");
        let mut reconciler = Reconciler::new(store, backend)
            .with_watchdog(self.config.reconcile.watchdog())
            .with_cancel_token(self.cancel.clone());
        if let Some(facts) = &self.facts {
            reconciler = reconciler.with_facts(facts.clone());
        }
        Ok(reconciler)
    }

    async fn handle_apply(&self) -> Result<String, ReconcileError> {
        let report = self.reconciler()?.apply(&self.source()).await?;
        Ok(format_apply_result(&report, self.style))
    }

    async fn handle_diff(&self, format: &str) -> Result<String, ReconcileError> {
        let plan = self.reconciler()?.plan(&self.source()).await?;
        match format {
            "json" => format_plan_json(&plan),
            _ => Ok(format_plan_text(&plan, self.style)),
        }
    }

    async fn handle_rollback(&self, generation: GenerationId) -> Result<String, ReconcileError> {
        let committed = self.reconciler()?.rollback(generation).await?;
        Ok(format_rollback_result(&committed, self.style))
    }

    fn handle_list_generations(
        &self,
        format: &str,
        limit: Option<usize>,
    ) -> Result<String, ReconcileError> {
        let store = self.open_store()?;
        let generations: Vec<Generation> = store
            .list()
            .take(limit.unwrap_or(usize::MAX))
            .collect::<Result<_, _>>()?;
        let active = store.active_id()?;
        match format {
            "json" => format_generations_json(&generations, active),
            _ => Ok(format_generations_text(&generations, active, self.style)),
        }
    }

    fn handle_show(&self, id: GenerationId, format: &str) -> Result<String, ReconcileError> {
        let store = self.open_store()?;
        let generation = store
            .get(id)?
            .ok_or(ReconcileError::UnknownGeneration(id))?;
        let state = store.desired_state(id)?;
        let active = store.active_id()?;
        match format {
            "json" => format_generation_json(&generation, &state, active),
            _ => format_generation_text(&generation, &state, active, self.style),
        }
    }

    fn handle_runs(&self, format: &str, limit: Option<usize>) -> Result<String, ReconcileError> {
        let mut runs = self.open_store()?.runs()?;
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        match format {
            "json" => format_runs_json(&runs),
            _ => Ok(format_runs_text(&runs, self.style)),
        }
    }

    fn handle_gc(&self, keep: usize, force: bool) -> Result<String, ReconcileError> {
        let store = self.open_store()?;
        if !force {
            use dialoguer::Confirm;
            let confirmed = Confirm::new()
                .with_prompt(format!(
                    "Delete all but the newest {} generation(s) (the active one is always kept)?",
                    keep
                ))
                .default(false)
                .interact()
                .map_err(|e| ReconcileError::Config(format!("Failed to get user input: {}", e)))?;

            if !confirmed {
                return Ok("Garbage collection cancelled".to_string());
            }
        }
        let _lock = store.lock()?;
        let report = store.gc(keep)?;
        Ok(format_gc_result(&report))
    }

    fn handle_validate(&self) -> Result<String, ReconcileError> {
        let loaded = self.source().load()?;
        Ok(format_validate_result(&loaded))
    }
}
