//! Generation history, run record and gc formatters.

use super::{to_json, Style};
use crate::descriptor::DesiredState;
use crate::error::ReconcileError;
use crate::generation::{GcReport, Generation, RunRecord};
use crate::types::{hash_hex, short_hash, GenerationId};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use serde_json::json;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

pub fn format_generations_text(
    generations: &[Generation],
    active: Option<GenerationId>,
    style: Style,
) -> String {
    if generations.is_empty() {
        return "No generations recorded.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["", "ID", "Created", "State", "Actions", "Origin"]);
    for generation in generations {
        let marker = if Some(generation.id) == active { "*" } else { "" };
        table.add_row(vec![
            marker.to_string(),
            generation.id.to_string(),
            generation.created_at.format(TIME_FORMAT).to_string(),
            short_hash(&generation.desired_hash),
            generation.actions.len().to_string(),
            generation.origin.to_string(),
        ]);
    }
    format!("{}\n{}", style.heading("Generations"), table)
}

pub fn format_generations_json(
    generations: &[Generation],
    active: Option<GenerationId>,
) -> Result<String, ReconcileError> {
    to_json(&json!({
        "active": active,
        "generations": generations,
    }))
}

pub fn format_generation_text(
    generation: &Generation,
    state: &DesiredState,
    active: Option<GenerationId>,
    style: Style,
) -> Result<String, ReconcileError> {
    let mut out = format!(
        "{}\n  Parent: {}\n  Created: {}\n  State hash: {}\n  Origin: {}\n  Active: {}",
        style.heading(&format!("Generation {}", generation.id)),
        generation
            .parent
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string()),
        generation.created_at.format(TIME_FORMAT),
        hash_hex(&generation.desired_hash),
        generation.origin,
        if Some(generation.id) == active { "yes" } else { "no" },
    );
    if let Some(descriptor) = &generation.descriptor {
        out.push_str(&format!("\n  Descriptor: {}", descriptor));
    }

    out.push_str(&format!("\n\nActions ({}):", generation.actions.len()));
    for action in &generation.actions {
        out.push_str(&format!("\n  - {}", style.action(action)));
    }

    let rendered = toml::to_string_pretty(state)
        .map_err(|e| ReconcileError::Internal(format!("Failed to render state: {}", e)))?;
    out.push_str(&format!("\n\nDesired state:\n{}", rendered.trim_end()));
    Ok(out)
}

pub fn format_generation_json(
    generation: &Generation,
    state: &DesiredState,
    active: Option<GenerationId>,
) -> Result<String, ReconcileError> {
    to_json(&json!({
        "generation": generation,
        "active": Some(generation.id) == active,
        "desired_state": state,
    }))
}

pub fn format_runs_text(runs: &[RunRecord], style: Style) -> String {
    if runs.is_empty() {
        return "No failed or cancelled runs recorded.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Run", "Started", "Outcome", "Origin", "Applied", "Pending", "Error",
    ]);
    for run in runs {
        table.add_row(vec![
            run.label(),
            run.started_at.format(TIME_FORMAT).to_string(),
            run.outcome.to_string(),
            run.origin.to_string(),
            run.applied.len().to_string(),
            run.pending.len().to_string(),
            run.error.clone().unwrap_or_default(),
        ]);
    }
    format!("{}\n{}", style.heading("Runs"), table)
}

pub fn format_runs_json(runs: &[RunRecord]) -> Result<String, ReconcileError> {
    to_json(runs)
}

pub fn format_gc_result(report: &GcReport) -> String {
    if report.removed.is_empty() {
        return format!(
            "Nothing to collect; {} orphaned snapshot(s) pruned.",
            report.snapshots_pruned
        );
    }
    let ids: Vec<String> = report.removed.iter().map(|id| id.to_string()).collect();
    format!(
        "Removed {} generation(s): {}\nPruned {} snapshot(s).",
        report.removed.len(),
        ids.join(", "),
        report.snapshots_pruned
    )
}
