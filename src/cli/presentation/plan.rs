//! Plan, apply and validate formatters.

use super::{to_json, Style};
use crate::descriptor::LoadedDescriptor;
use crate::error::ReconcileError;
use crate::generation::Generation;
use crate::reconcile::{ApplyOutcome, ApplyReport, Plan};
use crate::types::{hash_hex, short_hash};
use serde_json::json;

pub fn format_plan_text(plan: &Plan, style: Style) -> String {
    let mut out = format!(
        "{}\n  Descriptor: {}\n  State hash: {}\n  Active generation: {}",
        style.heading("Plan"),
        plan.descriptor.origin,
        short_hash(&plan.descriptor.hash),
        plan.active
            .as_ref()
            .map(|g| g.id.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );

    if plan.actions.is_empty() {
        out.push_str(&format!(
            "\n\n{}",
            style.ok("No changes. The host matches the descriptor.")
        ));
    } else {
        out.push_str(&format!("\n\nActions ({}):", plan.actions.len()));
        for (i, action) in plan.actions.iter().enumerate() {
            out.push_str(&format!("\n  {:>3}. {}", i + 1, style.action(action)));
        }
    }

    push_warnings(&mut out, plan.warnings.iter().map(|w| w.to_string()), style);
    out
}

pub fn format_plan_json(plan: &Plan) -> Result<String, ReconcileError> {
    let warnings: Vec<String> = plan.warnings.iter().map(|w| w.to_string()).collect();
    to_json(&json!({
        "descriptor": plan.descriptor.origin,
        "state_hash": hash_hex(&plan.descriptor.hash),
        "active_generation": plan.active.as_ref().map(|g| g.id),
        "host": plan.facts,
        "actions": plan.actions,
        "warnings": warnings,
    }))
}

pub fn format_apply_result(report: &ApplyReport, style: Style) -> String {
    let mut out = match &report.outcome {
        ApplyOutcome::Unchanged { active } => style.ok(&format!(
            "Host already converged; generation {} remains active.",
            active
        )),
        ApplyOutcome::Committed(generation) => committed(generation, style),
    };
    push_warnings(&mut out, report.warnings.iter().map(|w| w.to_string()), style);
    out
}

pub fn format_rollback_result(generation: &Generation, style: Style) -> String {
    committed(generation, style)
}

fn committed(generation: &Generation, style: Style) -> String {
    let mut out = style.ok(&format!(
        "Generation {} committed ({}); {} action(s) applied.",
        generation.id,
        generation.origin,
        generation.actions.len()
    ));
    for action in &generation.actions {
        out.push_str(&format!("\n  - {}", style.action(action)));
    }
    out
}

pub fn format_validate_result(loaded: &LoadedDescriptor) -> String {
    let state = &loaded.state;
    format!(
        "Descriptor is valid: {}\n  State hash: {}\n  Drivers: {}\n  Users: {}\n  Services: {}\n  Packages: {}\n  Files: {}\n  Environment: {}",
        loaded.origin,
        hash_hex(&loaded.hash),
        state.drivers.len(),
        state.users.len(),
        state.services.len(),
        state.packages.len(),
        state.files.len(),
        state.environment.len(),
    )
}

fn push_warnings(out: &mut String, warnings: impl Iterator<Item = String>, style: Style) {
    let warnings: Vec<String> = warnings.collect();
    if warnings.is_empty() {
        return;
    }
    out.push_str(&format!(
        "\n\n{}",
        style.warning(&format!("Warnings ({}):", warnings.len()))
    ));
    for warning in warnings {
        out.push_str(&format!("\n  - {}", warning));
    }
}
