//! CLI presentation: text and json formatters per command family.

mod history;
mod plan;
mod style;

pub use history::{
    format_gc_result, format_generation_json, format_generation_text, format_generations_json,
    format_generations_text, format_runs_json, format_runs_text,
};
pub use plan::{
    format_apply_result, format_plan_json, format_plan_text, format_rollback_result,
    format_validate_result,
};
pub use style::Style;

use crate::error::ReconcileError;
use serde::Serialize;

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, ReconcileError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ReconcileError::Internal(format!("Failed to render JSON: {}", e)))
}
