//! CLI domain: parse, route, help, output, and presentation only.
//! No reconciliation logic; a single route table dispatches to the reconciler
//! and the generation store.

mod help;
mod output;
mod parse;
mod presentation;
mod route;

pub use help::{command_name, mutates_host};
pub use output::{
    exit_code, map_error, EXIT_ACTION, EXIT_CANCELLED, EXIT_CONFIG, EXIT_INTERNAL, EXIT_LOCKED,
    EXIT_PARSE, EXIT_STORAGE, EXIT_UNKNOWN_GENERATION, EXIT_VALIDATION,
};
pub use parse::{Cli, Commands};
pub use presentation::Style;
pub use route::RunContext;
