//! CLI help and command-name contract for logging.

use crate::cli::parse::Commands;

/// Command name as logged for each invocation (e.g. "list-generations").
pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Apply => "apply",
        Commands::Diff { .. } => "diff",
        Commands::Rollback { .. } => "rollback",
        Commands::ListGenerations { .. } => "list-generations",
        Commands::Show { .. } => "show",
        Commands::Runs { .. } => "runs",
        Commands::Gc { .. } => "gc",
        Commands::Validate => "validate",
    }
}

/// Whether the command can change the host.
pub fn mutates_host(command: &Commands) -> bool {
    matches!(command, Commands::Apply | Commands::Rollback { .. })
}
