//! CLI parse: clap types for hostform. No behavior; definitions only.

use crate::types::GenerationId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// hostform - declarative single-host reconciliation with generations
#[derive(Debug, Parser)]
#[command(name = "hostform", version)]
#[command(about = "Converge this host to a declarative descriptor and keep rollback-able generations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Descriptor file (overrides the configured descriptor)
    #[arg(long, global = true)]
    pub descriptor: Option<PathBuf>,

    /// Configuration file path (overrides default config loading)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Generation store directory (overrides storage.store_path)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr)
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Converge the host to the descriptor and commit a generation
    Apply,
    /// Show the actions apply would take, without changing anything
    Diff {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Converge the host back to a previous generation's state
    Rollback {
        /// Generation to return to
        generation: GenerationId,
    },
    /// List committed generations, newest first
    ListGenerations {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
        /// Show at most this many generations
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one generation with its actions and desired state
    Show {
        generation: GenerationId,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List failed and cancelled runs, newest first
    Runs {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
        /// Show at most this many runs
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete old generations, keeping the newest N and the active one
    Gc {
        /// Number of generations to keep
        #[arg(long)]
        keep: usize,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the descriptor without probing the host
    Validate,
}
