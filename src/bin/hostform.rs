//! hostform CLI Binary
//!
//! Command-line interface for the hostform reconciler.

use clap::Parser;
use hostform::cli::{exit_code, map_error, Cli, RunContext, Style};
use hostform::config::{ConfigLoader, HostformConfig};
use hostform::error::ReconcileError;
use hostform::executor::{CancelOutcome, CancelToken};
use hostform::logging::{init_logging, LoggingConfig};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: cannot determine current directory: {}", e);
            process::exit(hostform::cli::EXIT_INTERNAL);
        }
    };

    let config = match load_config(&cli, &root) {
        Ok(config) => config,
        Err(e) => fail(&e),
    };

    let logging_config = build_logging_config(&cli, &config.logging);
    if let Err(e) = init_logging(Some(&logging_config)) {
        fail(&e);
    }

    info!("hostform starting");

    let cancel = CancelToken::new();
    spawn_interrupt_handler(cancel.clone());

    let color = logging_config.color && std::io::stdout().is_terminal();
    let context = match RunContext::new(&root, config, cli.descriptor.clone(), cli.store.clone()) {
        Ok(ctx) => ctx
            .with_cancel_token(cancel)
            .with_style(if color { Style::colored() } else { Style::plain() }),
        Err(e) => fail(&e),
    };

    match context.execute(&cli.command).await {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            fail(&e);
        }
    }
}

fn fail(e: &ReconcileError) -> ! {
    eprintln!("{}", map_error(e));
    process::exit(exit_code(e));
}

fn load_config(cli: &Cli, root: &Path) -> Result<HostformConfig, ReconcileError> {
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(&absolute(root, path))?,
        None => ConfigLoader::load(root)?,
    };
    Ok(config)
}

fn absolute(root: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        root.join(path)
    } else {
        path.to_path_buf()
    }
}

/// First Ctrl-C requests cancellation. Once an action is running the request
/// is deferred until that action completes.
fn spawn_interrupt_handler(cancel: CancelToken) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match cancel.cancel() {
                CancelOutcome::Immediate => {
                    eprintln!("Cancelling; no further actions will be applied.");
                }
                CancelOutcome::Deferred => {
                    warn!("Cancellation deferred until the current action completes");
                    eprintln!(
                        "Cancellation requested; waiting for the current action to complete."
                    );
                }
            }
        }
    });
}

/// Build logging configuration from CLI args and the config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli, base: &LoggingConfig) -> LoggingConfig {
    let mut config = base.clone();

    if cli.quiet {
        config.enabled = false;
    }
    if cli.verbose {
        config.level = "debug".to_string();
        // Keep file logs but make verbose output visible in the terminal.
        if config.output == "file" {
            config.output = "file+stderr".to_string();
        }
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = Some(file.clone());
    }

    config
}
