//! Integration tests for the hostform reconciler

mod cli_commands;
mod config_layering;
mod reconcile_flow;
mod test_utils;
