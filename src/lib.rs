//! hostform: Declarative Single-Host Reconciliation
//!
//! Converges one machine to a descriptor of its desired state (boot settings,
//! drivers, network, users, services, packages, files and environment) and
//! records every successful convergence as an immutable generation that can
//! be rolled back to.

pub mod action;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod diff;
pub mod error;
pub mod executor;
pub mod generation;
pub mod host;
pub mod logging;
pub mod observed;
pub mod probe;
pub mod reconcile;
pub mod subsystem;
pub mod types;
