//! Subsystems and the explicit dependency graph that orders them.
//!
//! Actions are applied subsystem by subsystem. The order is not taken from
//! where sections happen to appear in a descriptor; it comes from the edges
//! declared here, topologically sorted with a fixed tie-break so the result
//! never changes between runs.

use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A slice of host state that is probed and diffed as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Boot,
    Drivers,
    Network,
    Users,
    Services,
    Packages,
    Files,
    Environment,
}

impl Subsystem {
    pub const ALL: [Subsystem; 8] = [
        Subsystem::Boot,
        Subsystem::Drivers,
        Subsystem::Network,
        Subsystem::Users,
        Subsystem::Services,
        Subsystem::Packages,
        Subsystem::Files,
        Subsystem::Environment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Boot => "boot",
            Subsystem::Drivers => "drivers",
            Subsystem::Network => "network",
            Subsystem::Users => "users",
            Subsystem::Services => "services",
            Subsystem::Packages => "packages",
            Subsystem::Files => "files",
            Subsystem::Environment => "environment",
        }
    }

    /// Hardware-specific subsystems. They share the single dependency graph
    /// with policy subsystems.
    pub fn is_hardware_specific(self) -> bool {
        matches!(self, Subsystem::Boot | Subsystem::Drivers)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed "must run before" edges between subsystems.
#[derive(Debug, Clone)]
pub struct SubsystemGraph {
    edges: BTreeSet<(Subsystem, Subsystem)>,
}

impl Default for SubsystemGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl SubsystemGraph {
    /// Empty graph: every subsystem is independent.
    pub fn empty() -> Self {
        Self {
            edges: BTreeSet::new(),
        }
    }

    /// kernel/boot -> drivers -> services -> user-level packages -> environment,
    /// with network and users slotted before the services that bind ports or
    /// run as accounts, and managed files before the environment that may
    /// reference them.
    pub fn standard() -> Self {
        Self::empty()
            .with_edge(Subsystem::Boot, Subsystem::Drivers)
            .with_edge(Subsystem::Drivers, Subsystem::Network)
            .with_edge(Subsystem::Drivers, Subsystem::Services)
            .with_edge(Subsystem::Network, Subsystem::Users)
            .with_edge(Subsystem::Network, Subsystem::Services)
            .with_edge(Subsystem::Users, Subsystem::Services)
            .with_edge(Subsystem::Services, Subsystem::Packages)
            .with_edge(Subsystem::Packages, Subsystem::Files)
            .with_edge(Subsystem::Files, Subsystem::Environment)
    }

    pub fn with_edge(mut self, before: Subsystem, after: Subsystem) -> Self {
        self.edges.insert((before, after));
        self
    }

    pub fn depends_on(&self, subsystem: Subsystem, dependency: Subsystem) -> bool {
        self.edges.contains(&(dependency, subsystem))
    }

    /// Kahn's algorithm. Among subsystems that are ready at the same time the
    /// one declared first in `Subsystem::ALL` wins.
    pub fn topological_order(&self) -> Result<Vec<Subsystem>, GraphError> {
        let mut remaining: BTreeSet<Subsystem> = Subsystem::ALL.iter().copied().collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready = remaining.iter().copied().find(|candidate| {
                !self
                    .edges
                    .iter()
                    .any(|(before, after)| after == candidate && remaining.contains(before))
            });
            match ready {
                Some(next) => {
                    remaining.remove(&next);
                    order.push(next);
                }
                None => return Err(GraphError::Cycle(remaining.into_iter().collect())),
            }
        }

        Ok(order)
    }

    /// Position of every subsystem in the sorted order, indexed by `Subsystem as usize`.
    pub fn ranks(&self) -> Result<[usize; 8], GraphError> {
        let order = self.topological_order()?;
        let mut ranks = [0usize; 8];
        for (rank, subsystem) in order.into_iter().enumerate() {
            ranks[subsystem as usize] = rank;
        }
        Ok(ranks)
    }
}
