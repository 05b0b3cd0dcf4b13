//! Diff Engine
//!
//! Pure function from (desired, observed) to an ordered action sequence.
//! Neither input is mutated and the host is never consulted: the observed
//! state is a snapshot taken before diffing starts.
//!
//! Ordering, outermost first:
//! 1. subsystem rank from the dependency graph
//! 2. declared entries before undeclared ones (removals)
//! 3. declaration index of the entry
//! 4. phase within the entry (create/enable, then configure, then memberships)
//! 5. declaration index within the entry
//! 6. target, lexically
//!
//! Identical inputs therefore always yield byte-identical sequences.

mod subsystems;

use crate::action::Action;
use crate::descriptor::DesiredState;
use crate::error::GraphError;
use crate::observed::ObservedState;
use crate::subsystem::{Subsystem, SubsystemGraph};

/// Sort position of a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Declared {
    /// Declared in the desired state at this index.
    At(usize),
    /// Only present on the host; sorted after everything declared.
    Undeclared,
}

#[derive(Debug, Clone)]
pub(crate) struct Planned {
    pub declared: Declared,
    pub phase: u8,
    pub minor: usize,
    pub action: Action,
}

impl Planned {
    pub fn new(declared: Declared, phase: u8, minor: usize, action: Action) -> Self {
        Self {
            declared,
            phase,
            minor,
            action,
        }
    }
}

/// Diff engine bound to a subsystem ordering.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    ranks: [usize; 8],
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::standard()
    }
}

impl DiffEngine {
    pub fn new(graph: &SubsystemGraph) -> Result<Self, GraphError> {
        Ok(Self {
            ranks: graph.ranks()?,
        })
    }

    /// Engine using the standard subsystem graph.
    pub fn standard() -> Self {
        // The standard graph is acyclic and sorts to declaration order.
        let ranks = SubsystemGraph::standard()
            .ranks()
            .unwrap_or([0, 1, 2, 3, 4, 5, 6, 7]);
        Self { ranks }
    }

    fn rank(&self, subsystem: Subsystem) -> usize {
        self.ranks[subsystem as usize]
    }

    /// Compute the ordered actions converging `observed` to `desired`.
    pub fn diff(&self, desired: &DesiredState, observed: &ObservedState) -> Vec<Action> {
        let mut planned = Vec::new();
        subsystems::diff_boot(desired, observed, &mut planned);
        subsystems::diff_drivers(desired, observed, &mut planned);
        subsystems::diff_network(desired, observed, &mut planned);
        subsystems::diff_users(desired, observed, &mut planned);
        subsystems::diff_services(desired, observed, &mut planned);
        subsystems::diff_packages(desired, observed, &mut planned);
        subsystems::diff_files(desired, observed, &mut planned);
        subsystems::diff_environment(desired, observed, &mut planned);

        planned.sort_by(|a, b| {
            (
                self.rank(a.action.subsystem),
                a.declared,
                a.phase,
                a.minor,
                &a.action.target,
                a.action.kind,
            )
                .cmp(&(
                    self.rank(b.action.subsystem),
                    b.declared,
                    b.phase,
                    b.minor,
                    &b.action.target,
                    b.action.kind,
                ))
        });

        planned.into_iter().map(|p| p.action).collect()
    }
}

/// Diff with the standard subsystem ordering.
pub fn diff(desired: &DesiredState, observed: &ObservedState) -> Vec<Action> {
    DiffEngine::standard().diff(desired, observed)
}
