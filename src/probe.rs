//! State Prober
//!
//! Queries the host one subsystem at a time. A probe that fails, or that does
//! not apply to this host, never fails the run: every field it was meant to
//! observe is recorded as `Unknown` and a warning is reported alongside the
//! observed state.

use crate::error::ProbeError;
use crate::host::HostBackend;
use crate::observed::{
    HostFacts, Observed, ObservedBoot, ObservedDriver, ObservedNetwork, ObservedState, ProbeScope,
};
use crate::subsystem::Subsystem;
use std::sync::Arc;
use tracing::{debug, warn};

/// Observes one subsystem of the host.
pub trait SubsystemProbe: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    /// Whether this probe can run on the given host at all.
    fn applies_to(&self, _facts: &HostFacts) -> bool {
        true
    }

    /// Fill in the in-scope fields of this probe's subsystem.
    fn probe(&self, scope: &ProbeScope, observed: &mut ObservedState) -> Result<(), ProbeError>;
}

/// Observed state plus every probe failure absorbed along the way.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub observed: ObservedState,
    pub warnings: Vec<ProbeError>,
}

impl ProbeReport {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Runs one registered probe per subsystem.
#[derive(Clone, Default)]
pub struct StateProber {
    probes: Vec<Arc<dyn SubsystemProbe>>,
}

impl StateProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// One probe per subsystem, all backed by `backend`.
    pub fn for_backend(backend: Arc<dyn HostBackend>) -> Self {
        let mut prober = Self::new();
        for subsystem in Subsystem::ALL {
            prober = prober.with_probe(Arc::new(BackendProbe {
                backend: Arc::clone(&backend),
                subsystem,
            }));
        }
        prober
    }

    /// Register a probe, replacing any earlier one for the same subsystem.
    pub fn with_probe(mut self, probe: Arc<dyn SubsystemProbe>) -> Self {
        self.probes.retain(|p| p.subsystem() != probe.subsystem());
        self.probes.push(probe);
        self
    }

    fn probe_for(&self, subsystem: Subsystem) -> Option<&Arc<dyn SubsystemProbe>> {
        self.probes.iter().find(|p| p.subsystem() == subsystem)
    }

    /// Probe every subsystem for the names in `scope`.
    pub fn probe(&self, scope: &ProbeScope, facts: &HostFacts) -> ProbeReport {
        let mut report = ProbeReport::default();

        for subsystem in Subsystem::ALL {
            let outcome = match self.probe_for(subsystem) {
                None => Err(ProbeError {
                    subsystem,
                    cause: "no probe registered".to_string(),
                }),
                Some(probe) if !probe.applies_to(facts) => Err(ProbeError {
                    subsystem,
                    cause: format!(
                        "probe does not apply to host {} ({})",
                        facts.hostname, facts.arch
                    ),
                }),
                Some(probe) => probe.probe(scope, &mut report.observed),
            };

            match outcome {
                Ok(()) => debug!(subsystem = %subsystem, "Subsystem probed"),
                Err(err) => {
                    warn!(
                        subsystem = %subsystem,
                        cause = %err.cause,
                        "Probe failed; in-scope fields marked unknown"
                    );
                    mark_unknown(subsystem, scope, &mut report.observed, &err.cause);
                    report.warnings.push(err);
                }
            }
        }

        report
    }
}

/// Overwrite every in-scope field of `subsystem` with `Unknown`.
pub fn mark_unknown(
    subsystem: Subsystem,
    scope: &ProbeScope,
    observed: &mut ObservedState,
    reason: &str,
) {
    match subsystem {
        Subsystem::Boot => {
            observed.boot = ObservedBoot {
                loader: Observed::unknown(reason),
                kernel_params: Observed::unknown(reason),
                kernel_modules: Observed::unknown(reason),
                timeout_secs: Observed::unknown(reason),
            };
        }
        Subsystem::Drivers => {
            for (name, package) in &scope.drivers {
                observed
                    .drivers
                    .insert(name.clone(), ObservedDriver::unknown(package.clone(), reason));
            }
        }
        Subsystem::Network => {
            observed.network = ObservedNetwork {
                hostname: Observed::unknown(reason),
                firewall_enabled: Observed::unknown(reason),
                allowed_tcp_ports: Observed::unknown(reason),
                allowed_udp_ports: Observed::unknown(reason),
            };
        }
        Subsystem::Users => {
            for name in scope.users.keys() {
                observed
                    .users
                    .insert(name.clone(), Observed::unknown(reason));
            }
        }
        Subsystem::Services => {
            for name in scope.services.keys() {
                observed
                    .services
                    .insert(name.clone(), Observed::unknown(reason));
            }
        }
        Subsystem::Packages => {
            for name in &scope.packages {
                observed
                    .packages
                    .insert(name.clone(), Observed::unknown(reason));
            }
        }
        Subsystem::Files => {
            for path in &scope.files {
                observed
                    .files
                    .insert(path.clone(), Observed::unknown(reason));
            }
        }
        Subsystem::Environment => {
            for name in &scope.environment {
                observed
                    .environment
                    .insert(name.clone(), Observed::unknown(reason));
            }
        }
    }
}

/// Adapts a host backend to the per-subsystem probe interface.
struct BackendProbe {
    backend: Arc<dyn HostBackend>,
    subsystem: Subsystem,
}

impl SubsystemProbe for BackendProbe {
    fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    fn applies_to(&self, facts: &HostFacts) -> bool {
        self.backend.supports(self.subsystem, facts)
    }

    fn probe(&self, scope: &ProbeScope, observed: &mut ObservedState) -> Result<(), ProbeError> {
        self.backend.probe_subsystem(self.subsystem, scope, observed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_descriptor;

    struct FixedPackages {
        installed: Vec<&'static str>,
    }

    impl SubsystemProbe for FixedPackages {
        fn subsystem(&self) -> Subsystem {
            Subsystem::Packages
        }

        fn probe(
            &self,
            scope: &ProbeScope,
            observed: &mut ObservedState,
        ) -> Result<(), ProbeError> {
            for name in &scope.packages {
                observed.packages.insert(
                    name.clone(),
                    Observed::Known(self.installed.contains(&name.as_str())),
                );
            }
            Ok(())
        }
    }

    struct BrokenServices;

    impl SubsystemProbe for BrokenServices {
        fn subsystem(&self) -> Subsystem {
            Subsystem::Services
        }

        fn probe(
            &self,
            _scope: &ProbeScope,
            _observed: &mut ObservedState,
        ) -> Result<(), ProbeError> {
            Err(ProbeError {
                subsystem: Subsystem::Services,
                cause: "service manager unreachable".to_string(),
            })
        }
    }

    struct X86Only;

    impl SubsystemProbe for X86Only {
        fn subsystem(&self) -> Subsystem {
            Subsystem::Drivers
        }

        fn applies_to(&self, facts: &HostFacts) -> bool {
            facts.arch == "x86_64"
        }

        fn probe(
            &self,
            _scope: &ProbeScope,
            _observed: &mut ObservedState,
        ) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn facts(arch: &str) -> HostFacts {
        HostFacts {
            hostname: "ws".to_string(),
            arch: arch.to_string(),
        }
    }

    fn scope() -> ProbeScope {
        let state = parse_descriptor(
            r#"
packages = ["git", "ollama"]

[drivers.nvidia]
package = "nvidia-open"

[services.ollama]
package = "ollama"
"#,
            "test",
        )
        .unwrap()
        .state;
        ProbeScope::from_states([&state])
    }

    #[test]
    fn test_failed_probe_marks_scope_unknown() {
        let prober = StateProber::new()
            .with_probe(Arc::new(FixedPackages {
                installed: vec!["git"],
            }))
            .with_probe(Arc::new(BrokenServices));

        let report = prober.probe(&scope(), &facts("x86_64"));
        assert!(report.observed.services["ollama"].is_unknown());
        assert_eq!(report.observed.packages["git"], Observed::Known(true));
        assert_eq!(report.observed.packages["ollama"], Observed::Known(false));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.subsystem == Subsystem::Services));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_missing_probe_is_a_warning() {
        let report = StateProber::new().probe(&scope(), &facts("x86_64"));
        assert_eq!(report.warnings.len(), Subsystem::ALL.len());
        assert!(report.observed.boot.loader.is_unknown());
    }

    #[test]
    fn test_non_applicable_probe_marks_unknown() {
        let prober = StateProber::new().with_probe(Arc::new(X86Only));

        let report = prober.probe(&scope(), &facts("aarch64"));
        assert!(report.observed.drivers["nvidia"].installed.is_unknown());
        assert_eq!(report.observed.drivers["nvidia"].package, "nvidia-open");

        let report = prober.probe(&scope(), &facts("x86_64"));
        assert!(!report
            .warnings
            .iter()
            .any(|w| w.subsystem == Subsystem::Drivers));
    }

    #[test]
    fn test_later_probe_replaces_earlier() {
        let prober = StateProber::new()
            .with_probe(Arc::new(FixedPackages { installed: vec![] }))
            .with_probe(Arc::new(FixedPackages {
                installed: vec!["git", "ollama"],
            }));
        let report = prober.probe(&scope(), &facts("x86_64"));
        assert_eq!(report.observed.packages["ollama"], Observed::Known(true));
    }
}
