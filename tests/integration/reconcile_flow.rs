//! End-to-end reconciliation through the library API: state-file and
//! in-memory hosts, real sled stores in temp directories.

use super::test_utils::workstation_fixture;
use hostform::action::{Action, ActionKind};
use hostform::error::ReconcileError;
use hostform::generation::{GenerationOrigin, GenerationStore, RunOutcome};
use hostform::host::{HostBackend, MemoryHost, StateFileHost};
use hostform::observed::HostFacts;
use hostform::reconcile::{ApplyOutcome, DescriptorSource, Reconciler};
use hostform::subsystem::Subsystem;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn facts() -> HostFacts {
    HostFacts {
        hostname: "workstation".to_string(),
        arch: "x86_64".to_string(),
    }
}

fn inline(text: &str) -> DescriptorSource {
    DescriptorSource::Inline {
        text: text.to_string(),
        origin: "inline.toml".to_string(),
    }
}

fn reconciler(dir: &TempDir, backend: Arc<dyn HostBackend>) -> Reconciler {
    let store = GenerationStore::open(&dir.path().join("store")).unwrap();
    Reconciler::new(store, backend).with_facts(facts())
}

#[tokio::test]
async fn test_workstation_converges_and_stays_converged() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(StateFileHost::new(dir.path().join("host.json")));
    let reconciler = reconciler(&dir, host.clone());
    let source = inline(&workstation_fixture());

    let first = reconciler.apply(&source).await.unwrap();
    let generation = first.generation().expect("first apply commits").clone();
    assert!(first.warnings.is_empty());
    assert_eq!(generation.origin, GenerationOrigin::Apply);

    let plan = reconciler.plan(&source).await.unwrap();
    assert!(
        plan.actions.is_empty(),
        "second plan should be empty, got {:?}",
        plan.actions
    );

    let second = reconciler.apply(&source).await.unwrap();
    assert!(matches!(
        second.outcome,
        ApplyOutcome::Unchanged { active } if active == generation.id
    ));

    let image = host.load().unwrap();
    assert!(image.packages.contains("nvidia-open"));
    assert!(image.services["ollama"].enabled);
    assert_eq!(image.users["alice"].groups, vec!["wheel", "docker", "video"]);
    assert_eq!(image.environment["EDITOR"], "nvim");
}

#[tokio::test]
async fn test_ollama_enable_then_configure() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let reconciler = reconciler(&dir, host.clone());

    reconciler
        .apply(&inline(
            "packages = [\"ollama\"]\n\n[services.ollama]\npackage = \"ollama\"\nenable = false\n",
        ))
        .await
        .unwrap();

    let plan = reconciler
        .plan(&inline(
            "packages = [\"ollama\"]\n\n[services.ollama]\npackage = \"ollama\"\n\n[services.ollama.settings]\nhost = \"0.0.0.0\"\n",
        ))
        .await
        .unwrap();
    let summary: Vec<(ActionKind, &str)> = plan
        .actions
        .iter()
        .map(|a| (a.kind, a.target.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (ActionKind::EnableService, "ollama"),
            (ActionKind::SetConfig, "ollama.host"),
        ]
    );
}

#[tokio::test]
async fn test_rollback_returns_to_earlier_state() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(StateFileHost::new(dir.path().join("host.json")));
    let reconciler = reconciler(&dir, host.clone());

    let g1 = reconciler
        .apply(&inline(&workstation_fixture()))
        .await
        .unwrap()
        .generation()
        .unwrap()
        .clone();
    let image_at_g1 = host.load().unwrap();

    reconciler
        .apply(&inline(
            "packages = [\"git\", \"tmux\"]\n\n[environment]\nEDITOR = \"vim\"\n",
        ))
        .await
        .unwrap();
    assert_ne!(host.load().unwrap(), image_at_g1);

    let rolled = reconciler.rollback(g1.id).await.unwrap();
    assert_eq!(rolled.origin, GenerationOrigin::Rollback { target: g1.id });
    assert_eq!(rolled.desired_hash, g1.desired_hash);
    assert_eq!(reconciler.store().active_id().unwrap(), Some(rolled.id));

    // The host is back to what the first generation produced, apart from
    // services it was asked to stop managing being merely disabled.
    let image = host.load().unwrap();
    assert_eq!(image.packages, image_at_g1.packages);
    assert_eq!(image.environment, image_at_g1.environment);
    assert_eq!(image.users, image_at_g1.users);
    assert_eq!(image.boot, image_at_g1.boot);

    // A rollback is itself a generation; re-applying g1's descriptor is a no-op.
    let again = reconciler
        .apply(&inline(&workstation_fixture()))
        .await
        .unwrap();
    assert!(matches!(again.outcome, ApplyOutcome::Unchanged { .. }));
}

#[tokio::test]
async fn test_failure_halts_and_is_recorded() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    host.fail_on(ActionKind::CreateUser, "alice");
    let reconciler = reconciler(&dir, host.clone());

    let err = reconciler
        .apply(&inline(&workstation_fixture()))
        .await
        .unwrap_err();
    let (applied, pending) = match err {
        ReconcileError::ActionFailed {
            error,
            applied,
            pending,
            ..
        } => {
            assert_eq!(error.kind, ActionKind::CreateUser);
            (applied, pending)
        }
        other => panic!("unexpected {:?}", other),
    };

    // Everything before the failure took effect; nothing after it was tried.
    assert_eq!(host.applied(), applied);
    assert_eq!(pending[0].kind, ActionKind::CreateUser);
    assert!(pending
        .iter()
        .any(|a: &Action| a.subsystem == Subsystem::Services));
    assert!(applied.iter().all(|a| a.subsystem != Subsystem::Services));

    assert!(reconciler.store().active().unwrap().is_none());
    let runs = reconciler.store().runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Failed);
    assert_eq!(runs[0].failed_index, Some(applied.len()));

    // Fixing the host and re-running picks up where the failure left off.
    host.clear_failure();
    let report = reconciler
        .apply(&inline(&workstation_fixture()))
        .await
        .unwrap();
    let generation = report.generation().unwrap();
    assert_eq!(generation.id, 1);
    assert_eq!(generation.actions[0].kind, ActionKind::CreateUser);
}

#[tokio::test]
async fn test_partial_probe_marks_unknown_and_converges() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    host.break_probe(Subsystem::Environment);
    let reconciler = reconciler(&dir, host.clone());

    let plan = reconciler
        .plan(&inline("packages = [\"git\"]\n\n[environment]\nEDITOR = \"nvim\"\n"))
        .await
        .unwrap();
    assert_eq!(plan.warnings.len(), 1);
    assert_eq!(plan.warnings[0].subsystem, Subsystem::Environment);
    assert!(plan
        .actions
        .iter()
        .any(|a| a.kind == ActionKind::SetEnv && a.target == "EDITOR"));

    let report = reconciler
        .apply(&inline("packages = [\"git\"]\n\n[environment]\nEDITOR = \"nvim\"\n"))
        .await
        .unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(host.image().environment["EDITOR"], "nvim");
}

#[tokio::test]
async fn test_slow_actions_outlive_the_watchdog() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    host.set_action_delay(Duration::from_millis(40));
    let reconciler = reconciler(&dir, host.clone()).with_watchdog(Duration::from_millis(5));

    let report = reconciler
        .apply(&inline("packages = [\"git\", \"htop\"]\n"))
        .await
        .unwrap();
    assert_eq!(report.generation().unwrap().actions.len(), 2);
    assert_eq!(host.applied().len(), 2);
}

#[tokio::test]
async fn test_concurrent_runs_are_serialized() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    host.set_action_delay(Duration::from_millis(400));
    let reconciler = Arc::new(reconciler(&dir, host.clone()));

    let first = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.apply(&inline("packages = [\"git\"]\n")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = reconciler.apply(&inline("packages = [\"htop\"]\n")).await;

    assert!(matches!(second, Err(ReconcileError::StoreLocked)));
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancel_during_action_stops_after_it() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    host.set_action_delay(Duration::from_millis(400));
    let reconciler = Arc::new(reconciler(&dir, host.clone()));
    let token = reconciler.cancel_token();

    let run = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            reconciler
                .apply(&inline("packages = [\"a\", \"b\", \"c\"]\n"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();

    match run.await.unwrap() {
        Err(ReconcileError::Cancelled { applied, pending }) => {
            assert_eq!(applied.len(), 1);
            assert_eq!(pending.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(host.applied().len(), 1);
    assert!(reconciler.store().active().unwrap().is_none());
    assert_eq!(reconciler.store().runs().unwrap()[0].outcome, RunOutcome::Cancelled);
}

const NVIDIA_PACKAGE: &str = "packages = [\"nvidia-open\"]\n";

fn nvidia_driver(name: &str) -> String {
    format!(
        "[drivers.{}]\npackage = \"nvidia-open\"\nkernel_modules = [\"nvidia\"]\n",
        name
    )
}

fn removes(actions: &[Action]) -> Vec<&str> {
    actions
        .iter()
        .filter(|a| a.kind == ActionKind::Remove)
        .map(|a| a.target.as_str())
        .collect()
}

#[tokio::test]
async fn test_package_moves_between_packages_and_driver() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let reconciler = reconciler(&dir, host.clone());

    reconciler.apply(&inline(NVIDIA_PACKAGE)).await.unwrap();

    let driver = inline(&nvidia_driver("nvidia"));
    let report = reconciler.apply(&driver).await.unwrap();
    let generation = report.generation().expect("driver change commits");
    assert!(removes(&generation.actions).is_empty());
    assert!(host.image().packages.contains("nvidia-open"));
    assert!(reconciler.plan(&driver).await.unwrap().actions.is_empty());

    let back = inline(NVIDIA_PACKAGE);
    let report = reconciler.apply(&back).await.unwrap();
    let generation = report.generation().expect("dropping the driver commits");
    assert!(removes(&generation.actions).is_empty());
    let image = host.image();
    assert!(image.packages.contains("nvidia-open"));
    assert!(image.driver_modules.is_empty());
    assert!(reconciler.plan(&back).await.unwrap().actions.is_empty());
}

#[tokio::test]
async fn test_renamed_driver_keeps_package_installed() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let reconciler = reconciler(&dir, host.clone());

    reconciler
        .apply(&inline(&nvidia_driver("nvidia")))
        .await
        .unwrap();
    let renamed = inline(&nvidia_driver("nv"));
    let report = reconciler.apply(&renamed).await.unwrap();
    let generation = report.generation().expect("rename commits");
    assert!(removes(&generation.actions).is_empty());

    let image = host.image();
    assert!(image.packages.contains("nvidia-open"));
    assert_eq!(image.driver_modules.keys().collect::<Vec<_>>(), vec!["nv"]);
    assert!(reconciler.plan(&renamed).await.unwrap().actions.is_empty());
}

#[tokio::test]
async fn test_rollback_across_driver_change() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let reconciler = reconciler(&dir, host.clone());

    let g1 = reconciler
        .apply(&inline(NVIDIA_PACKAGE))
        .await
        .unwrap()
        .generation()
        .unwrap()
        .clone();
    reconciler
        .apply(&inline(&nvidia_driver("nvidia")))
        .await
        .unwrap();

    let rolled = reconciler.rollback(g1.id).await.unwrap();
    assert!(removes(&rolled.actions).is_empty());
    assert!(rolled
        .actions
        .iter()
        .all(|a| a.kind != ActionKind::Install));

    let image = host.image();
    assert!(image.packages.contains("nvidia-open"));
    assert!(image.driver_modules.is_empty());
    let again = reconciler.apply(&inline(NVIDIA_PACKAGE)).await.unwrap();
    assert!(matches!(again.outcome, ApplyOutcome::Unchanged { .. }));
}

#[tokio::test]
async fn test_failed_run_leftovers_are_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    host.fail_on(ActionKind::Install, "tmux");
    let reconciler = reconciler(&dir, host.clone());

    let err = reconciler
        .apply(&inline("packages = [\"git\", \"tmux\"]\n"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::ActionFailed { .. }));
    assert!(host.image().packages.contains("git"));

    // git was installed by the failed run but is no longer wanted.
    host.clear_failure();
    let report = reconciler
        .apply(&inline("packages = [\"tmux\"]\n"))
        .await
        .unwrap();
    let generation = report.generation().unwrap();
    assert_eq!(removes(&generation.actions), vec!["git"]);
    let image = host.image();
    assert!(!image.packages.contains("git"));
    assert!(image.packages.contains("tmux"));
}
