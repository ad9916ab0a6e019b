//! Tests for intercom-orchestrator: assignment, completion, queueing, persistence

use intercom_core::{
    Error, InstanceKey, InstanceStatus, ManualClock, OrchestratorConfig, RegistryConfig,
    TaskStatus,
};
use intercom_orchestrator::*;
use intercom_registry::ServiceRegistry;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn setup() -> (TaskOrchestrator, Arc<ServiceRegistry>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let registry = Arc::new(ServiceRegistry::with_clock(
        &RegistryConfig::default(),
        clock.clone(),
    ));
    (TaskOrchestrator::new(registry.clone()), registry, clock)
}

fn register(registry: &ServiceRegistry, service: &str, id: &str, caps: &[&str]) {
    let meta = json!({ "capabilities": caps });
    registry
        .register(service, id, "localhost", 9001, meta.as_object().cloned().unwrap())
        .unwrap();
}

fn status(registry: &ServiceRegistry, service: &str, id: &str) -> InstanceStatus {
    registry.get(service, id).unwrap().status
}

// ===========================================================================
// assignment
// ===========================================================================

#[test]
fn build_worker_round_trip() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);

    assert_eq!(
        orch.assign_task("t1", "build", json!({}), None).unwrap().as_deref(),
        Some("w1")
    );
    assert_eq!(status(&registry, "build", "w1"), InstanceStatus::Busy);

    assert!(orch.complete_task("w1", "t1", json!({"ok": true})).unwrap());
    let w1 = registry.get("build", "w1").unwrap();
    assert_eq!(w1.status, InstanceStatus::Idle);
    assert_eq!(w1.completed_tasks, 1);

    assert_eq!(
        orch.assign_task("t2", "build", json!({}), None).unwrap().as_deref(),
        Some("w1")
    );
}

#[test]
fn least_loaded_instance_wins() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    register(&registry, "build", "w2", &["build"]);
    let w1 = InstanceKey::new("build", "w1");
    let w2 = InstanceKey::new("build", "w2");
    for _ in 0..5 {
        registry.record_completion(&w1).unwrap();
    }
    for _ in 0..3 {
        registry.record_completion(&w2).unwrap();
    }

    assert_eq!(
        orch.assign_task("t1", "build", json!({}), None).unwrap().as_deref(),
        Some("w2")
    );
}

#[test]
fn ties_break_by_service_then_instance() {
    let (orch, registry, _) = setup();
    register(&registry, "zeta", "a", &["render"]);
    register(&registry, "alpha", "b", &["render"]);
    register(&registry, "alpha", "a", &["render"]);

    let picked = orch.assign_task("t1", "render", json!(null), None).unwrap();
    assert_eq!(picked.as_deref(), Some("a"));
    assert_eq!(status(&registry, "alpha", "a"), InstanceStatus::Busy);
    assert_eq!(status(&registry, "zeta", "a"), InstanceStatus::Idle);
}

#[test]
fn capability_must_match() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    register(&registry, "tests", "w2", &["test", "lint"]);

    assert_eq!(
        orch.assign_task("t1", "lint", json!({}), None).unwrap().as_deref(),
        Some("w2")
    );
    assert_eq!(orch.assign_task("t2", "deploy", json!({}), None).unwrap(), None);
}

#[test]
fn preferred_instance_used_when_available() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    register(&registry, "build", "w2", &["build"]);
    registry
        .record_completion(&InstanceKey::new("build", "w2"))
        .unwrap();

    let picked = orch
        .assign_task("t1", "build", json!({}), Some("w2"))
        .unwrap();
    assert_eq!(picked.as_deref(), Some("w2"));
}

#[test]
fn busy_preferred_instance_falls_back() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    register(&registry, "build", "w2", &["build"]);

    orch.assign_task("t1", "build", json!({}), Some("w1")).unwrap();
    let picked = orch
        .assign_task("t2", "build", json!({}), Some("w1"))
        .unwrap();
    assert_eq!(picked.as_deref(), Some("w2"));
}

#[test]
fn stale_instances_are_skipped() {
    let (orch, registry, clock) = setup();
    register(&registry, "build", "old", &["build"]);
    clock.advance(Duration::from_secs(20));
    register(&registry, "build", "new", &["build"]);
    clock.advance(Duration::from_secs(15));

    assert_eq!(
        orch.assign_task("t1", "build", json!({}), None).unwrap().as_deref(),
        Some("new")
    );
}

#[test]
fn duplicate_task_id_rejected() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);

    orch.assign_task("t1", "build", json!({}), None).unwrap();
    assert!(matches!(
        orch.assign_task("t1", "build", json!({}), None),
        Err(Error::DuplicateTask(id)) if id == "t1"
    ));

    orch.complete_task("w1", "t1", json!(1)).unwrap();
    assert!(matches!(
        orch.assign_task("t1", "build", json!({}), None),
        Err(Error::DuplicateTask(_))
    ));
}

#[test]
fn empty_task_id_rejected() {
    let (orch, _, _) = setup();
    assert!(matches!(
        orch.assign_task("", "build", json!({}), None),
        Err(Error::InvalidRequest(_))
    ));
}

// ===========================================================================
// queueing
// ===========================================================================

#[test]
fn unmatched_task_waits_for_new_instance() {
    let (orch, registry, _) = setup();

    assert_eq!(orch.assign_task("t1", "build", json!({}), None).unwrap(), None);
    assert_eq!(orch.pending(), vec!["t1"]);
    assert_eq!(orch.task("t1").unwrap().status, TaskStatus::Pending);

    assert!(orch.dispatch_pending().is_empty());

    register(&registry, "build", "w1", &["build"]);
    assert_eq!(
        orch.dispatch_pending(),
        vec![("t1".to_string(), "w1".to_string())]
    );
    assert!(orch.pending().is_empty());
    let task = orch.task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_instance, Some(InstanceKey::new("build", "w1")));
}

#[test]
fn completion_dispatches_pending_in_order() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);

    orch.assign_task("t1", "build", json!({}), None).unwrap();
    assert_eq!(orch.assign_task("t2", "build", json!({}), None).unwrap(), None);
    assert_eq!(orch.assign_task("t3", "build", json!({}), None).unwrap(), None);
    assert_eq!(orch.pending(), vec!["t2", "t3"]);

    orch.complete_task("w1", "t1", json!({})).unwrap();
    assert_eq!(orch.pending(), vec!["t3"]);
    assert_eq!(orch.task("t2").unwrap().status, TaskStatus::Assigned);
    assert_eq!(status(&registry, "build", "w1"), InstanceStatus::Busy);

    orch.fail_task("w1", "t2", "disk full").unwrap();
    assert!(orch.pending().is_empty());
    assert_eq!(orch.task("t3").unwrap().status, TaskStatus::Assigned);
}

// ===========================================================================
// completion and failure
// ===========================================================================

#[test]
fn completion_records_result() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    orch.assign_task("t1", "build", json!({"n": 1}), None).unwrap();

    orch.complete_task("w1", "t1", json!({"ok": true})).unwrap();
    let task = orch.task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({"ok": true})));
    assert!(orch.active().is_empty());
    assert_eq!(orch.history().len(), 1);
}

#[test]
fn wrong_instance_cannot_complete() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    register(&registry, "build", "w2", &["build"]);
    orch.assign_task("t1", "build", json!({}), Some("w1")).unwrap();

    assert!(!orch.complete_task("w2", "t1", json!({})).unwrap());
    assert_eq!(orch.task("t1").unwrap().status, TaskStatus::Assigned);
    assert_eq!(status(&registry, "build", "w1"), InstanceStatus::Busy);
}

#[test]
fn pending_task_cannot_complete() {
    let (orch, _, _) = setup();
    orch.assign_task("t1", "build", json!({}), None).unwrap();
    assert!(!orch.complete_task("w1", "t1", json!({})).unwrap());
    assert_eq!(orch.pending(), vec!["t1"]);
}

#[test]
fn unknown_task_is_not_found() {
    let (orch, _, _) = setup();
    let err = orch.complete_task("w1", "nope", json!({})).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn finished_task_cannot_finish_twice() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    orch.assign_task("t1", "build", json!({}), None).unwrap();

    assert!(orch.complete_task("w1", "t1", json!({})).unwrap());
    assert!(!orch.complete_task("w1", "t1", json!({})).unwrap());
    assert!(!orch.fail_task("w1", "t1", "late").unwrap());
    assert_eq!(registry.get("build", "w1").unwrap().completed_tasks, 1);
}

#[test]
fn failure_is_terminal_and_not_counted() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    orch.assign_task("t1", "build", json!({}), None).unwrap();

    assert!(orch.fail_task("w1", "t1", "compiler crashed").unwrap());
    let task = orch.task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("compiler crashed"));

    let w1 = registry.get("build", "w1").unwrap();
    assert_eq!(w1.status, InstanceStatus::Idle);
    assert_eq!(w1.completed_tasks, 0);
    assert!(orch.pending().is_empty());
}

#[test]
fn completion_survives_deregistered_instance() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    orch.assign_task("t1", "build", json!({}), None).unwrap();
    registry.deregister("build", "w1");

    assert!(orch.complete_task("w1", "t1", json!({})).unwrap());
    assert_eq!(orch.task("t1").unwrap().status, TaskStatus::Completed);
}

#[test]
fn history_is_bounded() {
    let (orch, registry, _) = setup();
    let orch = orch.with_history_limit(2);
    register(&registry, "build", "w1", &["build"]);

    for i in 0..4 {
        let id = format!("t{}", i);
        orch.assign_task(&id, "build", json!({}), None).unwrap();
        orch.complete_task("w1", &id, json!({})).unwrap();
    }
    let kept: Vec<String> = orch.history().into_iter().map(|t| t.task_id).collect();
    assert_eq!(kept, vec!["t2", "t3"]);
    assert!(orch.task("t0").is_none());
}

// ===========================================================================
// persistence
// ===========================================================================

#[derive(Default)]
struct RecordingHook {
    snapshots: Mutex<Vec<OrchestratorSnapshot>>,
}

impl PersistenceHook for RecordingHook {
    fn persist(&self, snapshot: &OrchestratorSnapshot) -> intercom_core::Result<()> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

struct FailingHook;

impl PersistenceHook for FailingHook {
    fn persist(&self, _: &OrchestratorSnapshot) -> intercom_core::Result<()> {
        Err(Error::IoError(std::io::Error::other("read-only filesystem")))
    }
}

#[test]
fn hook_sees_every_change() {
    let (orch, registry, _) = setup();
    let hook = Arc::new(RecordingHook::default());
    let orch = orch.with_persistence(hook.clone());
    register(&registry, "build", "w1", &["build"]);

    orch.assign_task("t1", "build", json!({}), None).unwrap();
    orch.assign_task("t2", "build", json!({}), None).unwrap();
    orch.complete_task("w1", "t1", json!({})).unwrap();

    let snapshots = hook.snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots[1].pending, vec!["t2"]);
    let last = snapshots.last().unwrap();
    assert!(last.pending.is_empty());
    assert_eq!(last.active.len(), 1);
    assert_eq!(last.history[0].task_id, "t1");
}

#[test]
fn hook_failure_does_not_fail_operation() {
    let (orch, registry, _) = setup();
    let orch = orch.with_persistence(Arc::new(FailingHook));
    register(&registry, "build", "w1", &["build"]);

    assert!(orch.assign_task("t1", "build", json!({}), None).unwrap().is_some());
    assert!(orch.complete_task("w1", "t1", json!({})).unwrap());
}

#[test]
fn json_snapshot_restores_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig {
        snapshot_path: Some(dir.path().join("state").join("tasks.json")),
        ..Default::default()
    };

    let (_, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    {
        let orch = TaskOrchestrator::from_config(registry.clone(), &config).unwrap();
        orch.assign_task("t1", "build", json!({"step": 1}), None).unwrap();
        orch.assign_task("t2", "build", json!({"step": 2}), None).unwrap();
    }

    // Fresh registry: w1 re-registers idle and must come back busy.
    let (_, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    let orch = TaskOrchestrator::from_config(registry.clone(), &config).unwrap();

    assert_eq!(orch.task("t1").unwrap().status, TaskStatus::Assigned);
    assert_eq!(orch.pending(), vec!["t2"]);
    assert_eq!(status(&registry, "build", "w1"), InstanceStatus::Busy);

    assert!(orch.complete_task("w1", "t1", json!({})).unwrap());
    assert_eq!(orch.task("t2").unwrap().status, TaskStatus::Assigned);
}

#[test]
fn snapshot_and_restore_match() {
    let (orch, registry, _) = setup();
    register(&registry, "build", "w1", &["build"]);
    orch.assign_task("t1", "build", json!({}), None).unwrap();
    orch.assign_task("t2", "build", json!({}), None).unwrap();
    let snapshot = orch.snapshot();

    let (other, _, _) = setup();
    other.restore(snapshot.clone());
    assert_eq!(other.active(), snapshot.active);
    assert_eq!(other.pending(), snapshot.pending);
}
