//! Tests for intercom-registry: register/deregister/discover/heartbeat and the reaper

use intercom_core::{Clock, Error, ManualClock, RegistryConfig};
use intercom_registry::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn registry_with_clock() -> (ServiceRegistry, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let reg = ServiceRegistry::with_clock(&RegistryConfig::default(), clock.clone());
    (reg, clock)
}

fn meta(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    v.as_object().cloned().unwrap_or_default()
}

fn ids(instances: &[intercom_core::ServiceInstance]) -> Vec<&str> {
    instances.iter().map(|i| i.instance_id.as_str()).collect()
}

// ===========================================================================
// register / deregister
// ===========================================================================

#[test]
fn register_returns_instance() {
    let (reg, clock) = registry_with_clock();
    let inst = reg
        .register("build", "w1", "localhost", 9001, meta(json!({"capabilities": ["build"]})))
        .unwrap();
    assert_eq!(inst.service_name, "build");
    assert_eq!(inst.instance_id, "w1");
    assert_eq!(inst.port, 9001);
    assert_eq!(inst.last_heartbeat, clock.now());
    assert!(inst.has_capability("build"));
    assert_eq!(reg.len(), 1);
}

#[test]
fn duplicate_registration_fails() {
    let (reg, _) = registry_with_clock();
    reg.register("build", "w1", "localhost", 9001, Default::default())
        .unwrap();
    let err = reg
        .register("build", "w1", "otherhost", 9002, Default::default())
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateInstance { .. }));
    // Original entry untouched
    assert_eq!(reg.get("build", "w1").unwrap().host, "localhost");
}

#[test]
fn same_instance_id_under_different_services_is_allowed() {
    let (reg, _) = registry_with_clock();
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    reg.register("test", "w1", "h", 2, Default::default()).unwrap();
    assert_eq!(reg.len(), 2);
}

#[test]
fn deregister_unknown_returns_false() {
    let (reg, _) = registry_with_clock();
    assert!(!reg.deregister("build", "w1"));
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    assert!(!reg.deregister("build", "w2"));
}

#[test]
fn deregister_last_instance_removes_service() {
    let (reg, _) = registry_with_clock();
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    reg.register("build", "w2", "h", 2, Default::default()).unwrap();
    assert!(reg.deregister("build", "w1"));
    assert_eq!(reg.services(), vec!["build".to_string()]);
    assert!(reg.deregister("build", "w2"));
    assert!(reg.services().is_empty());
    assert!(reg.discover("build", false).is_empty());
}

#[test]
fn discover_all_matches_live_set_after_mixed_operations() {
    let (reg, _) = registry_with_clock();
    let mut expected = BTreeSet::new();
    let ops: &[(&str, bool)] = &[
        ("a", true),
        ("b", true),
        ("c", true),
        ("b", false),
        ("d", true),
        ("a", false),
        ("e", true),
        ("c", false),
        ("b", true),
    ];
    for (id, add) in ops {
        if *add {
            reg.register("svc", id, "h", 1, Default::default()).unwrap();
            expected.insert(id.to_string());
        } else {
            assert!(reg.deregister("svc", id));
            expected.remove(*id);
        }
        let found: BTreeSet<String> = reg
            .discover("svc", false)
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(found, expected);
    }
}

#[test]
fn discover_is_sorted_by_instance_id() {
    let (reg, _) = registry_with_clock();
    for id in ["w3", "w1", "w2"] {
        reg.register("build", id, "h", 1, Default::default()).unwrap();
    }
    assert_eq!(ids(&reg.discover("build", true)), vec!["w1", "w2", "w3"]);
}

#[test]
fn discover_unknown_service_is_empty() {
    let (reg, _) = registry_with_clock();
    assert!(reg.discover("nope", true).is_empty());
    assert!(reg.discover("nope", false).is_empty());
}

// ===========================================================================
// heartbeat / staleness
// ===========================================================================

#[test]
fn heartbeat_unknown_returns_false() {
    let (reg, _) = registry_with_clock();
    assert!(!reg.heartbeat("build", "w1"));
}

#[test]
fn stale_instance_hidden_from_healthy_discovery() {
    let (reg, clock) = registry_with_clock();
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    reg.register("build", "w2", "h", 2, Default::default()).unwrap();

    clock.advance(Duration::from_secs(20));
    assert!(reg.heartbeat("build", "w2"));

    // w1 is now exactly at the window boundary: stale
    clock.advance(Duration::from_secs(10));
    assert_eq!(ids(&reg.discover("build", true)), vec!["w2"]);
    assert_eq!(ids(&reg.discover("build", false)), vec!["w1", "w2"]);
}

#[test]
fn heartbeat_makes_stale_instance_reappear() {
    let (reg, clock) = registry_with_clock();
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    clock.advance(Duration::from_secs(45));
    assert!(reg.discover("build", true).is_empty());

    assert!(reg.heartbeat("build", "w1"));
    assert_eq!(ids(&reg.discover("build", true)), vec!["w1"]);
}

#[test]
fn custom_staleness_window() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = RegistryConfig {
        staleness_window_secs: 5,
        ..Default::default()
    };
    let reg = ServiceRegistry::with_clock(&config, clock.clone());
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    clock.advance(Duration::from_secs(4));
    assert_eq!(reg.discover("build", true).len(), 1);
    clock.advance(Duration::from_secs(1));
    assert!(reg.discover("build", true).is_empty());
}

#[test]
fn all_spans_services_in_order() {
    let (reg, clock) = registry_with_clock();
    reg.register("test", "t1", "h", 1, Default::default()).unwrap();
    reg.register("build", "w2", "h", 1, Default::default()).unwrap();
    clock.advance(Duration::from_secs(31));
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();

    let all: Vec<String> = reg.all(false).iter().map(|i| i.key().to_string()).collect();
    assert_eq!(all, vec!["build/w1", "build/w2", "test/t1"]);
    let healthy: Vec<String> = reg.all(true).iter().map(|i| i.key().to_string()).collect();
    assert_eq!(healthy, vec!["build/w1"]);
}

#[test]
fn reap_stale_removes_only_unhealthy() {
    let (reg, clock) = registry_with_clock();
    reg.register("build", "old", "h", 1, Default::default()).unwrap();
    reg.register("lonely", "x", "h", 1, Default::default()).unwrap();
    clock.advance(Duration::from_secs(31));
    reg.register("build", "new", "h", 1, Default::default()).unwrap();

    let reaped = reg.reap_stale();
    assert_eq!(reaped.len(), 2);
    assert_eq!(ids(&reg.discover("build", false)), vec!["new"]);
    assert_eq!(reg.services(), vec!["build".to_string()]);
}

// ===========================================================================
// reaper task
// ===========================================================================

#[tokio::test]
async fn reaper_evicts_stale_instances_in_background() {
    let clock = Arc::new(ManualClock::starting_now());
    let reg = Arc::new(ServiceRegistry::with_clock(
        &RegistryConfig::default(),
        clock.clone(),
    ));
    reg.register("build", "w1", "h", 1, Default::default()).unwrap();
    clock.advance(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let handle = spawn_reaper(reg.clone(), Duration::from_millis(10), cancel.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !reg.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reg.is_empty());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("reaper did not stop")
        .unwrap();
}
