//! Integration tests for the engine pipeline.
//!
//! Drives full passes (allocate, observe, diff, execute) against
//! MockSubstrate.

use std::sync::Arc;
use std::time::Duration;

use lab_agent::{
    Config, EngineError, ExecutionMode, LabEngine, MockSubstrate, Outcome, ParallelApproval,
    TeardownScope,
};
use lab_allocator::AllocationError;
use lab_reconcile::DiffOptions;
use lab_roster::{Allocation, Roster, TenantId, TenantRecord};
use tokio::sync::watch;

fn id(s: &str) -> TenantId {
    TenantId::parse(s).unwrap()
}

fn alloc(port: u16, subnet_id: u8) -> Allocation {
    Allocation { port, subnet_id }
}

fn test_config() -> Config {
    Config {
        call_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

fn engine(substrate: &Arc<MockSubstrate>) -> LabEngine {
    LabEngine::new(substrate.clone(), &test_config())
}

fn idle() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn parallel(workers: usize) -> ExecutionMode {
    ExecutionMode::parallel(workers, ParallelApproval::assume_yes())
}

#[tokio::test]
async fn reconcile_creates_missing_and_removes_orphans() {
    let substrate = Arc::new(
        MockSubstrate::new()
            .with_running(id("keep"), alloc(2222, 10))
            .with_running(id("gone"), alloc(2223, 11)),
    );
    let engine = engine(&substrate);
    let roster = Roster::new(vec![
        TenantRecord::new(id("keep"), "Keep").with_port(2222).with_subnet(10),
        TenantRecord::new(id("new"), "New"),
    ]);

    let batch = engine
        .reconcile(&roster, &DiffOptions::default(), &ExecutionMode::Sequential, idle())
        .await
        .unwrap();

    assert_eq!(batch.summary.creates, 1);
    assert_eq!(batch.summary.removes, 1);
    assert_eq!(batch.summary.unchanged, 1);
    assert!(batch.report.is_success());
    assert_eq!(batch.report.unchanged, vec![id("keep")]);
    assert_eq!(substrate.tenants().await, vec![id("keep"), id("new")]);

    // The new tenant never takes the orphan's port or subnet.
    let new = batch.roster.get(&id("new")).unwrap();
    assert_ne!(new.port, Some(2223));
    assert_ne!(new.subnet_id, Some(11));
}

#[tokio::test]
async fn second_reconcile_is_a_noop() {
    let substrate = Arc::new(MockSubstrate::new());
    let engine = engine(&substrate);
    let roster = Roster::new(vec![
        TenantRecord::new(id("a"), "A"),
        TenantRecord::new(id("b"), "B"),
    ]);

    let first = engine
        .reconcile(&roster, &DiffOptions::default(), &parallel(2), idle())
        .await
        .unwrap();
    assert!(first.roster_changed());
    assert_eq!(substrate.bring_up_calls(), 2);

    let second = engine
        .reconcile(&first.roster, &DiffOptions::default(), &parallel(2), idle())
        .await
        .unwrap();

    assert!(!second.roster_changed());
    assert_eq!(second.summary.creates + second.summary.removes, 0);
    assert!(second.report.tenants.is_empty());
    assert_eq!(substrate.bring_up_calls(), 2);
    assert_eq!(second.roster, first.roster);
}

#[tokio::test]
async fn one_failure_does_not_block_others() {
    let substrate = Arc::new(MockSubstrate::new().failing_for(id("a")));
    let engine = engine(&substrate);
    let roster = Roster::new(vec![
        TenantRecord::new(id("a"), "A"),
        TenantRecord::new(id("b"), "B"),
        TenantRecord::new(id("c"), "C"),
    ]);

    let batch = engine.provision_all(&roster, &parallel(3), idle()).await.unwrap();

    assert!(matches!(batch.report.outcome(&id("a")), Some(Outcome::Failed(_))));
    assert_eq!(batch.report.outcome(&id("b")), Some(&Outcome::Succeeded));
    assert_eq!(batch.report.outcome(&id("c")), Some(&Outcome::Succeeded));
    assert_eq!(substrate.tenants().await, vec![id("b"), id("c")]);

    // Allocations are kept for the failed tenant so a retry reuses them.
    assert!(!batch.roster.get(&id("a")).unwrap().needs_allocation());
}

#[tokio::test]
async fn drifted_port_is_recreated_in_place() {
    let substrate = Arc::new(MockSubstrate::new().with_running(id("a"), alloc(2300, 5)));
    let engine = engine(&substrate);
    let roster = Roster::new(vec![TenantRecord::new(id("a"), "A").with_port(2222).with_subnet(5)]);

    let batch = engine
        .reconcile(&roster, &DiffOptions::default(), &ExecutionMode::Sequential, idle())
        .await
        .unwrap();

    assert_eq!(batch.summary.reallocations, 1);
    let steps: Vec<&str> = batch.report.tenants[&id("a")]
        .steps
        .iter()
        .map(|s| s.action.as_str())
        .collect();
    assert_eq!(
        steps,
        vec![
            "reallocate a port: 2300 -> 2222",
            "remove a",
            "create a (port 2222, subnet 5)"
        ]
    );
    assert_eq!(substrate.allocation_of(&id("a")).await, Some(alloc(2222, 5)));
}

#[tokio::test]
async fn blanked_port_moves_running_tenant() {
    let substrate = Arc::new(MockSubstrate::new().with_running(id("a"), alloc(2300, 5)));
    let engine = engine(&substrate);
    let roster = Roster::new(vec![TenantRecord::new(id("a"), "A").with_subnet(5)]);

    let batch = engine
        .reconcile(&roster, &DiffOptions::default(), &ExecutionMode::Sequential, idle())
        .await
        .unwrap();

    assert_eq!(batch.roster.records()[0].port, Some(2222));
    assert_eq!(substrate.allocation_of(&id("a")).await, Some(alloc(2222, 5)));
}

#[tokio::test]
async fn new_tenant_avoids_port_still_bound_by_moving_tenant() {
    let substrate = Arc::new(MockSubstrate::new().with_running(id("a"), alloc(2222, 5)));
    let engine = engine(&substrate);
    // `b` is created before `a` is torn down, so 2222 is still bound then.
    let roster = Roster::new(vec![
        TenantRecord::new(id("b"), "B"),
        TenantRecord::new(id("a"), "A").with_subnet(5),
    ]);

    let batch = engine
        .reconcile(&roster, &DiffOptions::default(), &ExecutionMode::Sequential, idle())
        .await
        .unwrap();

    assert!(batch.report.is_success());
    let port_of = |tenant: &str| batch.roster.get(&id(tenant)).unwrap().port.unwrap();
    assert_ne!(port_of("b"), 2222);
    assert_ne!(port_of("a"), 2222);
    assert_ne!(port_of("a"), port_of("b"));
}

#[tokio::test]
async fn cancellation_stops_dispatch() {
    let substrate = Arc::new(MockSubstrate::new().with_latency(Duration::from_millis(150)));
    let engine = engine(&substrate);
    let roster: Roster = ["a", "b", "c", "d"]
        .iter()
        .map(|s| TenantRecord::new(id(s), *s))
        .collect();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = cancel_tx.send(true);
    });

    let batch = engine.provision_all(&roster, &parallel(1), cancel_rx).await.unwrap();
    let counts = batch.report.counts();

    assert_eq!(counts.succeeded, 1);
    assert_eq!(counts.skipped, 3);
    assert_eq!(batch.report.outcome(&id("a")), Some(&Outcome::Succeeded));
    assert_eq!(substrate.tenants().await, vec![id("a")]);
}

#[tokio::test]
async fn teardown_scope_controls_orphans() {
    let substrate = Arc::new(
        MockSubstrate::new()
            .with_running(id("a"), alloc(2222, 1))
            .with_running(id("stray"), alloc(2223, 2)),
    );
    let engine = engine(&substrate);
    let roster = Roster::new(vec![TenantRecord::new(id("a"), "A").with_port(2222).with_subnet(1)]);

    let report = engine
        .teardown(&roster, TeardownScope::RosterOnly, &parallel(2), idle())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(substrate.tenants().await, vec![id("stray")]);

    let report = engine
        .teardown(&roster, TeardownScope::Everything, &parallel(2), idle())
        .await
        .unwrap();
    assert_eq!(report.tenants.len(), 2);
    assert!(substrate.tenants().await.is_empty());
}

#[tokio::test]
async fn invalid_roster_touches_nothing() {
    let substrate = Arc::new(MockSubstrate::new());
    let engine = engine(&substrate);
    let roster = Roster::new(vec![
        TenantRecord::new(id("a"), "A"),
        TenantRecord::new(id("a"), "Again"),
    ]);

    let err = engine
        .provision_all(&roster, &ExecutionMode::Sequential, idle())
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(substrate.bring_up_calls(), 0);
}

#[tokio::test]
async fn exhausted_subnets_abort_before_execution() {
    let substrate = Arc::new(MockSubstrate::new());
    let engine = engine(&substrate);
    let roster: Roster = (0..255)
        .map(|i| TenantRecord::new(id(&format!("t{i}")), ""))
        .collect();

    let err = engine
        .provision_all(&roster, &parallel(5), idle())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Allocation(AllocationError::Exhausted { .. })
    ));
    assert_eq!(substrate.bring_up_calls(), 0);
}

#[tokio::test]
async fn remove_one_handles_tenants_outside_roster() {
    let substrate = Arc::new(MockSubstrate::new().with_running(id("stray"), alloc(2222, 3)));
    let engine = engine(&substrate);

    let report = engine.remove_one(&id("stray"), idle()).await;

    assert!(report.is_success());
    assert!(substrate.tenants().await.is_empty());
}
