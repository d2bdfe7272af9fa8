//! Integration tests for capacity probing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lab_agent::{
    CapacityProber, CapacitySearch, CohortRunner, Config, EngineCohort, ExecutionMode, LabEngine,
    MockSubstrate, ParallelApproval,
};
use lab_roster::{Allocation, TenantId};
use tokio::sync::watch;

/// Succeeds for cohorts up to `capacity`, counting calls.
struct Synthetic {
    capacity: u32,
    calls: AtomicU32,
}

#[async_trait]
impl CohortRunner for Synthetic {
    async fn run_cohort(&self, count: u32) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        count <= self.capacity
    }
}

fn ceil_log2(n: u32) -> u32 {
    32 - (n - 1).leading_zeros()
}

#[tokio::test]
async fn prober_converges_on_synthetic_capacity() {
    for capacity in [0, 3, 17, 40, 62] {
        let prober = CapacityProber::new(Synthetic {
            capacity,
            calls: AtomicU32::new(0),
        });

        let report = prober
            .run(CapacitySearch::new(0, Some(64)), watch::channel(false).1)
            .await;

        assert!(report.converged, "capacity {capacity}");
        assert_eq!(report.low, capacity);
        assert_eq!(report.high, Some(capacity + 1));
        assert!(report.probes.len() as u32 <= ceil_log2(64));
    }
}

#[tokio::test]
async fn cancelled_prober_stops_unconverged() {
    let prober = CapacityProber::new(Synthetic {
        capacity: 10,
        calls: AtomicU32::new(0),
    });

    let report = prober
        .run(CapacitySearch::new(0, None), watch::channel(true).1)
        .await;

    assert!(!report.converged);
    assert!(report.probes.is_empty());
}

#[tokio::test]
async fn engine_cohort_finds_mock_capacity_and_cleans_up() {
    let existing = TenantId::parse("student1").unwrap();
    let substrate = Arc::new(
        MockSubstrate::new()
            .with_capacity(8)
            .with_running(
                existing.clone(),
                Allocation {
                    port: 2222,
                    subnet_id: 1,
                },
            ),
    );
    let config = Config {
        call_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let engine = LabEngine::new(substrate.clone(), &config);
    let cohort = EngineCohort::new(
        engine,
        ExecutionMode::parallel(4, ParallelApproval::assume_yes()),
        Duration::from_secs(30),
        watch::channel(false).1,
    );

    let report = CapacityProber::new(cohort)
        .run(CapacitySearch::new(0, None), watch::channel(false).1)
        .await;

    // One slot is taken by the environment that was already running.
    assert!(report.converged);
    assert_eq!(report.low, 7);
    assert_eq!(report.high, Some(8));

    // Only cohort tenants were torn down.
    assert_eq!(substrate.tenants().await, vec![existing]);
}

#[tokio::test]
async fn supplied_high_verification_costs_one_extra_trial() {
    let prober = CapacityProber::new(Synthetic {
        capacity: 63,
        calls: AtomicU32::new(0),
    });

    let report = prober
        .run(CapacitySearch::new(0, Some(64)), watch::channel(false).1)
        .await;

    assert!(report.converged);
    assert_eq!(report.low, 63);
    assert_eq!(report.high, Some(64));
    assert_eq!(report.probes.len() as u32, ceil_log2(64) + 1);
}

#[tokio::test]
async fn timed_out_cohort_leaves_nothing_running() {
    let substrate = Arc::new(MockSubstrate::new().with_bring_up_latency(Duration::from_millis(400)));
    let config = Config {
        call_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let engine = LabEngine::new(substrate.clone(), &config);
    let cohort = EngineCohort::new(
        engine,
        ExecutionMode::parallel(4, ParallelApproval::assume_yes()),
        Duration::from_millis(100),
        watch::channel(false).1,
    );

    assert!(!cohort.run_cohort(4).await);

    // Past the point where abandoned bring-ups would have finished.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(substrate.tenants().await.is_empty());
}
