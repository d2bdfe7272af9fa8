//! Execution engine.
//!
//! Applies a [`Plan`] against a substrate and reports one outcome per
//! tenant. Groups are independent: a failed group never stops another one,
//! and actions inside a group run strictly in order, stopping at the first
//! failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lab_reconcile::{Action, ActionGroup, Plan};
use lab_roster::TenantId;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::substrate::{with_timeout, BringUp, Substrate};

/// Default worker limit for parallel runs.
pub const DEFAULT_WORKERS: usize = 5;

/// Reason recorded for groups never dispatched because of cancellation.
pub const CANCELLED: &str = "cancelled";

// ============================================================================
// Mode
// ============================================================================

/// Proof that the operator agreed to a parallel run.
///
/// Only obtainable from [`ParallelApproval::assume_yes`] or a
/// [`ConfirmParallel`] prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelApproval(());

impl ParallelApproval {
    /// Approval given up front (`--yes`).
    pub fn assume_yes() -> Self {
        Self(())
    }

    /// Ask `prompt`; `None` if the operator declined.
    pub fn confirm(prompt: &dyn ConfirmParallel, tenants: usize, workers: usize) -> Option<Self> {
        prompt.confirm(tenants, workers).then_some(Self(()))
    }
}

/// Asks the operator whether a parallel run may proceed.
pub trait ConfirmParallel {
    /// Returns true if a run over a roster of `tenants` may use `workers`
    /// workers. The plan is not known yet, so orphans are not counted.
    fn confirm(&self, tenants: usize, workers: usize) -> bool;
}

/// How groups are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One group at a time, in plan order.
    Sequential,

    /// Up to `workers` groups at once.
    Parallel {
        workers: usize,
        approval: ParallelApproval,
    },
}

impl ExecutionMode {
    /// Parallel mode with at least one worker.
    pub fn parallel(workers: usize, approval: ParallelApproval) -> Self {
        Self::Parallel {
            workers: workers.max(1),
            approval,
        }
    }

    /// Number of groups that may run at once.
    pub fn workers(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel { workers, .. } => *workers,
        }
    }

    /// Name for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel { .. } => "parallel",
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Result of one tenant group (or one step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Outcome {
    /// Every action completed.
    Succeeded,

    /// An action failed; the reason names it.
    Failed(String),

    /// Nothing was attempted.
    Skipped(String),
}

impl Outcome {
    /// Returns true for [`Outcome::Succeeded`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Failure or skip reason.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Failed(reason) | Self::Skipped(reason) => Some(reason),
        }
    }

    /// Short status word.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// One executed action.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Human-readable action.
    pub action: String,

    /// What happened.
    pub outcome: Outcome,

    /// Wall-clock time spent.
    pub duration_ms: u64,
}

/// Everything that happened to one tenant in a run.
#[derive(Debug, Clone, Serialize)]
pub struct TenantReport {
    pub tenant_id: TenantId,
    pub outcome: Outcome,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TenantReport {
    /// A group that was never dispatched.
    pub fn skipped(tenant_id: TenantId, reason: impl Into<String>) -> Self {
        Self {
            tenant_id,
            outcome: Outcome::Skipped(reason.into()),
            steps: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unchanged: usize,
}

/// Aggregate result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// `sequential` or `parallel`.
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Per-tenant outcome for every planned group.
    pub tenants: BTreeMap<TenantId, TenantReport>,

    /// Tenants that needed no action.
    pub unchanged: Vec<TenantId>,
}

impl ExecutionReport {
    /// An empty report, for runs with nothing to do.
    pub fn empty(mode: &ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            mode: mode.label().to_string(),
            started_at: now,
            finished_at: now,
            tenants: BTreeMap::new(),
            unchanged: Vec::new(),
        }
    }

    /// Outcome for a tenant, if it was planned.
    pub fn outcome(&self, tenant_id: &TenantId) -> Option<&Outcome> {
        self.tenants.get(tenant_id).map(|r| &r.outcome)
    }

    /// Tenants whose group succeeded.
    pub fn succeeded(&self) -> Vec<&TenantId> {
        self.matching(Outcome::is_success)
    }

    /// Tenants whose group failed.
    pub fn failed(&self) -> Vec<&TenantId> {
        self.matching(|o| matches!(o, Outcome::Failed(_)))
    }

    /// Tenants whose group was skipped.
    pub fn skipped(&self) -> Vec<&TenantId> {
        self.matching(|o| matches!(o, Outcome::Skipped(_)))
    }

    fn matching(&self, pred: impl Fn(&Outcome) -> bool) -> Vec<&TenantId> {
        self.tenants
            .values()
            .filter(|r| pred(&r.outcome))
            .map(|r| &r.tenant_id)
            .collect()
    }

    /// Outcome counts.
    pub fn counts(&self) -> ReportCounts {
        let mut counts = ReportCounts {
            unchanged: self.unchanged.len(),
            ..Default::default()
        };
        for report in self.tenants.values() {
            match report.outcome {
                Outcome::Succeeded => counts.succeeded += 1,
                Outcome::Failed(_) => counts.failed += 1,
                Outcome::Skipped(_) => counts.skipped += 1,
            }
        }
        counts
    }

    /// Returns true if every planned group succeeded.
    pub fn is_success(&self) -> bool {
        self.tenants.values().all(|r| r.outcome.is_success())
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs plans against a substrate.
#[derive(Clone)]
pub struct Executor {
    substrate: Arc<dyn Substrate>,
    call_timeout: Duration,
}

impl Executor {
    /// Create an executor; every substrate call is bounded by `call_timeout`.
    pub fn new(substrate: Arc<dyn Substrate>, call_timeout: Duration) -> Self {
        Self {
            substrate,
            call_timeout,
        }
    }

    /// Apply `plan`.
    ///
    /// Once `cancel` reads `true`, no further groups are dispatched; groups
    /// already running finish and the rest are reported as skipped.
    #[instrument(skip_all, fields(mode = mode.label(), groups = plan.groups.len()))]
    pub async fn execute(
        &self,
        plan: &Plan,
        mode: &ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        info!(workers = mode.workers(), "Executing plan");

        let tenants = match mode {
            ExecutionMode::Sequential => self.run_sequential(&plan.groups, &cancel).await,
            ExecutionMode::Parallel { workers, .. } => {
                self.run_parallel(&plan.groups, *workers, &cancel).await
            }
        };

        let report = ExecutionReport {
            mode: mode.label().to_string(),
            started_at,
            finished_at: Utc::now(),
            tenants,
            unchanged: plan.unchanged.clone(),
        };

        let counts = report.counts();
        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            unchanged = counts.unchanged,
            "Plan executed"
        );
        report
    }

    async fn run_sequential(
        &self,
        groups: &[ActionGroup],
        cancel: &watch::Receiver<bool>,
    ) -> BTreeMap<TenantId, TenantReport> {
        let mut results = BTreeMap::new();
        for group in groups {
            let cancelled = *cancel.borrow();
            let report = if cancelled {
                TenantReport::skipped(group.tenant_id.clone(), CANCELLED)
            } else {
                run_group(self.substrate.as_ref(), group, self.call_timeout)
                    .instrument(tracing::info_span!("tenant", tenant_id = %group.tenant_id))
                    .await
            };
            results.insert(group.tenant_id.clone(), report);
        }
        results
    }

    /// Workers live in a [`JoinSet`], so dropping this future (a timeout,
    /// say) aborts every in-flight group instead of leaving it running.
    async fn run_parallel(
        &self,
        groups: &[ActionGroup],
        workers: usize,
        cancel: &watch::Receiver<bool>,
    ) -> BTreeMap<TenantId, TenantReport> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut results = BTreeMap::new();
        let mut dispatched = Vec::with_capacity(groups.len());
        let mut tasks = JoinSet::new();

        for group in groups {
            let permit = semaphore.clone().acquire_owned().await;
            if *cancel.borrow() {
                debug!(tenant_id = %group.tenant_id, "Not dispatching, run cancelled");
                results.insert(
                    group.tenant_id.clone(),
                    TenantReport::skipped(group.tenant_id.clone(), CANCELLED),
                );
                continue;
            }

            let substrate = self.substrate.clone();
            let group = group.clone();
            let call_timeout = self.call_timeout;
            let span = tracing::info_span!("tenant", tenant_id = %group.tenant_id);
            dispatched.push(group.tenant_id.clone());

            tasks.spawn(
                async move {
                    let report = run_group(substrate.as_ref(), &group, call_timeout).await;
                    drop(permit);
                    report
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    results.insert(report.tenant_id.clone(), report);
                }
                Err(e) => warn!(error = %e, "Worker task failed"),
            }
        }

        for tenant_id in dispatched {
            if !results.contains_key(&tenant_id) {
                results.insert(
                    tenant_id.clone(),
                    TenantReport {
                        tenant_id,
                        outcome: Outcome::Failed("worker task failed".to_string()),
                        steps: Vec::new(),
                        started_at: Utc::now(),
                        duration_ms: 0,
                    },
                );
            }
        }
        results
    }
}

/// Apply one group, stopping at the first failed action.
async fn run_group(substrate: &dyn Substrate, group: &ActionGroup, call_timeout: Duration) -> TenantReport {
    let started_at = Utc::now();
    let started = Instant::now();
    let mut steps = Vec::with_capacity(group.actions.len());
    let mut outcome = Outcome::Succeeded;

    for action in &group.actions {
        if !outcome.is_success() {
            steps.push(StepRecord {
                action: action.to_string(),
                outcome: Outcome::Skipped("earlier step failed".to_string()),
                duration_ms: 0,
            });
            continue;
        }

        let step_started = Instant::now();
        let result = apply(substrate, action, call_timeout).await;
        let step_outcome = match result {
            Ok(()) => Outcome::Succeeded,
            Err(reason) => {
                warn!(action = %action, reason = %reason, "Action failed");
                outcome = Outcome::Failed(format!("{} failed: {}", action.kind(), reason));
                Outcome::Failed(reason)
            }
        };
        steps.push(StepRecord {
            action: action.to_string(),
            outcome: step_outcome,
            duration_ms: millis(step_started.elapsed()),
        });
    }

    TenantReport {
        tenant_id: group.tenant_id.clone(),
        outcome,
        steps,
        started_at,
        duration_ms: millis(started.elapsed()),
    }
}

async fn apply(substrate: &dyn Substrate, action: &Action, call_timeout: Duration) -> Result<(), String> {
    match action {
        Action::Reallocate {
            tenant_id,
            field,
            old,
            new,
        } => {
            info!(tenant_id = %tenant_id, field = %field, old, new, "Allocation changed");
            Ok(())
        }
        Action::Remove(tenant_id) => {
            with_timeout("tear down", call_timeout, substrate.tear_down(tenant_id))
                .await
                .map_err(|e| e.to_string())
        }
        Action::Create(record) => {
            let request = BringUp::from_record(record)
                .ok_or_else(|| format!("{} has no allocation", record.tenant_id))?;
            with_timeout("bring up", call_timeout, substrate.bring_up(&request))
                .await
                .map_err(|e| e.to_string())
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MockSubstrate;
    use lab_allocator::Field;
    use lab_roster::TenantRecord;

    fn id(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn record(s: &str, port: u16, subnet_id: u8) -> TenantRecord {
        TenantRecord::new(id(s), s).with_port(port).with_subnet(subnet_id)
    }

    fn creates(n: usize) -> Plan {
        Plan::from_groups(
            (0..n)
                .map(|i| ActionGroup::create(record(&format!("t{i}"), 2222 + i as u16, 1 + i as u8)))
                .collect(),
        )
    }

    fn not_cancelled() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn sequential_run_reports_every_group() {
        let substrate = Arc::new(MockSubstrate::new());
        let executor = Executor::new(substrate.clone(), Duration::from_secs(5));

        let report = executor
            .execute(&creates(3), &ExecutionMode::Sequential, not_cancelled())
            .await;

        assert!(report.is_success());
        assert_eq!(report.counts().succeeded, 3);
        assert_eq!(substrate.tenants().await.len(), 3);
        assert_eq!(report.mode, "sequential");
    }

    #[tokio::test]
    async fn sequential_run_continues_past_failure() {
        let substrate = Arc::new(MockSubstrate::new().failing_for(id("t0")));
        let executor = Executor::new(substrate.clone(), Duration::from_secs(5));

        let report = executor
            .execute(&creates(2), &ExecutionMode::Sequential, not_cancelled())
            .await;

        assert!(matches!(report.outcome(&id("t0")), Some(Outcome::Failed(r)) if r.contains("create failed")));
        assert_eq!(report.outcome(&id("t1")), Some(&Outcome::Succeeded));
    }

    #[tokio::test]
    async fn parallel_run_respects_worker_limit() {
        let substrate = Arc::new(MockSubstrate::new().with_latency(Duration::from_millis(20)));
        let executor = Executor::new(substrate.clone(), Duration::from_secs(5));
        let mode = ExecutionMode::parallel(3, ParallelApproval::assume_yes());

        let report = executor.execute(&creates(10), &mode, not_cancelled()).await;

        assert!(report.is_success());
        assert_eq!(report.tenants.len(), 10);
        assert!(substrate.max_in_flight() <= 3);
        assert!(substrate.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn timed_out_call_is_a_failure() {
        let substrate = Arc::new(MockSubstrate::new().hanging_for(id("t1")));
        let executor = Executor::new(substrate, Duration::from_millis(50));
        let mode = ExecutionMode::parallel(2, ParallelApproval::assume_yes());

        let report = executor.execute(&creates(2), &mode, not_cancelled()).await;

        assert_eq!(report.outcome(&id("t0")), Some(&Outcome::Succeeded));
        let reason = report.outcome(&id("t1")).and_then(Outcome::reason).unwrap();
        assert!(reason.contains("timed out"), "{reason}");
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let substrate = Arc::new(MockSubstrate::new());
        let executor = Executor::new(substrate.clone(), Duration::from_secs(5));
        let (_tx, rx) = watch::channel(true);

        let report = executor.execute(&creates(3), &ExecutionMode::Sequential, rx).await;

        assert_eq!(report.counts().skipped, 3);
        assert_eq!(report.outcome(&id("t2")), Some(&Outcome::Skipped(CANCELLED.to_string())));
        assert_eq!(substrate.bring_up_calls(), 0);
    }

    #[tokio::test]
    async fn reallocate_makes_no_substrate_call() {
        let substrate = Arc::new(MockSubstrate::new());
        let executor = Executor::new(substrate.clone(), Duration::from_secs(5));
        let plan = Plan::from_groups(vec![ActionGroup {
            tenant_id: id("t0"),
            actions: vec![Action::Reallocate {
                tenant_id: id("t0"),
                field: Field::Port,
                old: 2222,
                new: 2223,
            }],
        }]);

        let report = executor
            .execute(&plan, &ExecutionMode::Sequential, not_cancelled())
            .await;

        assert!(report.is_success());
        assert_eq!(substrate.bring_up_calls(), 0);
        assert_eq!(substrate.tear_down_calls(), 0);
    }

    #[tokio::test]
    async fn failed_step_skips_rest_of_group() {
        let substrate = Arc::new(MockSubstrate::new());
        let executor = Executor::new(substrate.clone(), Duration::from_secs(5));
        let plan = Plan::from_groups(vec![ActionGroup {
            tenant_id: id("t0"),
            actions: vec![
                Action::Create(TenantRecord::new(id("t0"), "unallocated")),
                Action::Remove(id("t0")),
            ],
        }]);

        let report = executor
            .execute(&plan, &ExecutionMode::Sequential, not_cancelled())
            .await;

        let tenant = &report.tenants[&id("t0")];
        assert!(matches!(tenant.outcome, Outcome::Failed(_)));
        assert_eq!(tenant.steps.len(), 2);
        assert!(matches!(tenant.steps[1].outcome, Outcome::Skipped(_)));
        assert_eq!(substrate.tear_down_calls(), 0);
    }

    #[test]
    fn approval_requires_confirmation() {
        struct Answer(bool);
        impl ConfirmParallel for Answer {
            fn confirm(&self, _tenants: usize, _workers: usize) -> bool {
                self.0
            }
        }

        assert!(ParallelApproval::confirm(&Answer(false), 4, 5).is_none());
        assert!(ParallelApproval::confirm(&Answer(true), 4, 5).is_some());
        assert_eq!(ExecutionMode::parallel(0, ParallelApproval::assume_yes()).workers(), 1);
    }

    #[test]
    fn outcome_serializes_with_reason() {
        let json = serde_json::to_value(Outcome::Failed("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "boom"}));
    }
}
