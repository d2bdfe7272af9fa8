//! Capacity probing.
//!
//! Finds the largest cohort the host brings up with every tenant
//! succeeding. The search itself ([`CapacitySearch`]) is a pure state
//! machine; something else runs the cohorts:
//!
//! - [`search_with`] drives it with a plain closure
//! - [`CapacityProber`] drives it with an async [`CohortRunner`]
//! - [`EngineCohort`] is the runner that provisions real environments
//!
//! Invariant: every cohort of `low` tenants succeeded, and some cohort of
//! `high` tenants failed (or `high` is the hard ceiling).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use lab_roster::{Roster, TenantId, TenantRecord, SUBNET_COUNT};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::engine::{LabEngine, TeardownScope};
use crate::executor::ExecutionMode;

/// Cohort size that can never succeed: one more than there are subnets.
pub const HARD_CEILING: u32 = SUBNET_COUNT as u32 + 1;

/// Default probe budget.
pub const DEFAULT_MAX_PROBES: u32 = 10;

/// One cohort trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeRecord {
    pub count: u32,
    pub success: bool,
    pub duration_ms: u64,
}

/// Result of a capacity search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    /// Largest cohort known to succeed.
    pub low: u32,

    /// Smallest cohort known to fail, if one was found.
    pub high: Option<u32>,

    /// True once `high - low == 1` with `high` confirmed.
    pub converged: bool,

    pub probes: Vec<ProbeRecord>,
}

/// Binary search over cohort sizes.
#[derive(Debug, Clone)]
pub struct CapacitySearch {
    low: u32,
    high: Option<u32>,
    high_confirmed: bool,
    max_probes: u32,
    probes: Vec<ProbeRecord>,
}

impl CapacitySearch {
    /// Start a search.
    ///
    /// `low` is assumed good. A supplied `high` is assumed bad and is probed
    /// once before the search reports convergence on it; without one, the
    /// search doubles from `max(low, 1)` until a cohort fails.
    pub fn new(low: u32, high: Option<u32>) -> Self {
        let low = low.min(HARD_CEILING - 1);
        let high = high.map(|h| h.clamp(low + 1, HARD_CEILING));
        let mut search = Self {
            low,
            high_confirmed: high == Some(HARD_CEILING),
            high,
            max_probes: DEFAULT_MAX_PROBES,
            probes: Vec::new(),
        };
        search.cap_at_ceiling();
        search
    }

    /// Cap the number of probes.
    pub fn with_max_probes(mut self, max_probes: u32) -> Self {
        self.max_probes = max_probes;
        self
    }

    pub fn low(&self) -> u32 {
        self.low
    }

    pub fn high(&self) -> Option<u32> {
        self.high
    }

    /// Returns true once the bounds are adjacent and `high` is confirmed.
    pub fn is_converged(&self) -> bool {
        matches!(self.high, Some(h) if h - self.low <= 1 && self.high_confirmed)
    }

    /// Next cohort size to try, or `None` when done (or out of probes).
    pub fn next_probe(&self) -> Option<u32> {
        if self.is_converged() || self.probes.len() as u32 >= self.max_probes {
            return None;
        }

        match self.high {
            None => Some(self.doubled()),
            Some(high) if high - self.low <= 1 => Some(high),
            Some(high) => Some(self.low + (high - self.low) / 2),
        }
    }

    /// Record the result of a cohort of `count` tenants.
    pub fn record(&mut self, count: u32, success: bool, duration: Duration) {
        self.probes.push(ProbeRecord {
            count,
            success,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });

        if success {
            if count > self.low {
                self.low = count;
            }
            if matches!(self.high, Some(h) if count >= h) {
                // The assumed-bad bound was fine after all; go back to doubling.
                self.high = None;
                self.high_confirmed = false;
            }
        } else {
            if count <= self.low {
                self.low = count.saturating_sub(1);
            }
            if self.high.map_or(true, |h| count <= h) {
                self.high = Some(count);
                self.high_confirmed = true;
            }
        }

        self.cap_at_ceiling();
    }

    fn doubled(&self) -> u32 {
        if self.low == 0 {
            1
        } else {
            self.low.saturating_mul(2)
        }
    }

    /// Treat the ceiling as the known-bad bound once doubling would reach it.
    fn cap_at_ceiling(&mut self) {
        if self.high.is_none() && self.doubled() >= HARD_CEILING {
            self.high = Some(HARD_CEILING);
            self.high_confirmed = true;
        }
    }

    /// Snapshot the current state as a report.
    pub fn report(&self) -> CapacityReport {
        CapacityReport {
            low: self.low,
            high: self.high,
            converged: self.is_converged(),
            probes: self.probes.clone(),
        }
    }
}

/// Run a search to completion with a synchronous cohort function.
pub fn search_with<F>(mut search: CapacitySearch, mut run_cohort: F) -> CapacityReport
where
    F: FnMut(u32) -> bool,
{
    while let Some(count) = search.next_probe() {
        let started = Instant::now();
        let ok = run_cohort(count);
        search.record(count, ok, started.elapsed());
    }
    search.report()
}

/// Provisions a cohort and reports whether every tenant came up.
#[async_trait]
pub trait CohortRunner: Send + Sync {
    /// Bring up `count` tenants, tear them down, and report success.
    async fn run_cohort(&self, count: u32) -> bool;
}

/// Async driver for [`CapacitySearch`].
pub struct CapacityProber<R> {
    runner: R,
}

impl<R: CohortRunner> CapacityProber<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Run the search. Stops early, unconverged, once `cancel` reads true.
    #[instrument(skip_all, fields(low = search.low(), high = ?search.high()))]
    pub async fn run(
        &self,
        mut search: CapacitySearch,
        cancel: watch::Receiver<bool>,
    ) -> CapacityReport {
        while let Some(count) = search.next_probe() {
            if *cancel.borrow() {
                warn!("Capacity search cancelled");
                break;
            }

            info!(count, low = search.low(), high = ?search.high(), "Probing cohort");
            let started = Instant::now();
            let ok = self.runner.run_cohort(count).await;
            let elapsed = started.elapsed();
            info!(count, success = ok, elapsed_secs = elapsed.as_secs(), "Probe finished");

            search.record(count, ok, elapsed);
        }

        let report = search.report();
        info!(
            low = report.low,
            high = ?report.high,
            converged = report.converged,
            probes = report.probes.len(),
            "Capacity search finished"
        );
        report
    }
}

/// Cohort runner backed by the engine.
///
/// Each cohort is an ephemeral roster of `captestNNN` tenants; only those
/// tenants are torn down afterwards.
pub struct EngineCohort {
    engine: LabEngine,
    mode: ExecutionMode,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

impl EngineCohort {
    /// `timeout` bounds the whole bring-up of one cohort.
    pub fn new(
        engine: LabEngine,
        mode: ExecutionMode,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            mode,
            timeout,
            cancel,
        }
    }
}

/// Ephemeral roster of `count` unallocated tenants.
pub fn cohort_roster(count: u32) -> Roster {
    (1..=count)
        .filter_map(|i| {
            let id = TenantId::parse(&format!("captest{i:03}")).ok()?;
            Some(TenantRecord::new(id, format!("Capacity Test Student {i}")))
        })
        .collect()
}

#[async_trait]
impl CohortRunner for EngineCohort {
    async fn run_cohort(&self, count: u32) -> bool {
        let roster = cohort_roster(count);
        let provision = self
            .engine
            .provision_all(&roster, &self.mode, self.cancel.clone());

        let ok = match tokio::time::timeout(self.timeout, provision).await {
            Ok(Ok(batch)) => {
                let counts = batch.report.counts();
                if !batch.report.is_success() {
                    warn!(count, failed = counts.failed, skipped = counts.skipped, "Cohort had failures");
                }
                batch.report.is_success() && counts.succeeded + counts.unchanged == count as usize
            }
            Ok(Err(e)) => {
                warn!(count, error = %e, "Cohort could not start");
                false
            }
            Err(_) => {
                warn!(count, timeout_secs = self.timeout.as_secs(), "Cohort timed out");
                false
            }
        };

        let uncancellable = watch::channel(false).1;
        match self
            .engine
            .teardown(&roster, TeardownScope::RosterOnly, &self.mode, uncancellable)
            .await
        {
            Ok(report) if report.is_success() => {}
            Ok(report) => warn!(failed = report.counts().failed, "Cohort teardown incomplete"),
            Err(e) => warn!(error = %e, "Cohort teardown failed"),
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ceil_log2(n: u32) -> u32 {
        32 - (n - 1).leading_zeros()
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 100)]
    #[case(37, 100)]
    #[case(62, 64)]
    #[case(98, 100)]
    fn converges_within_log2_probes(#[case] capacity: u32, #[case] initial_high: u32) {
        let report = search_with(CapacitySearch::new(0, Some(initial_high)), |n| n <= capacity);

        assert!(report.converged);
        assert_eq!(report.low, capacity);
        assert_eq!(report.high, Some(capacity + 1));
        assert!(
            report.probes.len() as u32 <= ceil_log2(initial_high),
            "{} probes for high {}",
            report.probes.len(),
            initial_high
        );
    }

    #[test]
    fn supplied_high_is_verified() {
        // capacity is exactly high - 1, so the search lands on `high`
        // without having probed it.
        let report = search_with(CapacitySearch::new(0, Some(16)), |n| n <= 15);
        assert_eq!((report.low, report.high), (15, Some(16)));
        assert!(report.converged);
        assert_eq!(report.probes.last().map(|p| p.count), Some(16));
    }

    #[test]
    fn wrong_high_resumes_doubling() {
        let report = search_with(CapacitySearch::new(0, Some(8)).with_max_probes(20), |n| n <= 20);
        assert_eq!((report.low, report.high), (20, Some(21)));
        assert!(report.converged);
    }

    #[test]
    fn doubles_without_high() {
        let mut seen = Vec::new();
        let report = search_with(CapacitySearch::new(0, None), |n| {
            seen.push(n);
            n <= 5
        });
        assert_eq!(&seen[..4], &[1, 2, 4, 8]);
        assert_eq!((report.low, report.high), (5, Some(6)));
    }

    #[test]
    fn doubling_stops_at_ceiling() {
        let report = search_with(CapacitySearch::new(0, None).with_max_probes(50), |_| true);
        assert_eq!(report.low, HARD_CEILING - 1);
        assert_eq!(report.high, Some(HARD_CEILING));
        assert!(report.converged);
        assert!(report.probes.iter().all(|p| p.count < HARD_CEILING));
    }

    #[test]
    fn probe_budget_stops_search() {
        let report = search_with(
            CapacitySearch::new(0, Some(200)).with_max_probes(2),
            |n| n <= 77,
        );
        assert_eq!(report.probes.len(), 2);
        assert!(!report.converged);
    }

    #[test]
    fn failure_below_low_lowers_low() {
        let mut search = CapacitySearch::new(10, Some(20));
        search.record(8, false, Duration::ZERO);
        assert_eq!(search.low(), 7);
        assert_eq!(search.high(), Some(8));
    }

    #[test]
    fn nothing_fits() {
        let report = search_with(CapacitySearch::new(0, None), |_| false);
        assert_eq!((report.low, report.high), (0, Some(1)));
        assert!(report.converged);
        assert_eq!(report.probes.len(), 1);
    }

    #[test]
    fn cohort_roster_uses_padded_ids() {
        let roster = cohort_roster(3);
        let ids: Vec<_> = roster.ids().map(TenantId::as_str).collect();
        assert_eq!(ids, vec!["captest001", "captest002", "captest003"]);
        assert_eq!(roster.pending_allocation(), 3);
    }
}
