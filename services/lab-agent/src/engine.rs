//! Lab engine: the pipeline from roster to running environments.
//!
//! ```text
//! Roster ──► allocate ──► issue credentials ──┐
//!                                             ├─► diff ──► execute ──► report
//! Substrate ──► observe ──────────────────────┘
//! ```
//!
//! Allocation and validation happen before any substrate mutation; a batch
//! either fails up front or runs to completion with one outcome per tenant.

use std::collections::HashSet;
use std::sync::Arc;

use lab_allocator::{allocate_with, AllocationChange, Conflict, Reservations};
use lab_reconcile::{
    classify, diff, ActionGroup, Convergence, DiffOptions, ObservedTenant, Plan, PlanSummary,
};
use lab_roster::{Allocation, Roster, TenantId, TenantRecord};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::credentials::{issue_missing, CredentialSource, WordCredentials};
use crate::error::EngineError;
use crate::executor::{ExecutionMode, ExecutionReport, Executor};
use crate::observer::StateObserver;
use crate::substrate::Substrate;

/// Roster after allocation and credential issuance.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub roster: Roster,
    pub changes: Vec<AllocationChange>,
    pub conflicts: Vec<Conflict>,
    pub issued: Vec<TenantId>,
}

impl Prepared {
    /// Returns true if the roster differs from the input.
    pub fn roster_changed(&self) -> bool {
        !self.changes.is_empty() || !self.issued.is_empty()
    }
}

/// Result of a batch that may have filled in roster fields.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Updated roster; the caller persists it.
    pub roster: Roster,

    /// Allocation changes made before execution.
    pub changes: Vec<AllocationChange>,

    /// Conflicts found and repaired.
    pub conflicts: Vec<Conflict>,

    /// Tenants that received a new credential.
    pub issued: Vec<TenantId>,

    /// What the plan contained.
    pub summary: PlanSummary,

    /// What happened.
    pub report: ExecutionReport,
}

impl BatchOutcome {
    fn new(prepared: Prepared, summary: PlanSummary, report: ExecutionReport) -> Self {
        Self {
            roster: prepared.roster,
            changes: prepared.changes,
            conflicts: prepared.conflicts,
            issued: prepared.issued,
            summary,
            report,
        }
    }

    /// Returns true if the roster differs from the input.
    pub fn roster_changed(&self) -> bool {
        !self.changes.is_empty() || !self.issued.is_empty()
    }
}

/// Which environments a teardown touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownScope {
    /// Only tenants in the roster.
    #[default]
    RosterOnly,

    /// Roster tenants plus every other environment the substrate reports.
    Everything,
}

/// Desired and observed state of one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct TenantStatus {
    pub tenant_id: TenantId,

    /// Display name, if the tenant is in the roster.
    pub display_name: Option<String>,

    /// Allocation recorded in the roster.
    pub desired: Option<Allocation>,

    pub observed: ObservedTenant,

    /// `None` for orphans.
    pub convergence: Option<Convergence>,
}

impl TenantStatus {
    fn new(record: Option<&TenantRecord>, observed: ObservedTenant) -> Self {
        Self {
            tenant_id: observed.tenant_id.clone(),
            display_name: record.map(|r| r.display_name.clone()),
            desired: record.and_then(TenantRecord::allocation),
            convergence: record.map(|r| classify(r, Some(&observed))),
            observed,
        }
    }

    /// Returns true if the environment has no roster entry.
    pub fn is_orphan(&self) -> bool {
        self.convergence.is_none()
    }

    /// Short state word for tables.
    pub fn state_label(&self) -> String {
        match self.convergence {
            Some(c) => c.to_string(),
            None => "orphan".to_string(),
        }
    }
}

/// Drives tenants on one substrate.
#[derive(Clone)]
pub struct LabEngine {
    substrate: Arc<dyn Substrate>,
    observer: StateObserver,
    executor: Executor,
    credentials: Arc<dyn CredentialSource>,
}

impl LabEngine {
    /// Create an engine using `config` for timeouts and observer concurrency.
    pub fn new(substrate: Arc<dyn Substrate>, config: &Config) -> Self {
        Self {
            observer: StateObserver::new(substrate.clone(), config.call_timeout, config.workers),
            executor: Executor::new(substrate.clone(), config.call_timeout),
            credentials: Arc::new(WordCredentials),
            substrate,
        }
    }

    /// Replace the credential source.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    /// The substrate this engine drives.
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Allocate ports and subnets and issue missing credentials.
    pub fn prepare(
        &self,
        roster: &Roster,
        reservations: &Reservations,
    ) -> Result<Prepared, EngineError> {
        let outcome = allocate_with(roster, reservations)?;
        let mut roster = outcome.roster;
        let issued = issue_missing(&mut roster, self.credentials.as_ref());

        if !outcome.changes.is_empty() || !issued.is_empty() {
            info!(
                allocations = outcome.changes.len(),
                credentials = issued.len(),
                "Roster updated"
            );
        }

        Ok(Prepared {
            roster,
            changes: outcome.changes,
            conflicts: outcome.conflicts,
            issued,
        })
    }

    /// Observe the roster tenants plus everything the substrate reports.
    pub async fn observe(&self, roster: &Roster) -> Result<Vec<ObservedTenant>, EngineError> {
        self.observer.observe(roster).await
    }

    /// Compute a plan from a prepared roster and observations.
    pub fn plan(
        &self,
        roster: &Roster,
        observed: &[ObservedTenant],
        options: &DiffOptions,
    ) -> Result<Plan, EngineError> {
        Ok(diff(roster, observed, options)?)
    }

    /// Bring every roster tenant up, leaving other environments alone.
    ///
    /// Tenants already running with their allocation are untouched; drifted
    /// or degraded ones are recreated.
    #[instrument(skip_all, fields(tenants = roster.len(), mode = mode.label()))]
    pub async fn provision_all(
        &self,
        roster: &Roster,
        mode: &ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchOutcome, EngineError> {
        let options = DiffOptions {
            remove_orphans: false,
            repair_degraded: true,
        };
        self.converge(roster, &options, mode, cancel).await
    }

    /// Full reconcile pass: create missing, remove orphans, recreate drifted.
    #[instrument(skip_all, fields(tenants = roster.len(), mode = mode.label()))]
    pub async fn reconcile(
        &self,
        roster: &Roster,
        options: &DiffOptions,
        mode: &ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchOutcome, EngineError> {
        self.converge(roster, options, mode, cancel).await
    }

    /// Everything a reconcile pass would do, without doing it.
    ///
    /// The returned roster carries the allocations and credentials the pass
    /// would persist.
    pub async fn preview(
        &self,
        roster: &Roster,
        options: &DiffOptions,
    ) -> Result<(Prepared, Plan), EngineError> {
        roster.validate()?;
        let observed = self.observe(roster).await?;
        let reservations = in_use_reservations(roster, &observed);

        let prepared = self.prepare(roster, &reservations)?;
        let plan = self.plan(&prepared.roster, &observed, options)?;
        Ok((prepared, plan))
    }

    async fn converge(
        &self,
        roster: &Roster,
        options: &DiffOptions,
        mode: &ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchOutcome, EngineError> {
        let (prepared, plan) = self.preview(roster, options).await?;
        let summary = plan.summary();
        info!(
            creates = summary.creates,
            removes = summary.removes,
            reallocations = summary.reallocations,
            unchanged = summary.unchanged,
            "Plan computed"
        );

        let report = self.executor.execute(&plan, mode, cancel).await;
        Ok(BatchOutcome::new(prepared, summary, report))
    }

    /// Tear environments down.
    ///
    /// With [`TeardownScope::Everything`], environments outside the roster
    /// are removed too; if the substrate cannot list them, only the roster
    /// tenants are torn down.
    #[instrument(skip_all, fields(tenants = roster.len(), mode = mode.label(), scope = ?scope))]
    pub async fn teardown(
        &self,
        roster: &Roster,
        scope: TeardownScope,
        mode: &ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionReport, EngineError> {
        roster.validate()?;
        let mut ids: Vec<TenantId> = roster.ids().cloned().collect();

        if scope == TeardownScope::Everything {
            match self.observer.discover().await {
                Ok(found) => {
                    let known: HashSet<TenantId> = ids.iter().cloned().collect();
                    ids.extend(found.into_iter().filter(|id| !known.contains(id)));
                }
                Err(e) => warn!(error = %e, "Could not list environments, tearing down roster only"),
            }
        }

        let plan = Plan::from_groups(ids.into_iter().map(ActionGroup::remove).collect());
        Ok(self.executor.execute(&plan, mode, cancel).await)
    }

    /// Bring one roster tenant up.
    #[instrument(skip(self, roster, cancel))]
    pub async fn provision_one(
        &self,
        roster: &Roster,
        tenant_id: &TenantId,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchOutcome, EngineError> {
        self.single(roster, tenant_id, ActionGroup::create, cancel).await
    }

    /// Tear one roster tenant down and bring it back up.
    #[instrument(skip(self, roster, cancel))]
    pub async fn recreate_one(
        &self,
        roster: &Roster,
        tenant_id: &TenantId,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchOutcome, EngineError> {
        self.single(roster, tenant_id, ActionGroup::recreate, cancel).await
    }

    async fn single(
        &self,
        roster: &Roster,
        tenant_id: &TenantId,
        group: fn(TenantRecord) -> ActionGroup,
        cancel: watch::Receiver<bool>,
    ) -> Result<BatchOutcome, EngineError> {
        roster.validate()?;
        if !roster.contains(tenant_id) {
            return Err(EngineError::UnknownTenant(tenant_id.clone()));
        }

        let observed = self.observe(roster).await?;
        let prepared = self.prepare(roster, &in_use_reservations(roster, &observed))?;
        let record = prepared
            .roster
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTenant(tenant_id.clone()))?;

        let plan = Plan::from_groups(vec![group(record)]);
        let summary = plan.summary();
        let report = self
            .executor
            .execute(&plan, &ExecutionMode::Sequential, cancel)
            .await;
        Ok(BatchOutcome::new(prepared, summary, report))
    }

    /// Tear one environment down, whether or not it is in the roster.
    #[instrument(skip(self, cancel))]
    pub async fn remove_one(
        &self,
        tenant_id: &TenantId,
        cancel: watch::Receiver<bool>,
    ) -> ExecutionReport {
        let plan = Plan::from_groups(vec![ActionGroup::remove(tenant_id.clone())]);
        self.executor
            .execute(&plan, &ExecutionMode::Sequential, cancel)
            .await
    }

    /// Status of one tenant.
    pub async fn status_one(
        &self,
        roster: &Roster,
        tenant_id: &TenantId,
    ) -> Result<TenantStatus, EngineError> {
        let observed = self.observer.observe_one(tenant_id).await?;
        let record = roster.get(tenant_id);
        if record.is_none() && !observed.is_present() {
            return Err(EngineError::UnknownTenant(tenant_id.clone()));
        }
        Ok(TenantStatus::new(record, observed))
    }

    /// Status of every roster tenant, then every orphan.
    pub async fn list_all(&self, roster: &Roster) -> Result<Vec<TenantStatus>, EngineError> {
        let mut observed = self.observe(roster).await?;

        let mut statuses = Vec::with_capacity(observed.len());
        for record in roster {
            if let Some(pos) = observed.iter().position(|o| o.tenant_id == record.tenant_id) {
                statuses.push(TenantStatus::new(Some(record), observed.swap_remove(pos)));
            } else {
                let absent = ObservedTenant::absent(record.tenant_id.clone());
                statuses.push(TenantStatus::new(Some(record), absent));
            }
        }

        observed.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        statuses.extend(
            observed
                .into_iter()
                .filter(ObservedTenant::is_present)
                .map(|o| TenantStatus::new(None, o)),
        );
        Ok(statuses)
    }
}

/// Ports and subnets held by present environments.
///
/// A value the tenant's own record still claims is left out, so the
/// allocator keeps it where it is. Anything else an environment holds,
/// whether it belongs to an orphan or to a roster tenant whose field was
/// blanked or drifted, stays off limits until that environment is gone.
fn in_use_reservations(roster: &Roster, observed: &[ObservedTenant]) -> Reservations {
    let mut reservations = Reservations::none();
    for tenant in observed.iter().filter(|o| o.is_present()) {
        let record = roster.get(&tenant.tenant_id);
        if let Some(port) = tenant.bound_port {
            if record.and_then(|r| r.port) != Some(port) {
                reservations.reserve_port(port);
            }
        }
        if let Some(subnet_id) = tenant.subnet_id {
            if record.and_then(|r| r.subnet_id) != Some(subnet_id) {
                reservations.reserve_subnet(subnet_id);
            }
        }
    }
    reservations
}
