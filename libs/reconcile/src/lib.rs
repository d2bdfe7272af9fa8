//! Reconciliation primitives for lab tenants.
//!
//! This library turns desired state (the roster) and observed state (what
//! the substrate reports as running) into a plan of per-tenant actions.
//! Key concepts:
//!
//! - **Desired state**: the allocated roster.
//! - **Observed state**: one [`ObservedTenant`] per environment found.
//! - **Plan**: one [`ActionGroup`] per tenant that needs work.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Tenants are matched by `tenant_id` only
//! - Groups for different tenants are independent; actions inside a group
//!   are strictly ordered
//! - A tenant that is present with a matching allocation gets no actions

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use lab_allocator::Field;
use lab_roster::{Roster, RosterError, TenantId, TenantRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired roster is structurally invalid.
    #[error(transparent)]
    Invalid(#[from] RosterError),

    /// A desired tenant has no port or subnet yet; allocate first.
    #[error("tenant '{0}' has no allocation; run allocation before reconciling")]
    Unallocated(TenantId),
}

// ============================================================================
// Observed state
// ============================================================================

/// State of one container role inside a tenant environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// The container is up.
    Running,

    /// The container exists but is not running.
    Stopped,

    /// The container does not exist.
    Absent,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Absent => f.write_str("absent"),
        }
    }
}

/// A tenant environment as reported by the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTenant {
    /// Tenant the environment belongs to.
    pub tenant_id: TenantId,

    /// State per container role (e.g. `kali-jump`).
    pub containers: BTreeMap<String, ContainerState>,

    /// Host port the environment is published on.
    pub bound_port: Option<u16>,

    /// Subnet id the environment's network was created with.
    pub subnet_id: Option<u8>,
}

impl ObservedTenant {
    /// An environment with no containers.
    pub fn absent(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            containers: BTreeMap::new(),
            bound_port: None,
            subnet_id: None,
        }
    }

    /// Record a container role.
    pub fn with_container(mut self, role: impl Into<String>, state: ContainerState) -> Self {
        self.containers.insert(role.into(), state);
        self
    }

    /// Record the bound host port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.bound_port = Some(port);
        self
    }

    /// Record the network subnet id.
    pub fn with_subnet(mut self, subnet_id: u8) -> Self {
        self.subnet_id = Some(subnet_id);
        self
    }

    /// Returns true if at least one container exists.
    pub fn is_present(&self) -> bool {
        self.containers
            .values()
            .any(|s| !matches!(s, ContainerState::Absent))
    }

    /// Returns true if every known container is running.
    pub fn is_healthy(&self) -> bool {
        !self.containers.is_empty()
            && self
                .containers
                .values()
                .all(|s| matches!(s, ContainerState::Running))
    }

    /// Number of running containers.
    pub fn running_count(&self) -> usize {
        self.containers
            .values()
            .filter(|s| matches!(s, ContainerState::Running))
            .count()
    }
}

/// How a desired tenant compares to what is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Convergence {
    /// Present, healthy, allocation matches.
    Converged,

    /// Present with matching allocation, but some containers are down.
    Degraded,

    /// Present but running with a different port or subnet.
    Diverged,

    /// Not running at all.
    Missing,
}

impl Convergence {
    /// Returns true if the tenant has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

impl fmt::Display for Convergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => f.write_str("converged"),
            Self::Degraded => f.write_str("degraded"),
            Self::Diverged => f.write_str("diverged"),
            Self::Missing => f.write_str("missing"),
        }
    }
}

/// Fields whose running value differs from the record, as
/// `(field, running, desired)`.
fn drift(record: &TenantRecord, observed: &ObservedTenant) -> Vec<(Field, u32, u32)> {
    let mut out = Vec::new();
    if let (Some(running), Some(desired)) = (observed.bound_port, record.port) {
        if running != desired {
            out.push((Field::Port, u32::from(running), u32::from(desired)));
        }
    }
    if let (Some(running), Some(desired)) = (observed.subnet_id, record.subnet_id) {
        if running != desired {
            out.push((Field::Subnet, u32::from(running), u32::from(desired)));
        }
    }
    out
}

/// Classify a desired tenant against its observation.
pub fn classify(record: &TenantRecord, observed: Option<&ObservedTenant>) -> Convergence {
    let Some(observed) = observed.filter(|o| o.is_present()) else {
        return Convergence::Missing;
    };
    if !drift(record, observed).is_empty() {
        Convergence::Diverged
    } else if observed.is_healthy() {
        Convergence::Converged
    } else {
        Convergence::Degraded
    }
}

// ============================================================================
// Actions and plans
// ============================================================================

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Bring up the tenant's environment with its recorded allocation.
    Create(TenantRecord),

    /// Tear down the tenant's environment.
    Remove(TenantId),

    /// Note that a running value differs from the desired one.
    Reallocate {
        tenant_id: TenantId,
        field: Field,
        old: u32,
        new: u32,
    },
}

impl Action {
    /// Tenant this action touches.
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::Create(record) => &record.tenant_id,
            Self::Remove(tenant_id) => tenant_id,
            Self::Reallocate { tenant_id, .. } => tenant_id,
        }
    }

    /// Short verb for logs and tables.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Remove(_) => "remove",
            Self::Reallocate { .. } => "reallocate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(record) => match record.allocation() {
                Some(a) => write!(
                    f,
                    "create {} (port {}, subnet {})",
                    record.tenant_id, a.port, a.subnet_id
                ),
                None => write!(f, "create {}", record.tenant_id),
            },
            Self::Remove(tenant_id) => write!(f, "remove {}", tenant_id),
            Self::Reallocate {
                tenant_id,
                field,
                old,
                new,
            } => write!(f, "reallocate {} {}: {} -> {}", tenant_id, field, old, new),
        }
    }
}

/// Every action for one tenant, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGroup {
    /// Tenant the group belongs to.
    pub tenant_id: TenantId,

    /// Actions, applied strictly in order.
    pub actions: Vec<Action>,
}

impl ActionGroup {
    /// A group creating the tenant.
    pub fn create(record: TenantRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            actions: vec![Action::Create(record)],
        }
    }

    /// A group removing the tenant.
    pub fn remove(tenant_id: TenantId) -> Self {
        Self {
            actions: vec![Action::Remove(tenant_id.clone())],
            tenant_id,
        }
    }

    /// A group tearing the tenant down and bringing it back up.
    pub fn recreate(record: TenantRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            actions: vec![
                Action::Remove(record.tenant_id.clone()),
                Action::Create(record),
            ],
        }
    }
}

/// Counts of planned work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Tenants to create (including recreates).
    pub creates: usize,

    /// Tenants to remove (including recreates).
    pub removes: usize,

    /// Fields found drifted.
    pub reallocations: usize,

    /// Desired tenants needing nothing.
    pub unchanged: usize,
}

/// Ordered list of per-tenant action groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Groups in dispatch order.
    pub groups: Vec<ActionGroup>,

    /// Desired tenants that needed no action.
    pub unchanged: Vec<TenantId>,
}

impl Plan {
    /// A plan from explicit groups.
    pub fn from_groups(groups: Vec<ActionGroup>) -> Self {
        Self {
            groups,
            unchanged: Vec::new(),
        }
    }

    /// Returns true if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of tenant groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Iterate over all actions in dispatch order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.groups.iter().flat_map(|g| g.actions.iter())
    }

    /// Count planned work.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            unchanged: self.unchanged.len(),
            ..PlanSummary::default()
        };
        for action in self.actions() {
            match action {
                Action::Create(_) => summary.creates += 1,
                Action::Remove(_) => summary.removes += 1,
                Action::Reallocate { .. } => summary.reallocations += 1,
            }
        }
        summary
    }
}

// ============================================================================
// Diff
// ============================================================================

/// Knobs for [`diff`].
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Remove environments whose tenant is not in the roster.
    pub remove_orphans: bool,

    /// Recreate present tenants that have containers down.
    pub repair_degraded: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            remove_orphans: true,
            repair_degraded: false,
        }
    }
}

impl DiffOptions {
    /// Options for a provision-only run: create what is missing, touch
    /// nothing else.
    pub fn provision_only() -> Self {
        Self {
            remove_orphans: false,
            repair_degraded: false,
        }
    }
}

/// Compute the plan that moves `observed` to `desired`.
///
/// Orphan removals come first (sorted by tenant ID) so their ports are
/// released early in sequential runs; desired tenants follow in roster order.
pub fn diff(
    desired: &Roster,
    observed: &[ObservedTenant],
    options: &DiffOptions,
) -> Result<Plan, ReconcileError> {
    desired.validate()?;
    if let Some(record) = desired.iter().find(|r| r.needs_allocation()) {
        return Err(ReconcileError::Unallocated(record.tenant_id.clone()));
    }

    let present: BTreeMap<&TenantId, &ObservedTenant> = observed
        .iter()
        .filter(|o| o.is_present())
        .map(|o| (&o.tenant_id, o))
        .collect();
    let desired_ids: HashSet<&TenantId> = desired.ids().collect();

    let mut plan = Plan::default();

    if options.remove_orphans {
        for tenant_id in present.keys().filter(|id| !desired_ids.contains(*id)) {
            debug!(tenant_id = %tenant_id, "Planning removal of orphan");
            plan.groups.push(ActionGroup::remove((*tenant_id).clone()));
        }
    }

    for record in desired {
        let Some(running) = present.get(&record.tenant_id) else {
            debug!(tenant_id = %record.tenant_id, "Planning creation");
            plan.groups.push(ActionGroup::create(record.clone()));
            continue;
        };

        let drifted = drift(record, running);
        if !drifted.is_empty() {
            debug!(tenant_id = %record.tenant_id, fields = drifted.len(), "Planning recreate for drift");
            let mut actions: Vec<Action> = drifted
                .into_iter()
                .map(|(field, old, new)| Action::Reallocate {
                    tenant_id: record.tenant_id.clone(),
                    field,
                    old,
                    new,
                })
                .collect();
            actions.push(Action::Remove(record.tenant_id.clone()));
            actions.push(Action::Create(record.clone()));
            plan.groups.push(ActionGroup {
                tenant_id: record.tenant_id.clone(),
                actions,
            });
        } else if options.repair_degraded && !running.is_healthy() {
            debug!(tenant_id = %record.tenant_id, "Planning recreate for degraded tenant");
            plan.groups.push(ActionGroup::recreate(record.clone()));
        } else {
            plan.unchanged.push(record.tenant_id.clone());
        }
    }

    Ok(plan)
}
