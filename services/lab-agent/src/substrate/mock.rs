//! In-memory substrate for tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lab_reconcile::{ContainerState, ObservedTenant};
use lab_roster::{Allocation, TenantId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BringUp, Substrate, SubstrateError};
use crate::config::DEFAULT_ROLES;

#[derive(Debug, Clone)]
struct MockEnvironment {
    allocation: Allocation,
    running: bool,
}

/// Substrate that keeps environments in a map.
///
/// Failure modes are opt-in:
/// - `failing_for` makes bring-up fail for chosen tenants
/// - `hanging_for` makes bring-up never return
/// - `with_capacity` rejects bring-up once N environments exist
#[derive(Debug)]
pub struct MockSubstrate {
    environments: Mutex<BTreeMap<TenantId, MockEnvironment>>,
    roles: Vec<String>,
    failing: HashSet<TenantId>,
    hanging: HashSet<TenantId>,
    capacity: Option<usize>,
    latency: Duration,
    bring_up_latency: Duration,
    bring_up_calls: AtomicUsize,
    tear_down_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSubstrate {
    /// Create an empty mock substrate.
    pub fn new() -> Self {
        Self {
            environments: Mutex::new(BTreeMap::new()),
            roles: DEFAULT_ROLES.iter().map(|r| r.to_string()).collect(),
            failing: HashSet::new(),
            hanging: HashSet::new(),
            capacity: None,
            latency: Duration::ZERO,
            bring_up_latency: Duration::ZERO,
            bring_up_calls: AtomicUsize::new(0),
            tear_down_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail every bring-up for this tenant.
    pub fn failing_for(mut self, tenant_id: TenantId) -> Self {
        self.failing.insert(tenant_id);
        self
    }

    /// Never complete bring-up for this tenant.
    pub fn hanging_for(mut self, tenant_id: TenantId) -> Self {
        self.hanging.insert(tenant_id);
        self
    }

    /// Reject bring-up once `max` environments exist.
    pub fn with_capacity(mut self, max: usize) -> Self {
        self.capacity = Some(max);
        self
    }

    /// Delay every lifecycle call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay bring-up only, on top of any shared latency.
    pub fn with_bring_up_latency(mut self, latency: Duration) -> Self {
        self.bring_up_latency = latency;
        self
    }

    /// Seed a running environment.
    pub fn with_running(self, tenant_id: TenantId, allocation: Allocation) -> Self {
        self.seed(tenant_id, allocation, true)
    }

    /// Seed an environment whose containers have all stopped.
    pub fn with_stopped(self, tenant_id: TenantId, allocation: Allocation) -> Self {
        self.seed(tenant_id, allocation, false)
    }

    fn seed(mut self, tenant_id: TenantId, allocation: Allocation, running: bool) -> Self {
        self.environments
            .get_mut()
            .insert(tenant_id, MockEnvironment { allocation, running });
        self
    }

    /// Tenants with an environment, sorted.
    pub async fn tenants(&self) -> Vec<TenantId> {
        self.environments.lock().await.keys().cloned().collect()
    }

    /// Allocation the tenant's environment was brought up with.
    pub async fn allocation_of(&self, tenant_id: &TenantId) -> Option<Allocation> {
        self.environments
            .lock()
            .await
            .get(tenant_id)
            .map(|env| env.allocation)
    }

    /// Number of bring-up calls made so far.
    pub fn bring_up_calls(&self) -> usize {
        self.bring_up_calls.load(Ordering::SeqCst)
    }

    /// Number of tear-down calls made so far.
    pub fn tear_down_calls(&self) -> usize {
        self.tear_down_calls.load(Ordering::SeqCst)
    }

    /// Highest number of lifecycle calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MockSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn bring_up(&self, request: &BringUp) -> Result<(), SubstrateError> {
        self.bring_up_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter();

        info!(
            tenant_id = %request.tenant_id,
            port = request.allocation.port,
            subnet_id = request.allocation.subnet_id,
            "[MOCK] Bringing up environment"
        );

        if self.hanging.contains(&request.tenant_id) {
            std::future::pending::<()>().await;
        }

        self.simulate_latency().await;
        if !self.bring_up_latency.is_zero() {
            tokio::time::sleep(self.bring_up_latency).await;
        }

        if self.failing.contains(&request.tenant_id) {
            return Err(SubstrateError::Rejected(format!(
                "injected failure for {}",
                request.tenant_id
            )));
        }

        let mut environments = self.environments.lock().await;
        if let Some(max) = self.capacity {
            if !environments.contains_key(&request.tenant_id) && environments.len() >= max {
                return Err(SubstrateError::Rejected(format!(
                    "host capacity of {max} environments reached"
                )));
            }
        }

        environments.insert(
            request.tenant_id.clone(),
            MockEnvironment {
                allocation: request.allocation,
                running: true,
            },
        );
        Ok(())
    }

    async fn tear_down(&self, tenant_id: &TenantId) -> Result<(), SubstrateError> {
        self.tear_down_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter();

        info!(tenant_id = %tenant_id, "[MOCK] Tearing down environment");
        self.simulate_latency().await;

        self.environments.lock().await.remove(tenant_id);
        Ok(())
    }

    async fn status(&self, tenant_id: &TenantId) -> Result<ObservedTenant, SubstrateError> {
        debug!(tenant_id = %tenant_id, "[MOCK] Checking status");

        let environments = self.environments.lock().await;
        let mut observed = ObservedTenant::absent(tenant_id.clone());

        let state = match environments.get(tenant_id) {
            Some(env) => {
                observed.bound_port = env.running.then_some(env.allocation.port);
                observed.subnet_id = Some(env.allocation.subnet_id);
                if env.running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                }
            }
            None => ContainerState::Absent,
        };
        for role in &self.roles {
            observed.containers.insert(role.clone(), state);
        }

        Ok(observed)
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, SubstrateError> {
        Ok(self.tenants().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn request(s: &str, port: u16, subnet_id: u8) -> BringUp {
        BringUp {
            tenant_id: id(s),
            display_name: s.to_uppercase(),
            allocation: Allocation { port, subnet_id },
            secret: None,
        }
    }

    #[tokio::test]
    async fn bring_up_then_status_reports_running() {
        let substrate = MockSubstrate::new();
        substrate.bring_up(&request("s1", 2222, 9)).await.unwrap();

        let observed = substrate.status(&id("s1")).await.unwrap();
        assert!(observed.is_healthy());
        assert_eq!(observed.bound_port, Some(2222));
        assert_eq!(observed.subnet_id, Some(9));
        assert_eq!(observed.running_count(), DEFAULT_ROLES.len());
    }

    #[tokio::test]
    async fn tear_down_of_absent_tenant_succeeds() {
        let substrate = MockSubstrate::new();
        substrate.tear_down(&id("ghost")).await.unwrap();

        let observed = substrate.status(&id("ghost")).await.unwrap();
        assert!(!observed.is_present());
        assert_eq!(substrate.tear_down_calls(), 1);
    }

    #[tokio::test]
    async fn injected_failure_leaves_no_environment() {
        let substrate = MockSubstrate::new().failing_for(id("s1"));
        let err = substrate.bring_up(&request("s1", 2222, 1)).await.unwrap_err();
        assert!(matches!(err, SubstrateError::Rejected(_)));
        assert!(substrate.tenants().await.is_empty());
    }

    #[tokio::test]
    async fn capacity_ceiling_rejects_extra_tenants() {
        let substrate = MockSubstrate::new().with_capacity(2);
        substrate.bring_up(&request("a", 2222, 1)).await.unwrap();
        substrate.bring_up(&request("b", 2223, 2)).await.unwrap();
        assert!(substrate.bring_up(&request("c", 2224, 3)).await.is_err());

        // Re-running an existing tenant is not a new environment.
        substrate.bring_up(&request("a", 2222, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_environment_is_present_but_unhealthy() {
        let substrate = MockSubstrate::new().with_stopped(
            id("s1"),
            Allocation {
                port: 2222,
                subnet_id: 4,
            },
        );
        let observed = substrate.status(&id("s1")).await.unwrap();
        assert!(observed.is_present());
        assert!(!observed.is_healthy());
        assert_eq!(observed.bound_port, None);
    }
}
