//! Substrate interface.
//!
//! The substrate is whatever actually creates and destroys tenant
//! environments. The engine only ever talks to it through [`Substrate`]:
//! - `bring_up` / `tear_down` for lifecycle
//! - `status` / `list_tenants` for observation
//!
//! Two adapters ship with the crate: [`ComposeSubstrate`] for docker
//! compose, and [`MockSubstrate`] for tests and dry runs.

mod compose;
mod mock;

use std::time::Duration;

use async_trait::async_trait;
use lab_reconcile::ObservedTenant;
use lab_roster::{Allocation, TenantId, TenantRecord};
use thiserror::Error;

pub use compose::ComposeSubstrate;
pub use mock::MockSubstrate;

/// Substrate call errors. Always scoped to a single tenant or query.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The external command could not be started.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The external command exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The call did not finish in time.
    #[error("{operation} timed out after {}s", elapsed.as_secs_f64())]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// The substrate answered with something we could not read.
    #[error("unexpected substrate output: {0}")]
    Parse(String),

    /// The substrate refused the request.
    #[error("{0}")]
    Rejected(String),
}

impl SubstrateError {
    /// Returns true if the call timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Everything needed to bring one tenant environment up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringUp {
    /// Tenant to create.
    pub tenant_id: TenantId,

    /// Display name handed to the environment.
    pub display_name: String,

    /// Host port and subnet.
    pub allocation: Allocation,

    /// Login credential, if one has been issued.
    pub secret: Option<String>,
}

impl BringUp {
    /// Build a request from a record; `None` if the record is unallocated.
    pub fn from_record(record: &TenantRecord) -> Option<Self> {
        Some(Self {
            tenant_id: record.tenant_id.clone(),
            display_name: record.display_name.clone(),
            allocation: record.allocation()?,
            secret: record.secret.clone(),
        })
    }
}

/// Await a substrate call, failing with [`SubstrateError::Timeout`] once
/// `limit` has passed. The call future is dropped on timeout.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> Result<T, SubstrateError>
where
    F: std::future::Future<Output = Result<T, SubstrateError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SubstrateError::Timeout {
            operation: operation.to_string(),
            elapsed: limit,
        }),
    }
}

/// Container-orchestration capability used by the engine.
///
/// Calls block until the substrate has finished; callers apply their own
/// timeouts.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Create (or converge) a tenant environment.
    async fn bring_up(&self, request: &BringUp) -> Result<(), SubstrateError>;

    /// Destroy a tenant environment. Tearing down an absent tenant succeeds.
    async fn tear_down(&self, tenant_id: &TenantId) -> Result<(), SubstrateError>;

    /// Report the current state of a tenant environment.
    async fn status(&self, tenant_id: &TenantId) -> Result<ObservedTenant, SubstrateError>;

    /// Every tenant with an environment on this host, running or not.
    async fn list_tenants(&self) -> Result<Vec<TenantId>, SubstrateError>;
}
