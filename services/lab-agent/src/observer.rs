//! State observer.
//!
//! Builds the observed half of a reconcile pass: every tenant in the roster
//! plus every tenant the substrate knows about, each with a fresh status.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lab_reconcile::ObservedTenant;
use lab_roster::{Roster, TenantId};
use tokio::sync::Semaphore;
use tracing::{debug, Instrument};

use crate::error::EngineError;
use crate::substrate::{with_timeout, Substrate, SubstrateError};

/// Reads observed state from a substrate.
#[derive(Clone)]
pub struct StateObserver {
    substrate: Arc<dyn Substrate>,
    call_timeout: Duration,
    concurrency: usize,
}

impl StateObserver {
    /// Create an observer issuing at most `concurrency` status calls at once.
    pub fn new(substrate: Arc<dyn Substrate>, call_timeout: Duration, concurrency: usize) -> Self {
        Self {
            substrate,
            call_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Tenants with an environment on the host.
    pub async fn discover(&self) -> Result<Vec<TenantId>, EngineError> {
        with_timeout("list tenants", self.call_timeout, self.substrate.list_tenants())
            .await
            .map_err(|source| EngineError::Observe {
                target: "tenant list".to_string(),
                source,
            })
    }

    /// Status of one tenant.
    pub async fn observe_one(&self, tenant_id: &TenantId) -> Result<ObservedTenant, EngineError> {
        with_timeout("status", self.call_timeout, self.substrate.status(tenant_id))
            .await
            .map_err(|source| EngineError::Observe {
                target: tenant_id.to_string(),
                source,
            })
    }

    /// Status of every roster tenant and every discovered tenant, sorted by ID.
    ///
    /// Any failed call aborts the pass.
    pub async fn observe(&self, roster: &Roster) -> Result<Vec<ObservedTenant>, EngineError> {
        let mut ids: BTreeSet<TenantId> = self.discover().await?.into_iter().collect();
        ids.extend(roster.ids().cloned());
        debug!(tenants = ids.len(), "Observing tenants");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(ids.len());

        for tenant_id in ids {
            let permit = semaphore.clone().acquire_owned().await;
            let observer = self.clone();
            let span = tracing::debug_span!("observe", tenant_id = %tenant_id);
            handles.push(tokio::spawn(
                async move {
                    let result = observer.observe_one(&tenant_id).await;
                    drop(permit);
                    result
                }
                .instrument(span),
            ));
        }

        let mut observed = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => observed.push(result?),
                Err(e) => {
                    return Err(EngineError::Observe {
                        target: "tenant status".to_string(),
                        source: SubstrateError::Rejected(format!(
                            "status task failed: {e}"
                        )),
                    })
                }
            }
        }
        Ok(observed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MockSubstrate;
    use lab_roster::{Allocation, TenantRecord};

    fn id(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn observes_roster_and_orphans() {
        let substrate = MockSubstrate::new().with_running(
            id("orphan"),
            Allocation {
                port: 2230,
                subnet_id: 40,
            },
        );
        let observer = StateObserver::new(Arc::new(substrate), Duration::from_secs(5), 2);
        let roster = Roster::new(vec![TenantRecord::new(id("s1"), "S1")]);

        let observed = observer.observe(&roster).await.unwrap();

        let ids: Vec<_> = observed.iter().map(|o| o.tenant_id.as_str()).collect();
        assert_eq!(ids, vec!["orphan", "s1"]);
        assert!(observed[0].is_present());
        assert!(!observed[1].is_present());
    }
}
