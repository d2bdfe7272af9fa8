//! Engine errors.
//!
//! These are the pre-flight failures that abort a whole batch. Failures of
//! individual substrate calls never surface here; they end up in the
//! per-tenant outcome of an [`ExecutionReport`](crate::ExecutionReport).

use lab_allocator::AllocationError;
use lab_reconcile::ReconcileError;
use lab_roster::{RosterError, TenantId};
use thiserror::Error;

use crate::substrate::SubstrateError;

/// Batch-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The roster failed validation.
    #[error(transparent)]
    Invalid(#[from] RosterError),

    /// Allocation could not complete.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// The plan could not be computed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Observed state could not be read.
    #[error("failed to observe {target}: {source}")]
    Observe {
        target: String,
        #[source]
        source: SubstrateError,
    },

    /// The named tenant is not in the roster.
    #[error("tenant {0} is not in the roster")]
    UnknownTenant(TenantId),
}

impl EngineError {
    /// Returns true if the error comes from the roster itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Invalid(_) | Self::Allocation(AllocationError::Invalid(_))
        )
    }
}
