//! lab-fleet agent library
//!
//! Provisions and reconciles isolated lab environments on a single host,
//! one per roster tenant. The agent turns a roster into running
//! environments through a narrow [`Substrate`] interface and reports one
//! outcome per tenant.
//!
//! ## Architecture
//!
//! ```text
//! LabEngine
//! ├── allocator + credentials   (fill the roster up front)
//! ├── StateObserver             (status of every known tenant)
//! ├── lab_reconcile::diff       (observed vs desired → plan)
//! └── Executor                  (sequential or bounded parallel)
//!     └── Substrate             (docker compose, or in-memory)
//! ```
//!
//! ## Modules
//!
//! - `engine`: lifecycle operations (provision, reconcile, teardown, ...)
//! - `executor`: plan execution with per-tenant failure isolation
//! - `capacity`: binary search for the largest cohort the host sustains
//! - `substrate`: the substrate trait and its adapters

pub mod capacity;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod executor;
pub mod observer;
pub mod substrate;

// Re-export commonly used types
pub use capacity::{
    CapacityProber, CapacityReport, CapacitySearch, CohortRunner, EngineCohort, ProbeRecord,
};
pub use config::Config;
pub use credentials::{CredentialSource, WordCredentials};
pub use engine::{BatchOutcome, LabEngine, Prepared, TeardownScope, TenantStatus};
pub use error::EngineError;
pub use executor::{
    ConfirmParallel, ExecutionMode, ExecutionReport, Executor, Outcome, ParallelApproval,
    TenantReport,
};
pub use substrate::{BringUp, ComposeSubstrate, MockSubstrate, Substrate, SubstrateError};
