//! # lab-roster
//!
//! Desired-state model for lab-fleet: one [`TenantRecord`] per roster row.
//!
//! ## Design Principles
//!
//! - Tenant IDs are user-supplied and stable; names are free-form labels
//! - IDs are validated on construction, so an invalid ID cannot exist
//! - A roster is a plain value; every pipeline stage returns a new one
//! - Unset `port`/`subnet_id` means "needs allocation"
//!
//! ## Roster Format
//!
//! The on-disk form is TOML, one `[[tenant]]` table per row:
//!
//! ```toml
//! [[tenant]]
//! id = "student001"
//! name = "Ada Lovelace"
//! port = 2222
//! subnet_id = 17
//! ```
//!
//! Blank cells (`port = ""`) are read as unset so spreadsheet exports
//! round-trip.

mod cell;
mod error;
mod roster;
mod tenant;

pub use error::RosterError;
pub use roster::Roster;
pub use tenant::{Allocation, TenantId, TenantRecord};

/// First host port handed out to tenants.
pub const PORT_BASE: u16 = 2222;

/// Lowest usable subnet id (the third octet of `172.20.X.0/24`).
pub const SUBNET_MIN: u8 = 1;

/// Highest usable subnet id.
pub const SUBNET_MAX: u8 = 254;

/// Number of distinct subnet ids, and therefore the tenant ceiling per host.
pub const SUBNET_COUNT: usize = (SUBNET_MAX - SUBNET_MIN + 1) as usize;
