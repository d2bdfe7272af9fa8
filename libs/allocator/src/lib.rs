//! Allocation of host ports and subnet ids to lab tenants.
//!
//! This library provides:
//! - Duplicate detection over the roster (the derived allocation table)
//! - Sequential port assignment upward from [`PORT_BASE`]
//! - Hash-seeded subnet assignment with linear probing over `[1,254]`
//!
//! Allocation is a pure function: it takes a roster and returns a new one.
//! Either every record that needs a value gets one, or nothing changes.
//!
//! # Invariants
//!
//! - No two tenants share a port, and no two share a subnet id
//! - A value held by exactly one tenant is never moved
//! - A value held by several tenants is released for all of them
//! - Ports and subnets are judged independently

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use lab_roster::{Roster, RosterError, TenantId, PORT_BASE, SUBNET_COUNT, SUBNET_MAX, SUBNET_MIN};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The roster failed validation before allocation started.
    #[error(transparent)]
    Invalid(#[from] RosterError),

    /// No free value is left for this tenant.
    #[error("{field} space exhausted: no free value for tenant '{tenant_id}' ({space} values available)")]
    Exhausted {
        field: Field,
        tenant_id: TenantId,
        space: usize,
    },
}

/// Which half of an allocation a change or conflict concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// Host port.
    Port,

    /// Subnet id.
    Subnet,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port => f.write_str("port"),
            Self::Subnet => f.write_str("subnet_id"),
        }
    }
}

// ============================================================================
// Allocation table
// ============================================================================

/// Several tenants claiming the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Field in conflict.
    pub field: Field,

    /// The shared value.
    pub value: u32,

    /// Every tenant holding it, in roster order.
    pub tenants: Vec<TenantId>,
}

/// Derived `value → tenants` maps, rebuilt from the roster on every run.
#[derive(Debug, Clone, Default)]
pub struct AllocationTable {
    ports: BTreeMap<u16, Vec<TenantId>>,
    subnets: BTreeMap<u8, Vec<TenantId>>,
}

impl AllocationTable {
    /// Build the table from the values currently in the roster.
    pub fn from_roster(roster: &Roster) -> Self {
        let mut table = Self::default();
        for record in roster {
            if let Some(port) = record.port {
                table
                    .ports
                    .entry(port)
                    .or_default()
                    .push(record.tenant_id.clone());
            }
            if let Some(subnet_id) = record.subnet_id {
                table
                    .subnets
                    .entry(subnet_id)
                    .or_default()
                    .push(record.tenant_id.clone());
            }
        }
        table
    }

    /// The single owner of a port, if exactly one tenant holds it.
    pub fn port_owner(&self, port: u16) -> Option<&TenantId> {
        match self.ports.get(&port).map(Vec::as_slice) {
            Some([owner]) => Some(owner),
            _ => None,
        }
    }

    /// The single owner of a subnet id, if exactly one tenant holds it.
    pub fn subnet_owner(&self, subnet_id: u8) -> Option<&TenantId> {
        match self.subnets.get(&subnet_id).map(Vec::as_slice) {
            Some([owner]) => Some(owner),
            _ => None,
        }
    }

    /// Ports held by exactly one tenant.
    pub fn valid_ports(&self) -> BTreeSet<u16> {
        self.ports
            .iter()
            .filter(|(_, owners)| owners.len() == 1)
            .map(|(port, _)| *port)
            .collect()
    }

    /// Subnet ids held by exactly one tenant.
    pub fn valid_subnets(&self) -> BTreeSet<u8> {
        self.subnets
            .iter()
            .filter(|(_, owners)| owners.len() == 1)
            .map(|(subnet_id, _)| *subnet_id)
            .collect()
    }

    /// Values claimed by more than one tenant, ports first.
    pub fn conflicts(&self) -> Vec<Conflict> {
        let ports = self
            .ports
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(port, owners)| Conflict {
                field: Field::Port,
                value: u32::from(*port),
                tenants: owners.clone(),
            });
        let subnets = self
            .subnets
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(subnet_id, owners)| Conflict {
                field: Field::Subnet,
                value: u32::from(*subnet_id),
                tenants: owners.clone(),
            });
        ports.chain(subnets).collect()
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Values that fresh allocations must avoid.
///
/// Typically the ports and subnets still bound by running environments that
/// are about to be torn down or moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservations {
    ports: BTreeSet<u16>,
    subnets: BTreeSet<u8>,
}

impl Reservations {
    /// No reservations.
    pub fn none() -> Self {
        Self::default()
    }

    /// Reserve a port.
    pub fn reserve_port(&mut self, port: u16) {
        self.ports.insert(port);
    }

    /// Reserve a subnet id.
    pub fn reserve_subnet(&mut self, subnet_id: u8) {
        self.subnets.insert(subnet_id);
    }

    /// Returns true if nothing is reserved.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty() && self.subnets.is_empty()
    }
}

// ============================================================================
// Port allocation
// ============================================================================

/// Sequential port allocator.
///
/// Held ports only grow during a pass, so the first free port never moves
/// backwards and a cursor is enough.
#[derive(Debug)]
struct PortAllocator {
    held: BTreeSet<u16>,
    next: Option<u16>,
}

impl PortAllocator {
    fn new(held: BTreeSet<u16>) -> Self {
        Self {
            held,
            next: Some(PORT_BASE),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        let mut candidate = self.next?;
        while self.held.contains(&candidate) {
            candidate = candidate.checked_add(1)?;
        }
        self.held.insert(candidate);
        self.next = candidate.checked_add(1);
        Some(candidate)
    }

    fn space() -> usize {
        usize::from(u16::MAX - PORT_BASE) + 1
    }
}

// ============================================================================
// Subnet allocation
// ============================================================================

/// Starting subnet candidate for a tenant.
///
/// SHA-256 of the tenant ID, read as a big-endian integer, reduced into
/// `[1,254]`. Stable across runs, processes and platforms.
pub fn subnet_candidate(tenant_id: &TenantId) -> u8 {
    let digest = Sha256::digest(tenant_id.as_str().as_bytes());
    let modulus = SUBNET_COUNT as u32;
    let rem = digest
        .iter()
        .fold(0u32, |acc, byte| (acc * 256 + u32::from(*byte)) % modulus);
    // rem < 254, so this cannot overflow.
    SUBNET_MIN + rem as u8
}

/// Linear-probing subnet allocator over `[1,254]`.
#[derive(Debug)]
struct SubnetAllocator {
    held: BTreeSet<u8>,
}

impl SubnetAllocator {
    fn new(held: BTreeSet<u8>) -> Self {
        Self { held }
    }

    fn allocate(&mut self, tenant_id: &TenantId) -> Option<u8> {
        let start = subnet_candidate(tenant_id);
        let mut candidate = start;
        loop {
            if !self.held.contains(&candidate) {
                self.held.insert(candidate);
                return Some(candidate);
            }
            candidate = if candidate == SUBNET_MAX {
                SUBNET_MIN
            } else {
                candidate + 1
            };
            if candidate == start {
                return None;
            }
        }
    }
}

// ============================================================================
// Allocation pass
// ============================================================================

/// A value written into a record during allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationChange {
    /// Tenant whose record changed.
    pub tenant_id: TenantId,

    /// Field that changed.
    pub field: Field,

    /// Previous value, if any.
    pub old: Option<u32>,

    /// Newly assigned value.
    pub new: u32,
}

/// Result of a successful allocation pass.
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    /// The fully allocated roster.
    pub roster: Roster,

    /// Values assigned or moved, in roster order.
    pub changes: Vec<AllocationChange>,

    /// Conflicts found in the input and repaired.
    pub conflicts: Vec<Conflict>,
}

impl AllocationOutcome {
    /// Returns true if the input roster was already fully allocated.
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Allocate every missing or conflicting port and subnet id.
pub fn allocate(roster: &Roster) -> Result<AllocationOutcome, AllocationError> {
    allocate_with(roster, &Reservations::none())
}

/// Allocate while steering fresh values clear of `reservations`.
pub fn allocate_with(
    roster: &Roster,
    reservations: &Reservations,
) -> Result<AllocationOutcome, AllocationError> {
    roster.validate()?;

    let table = AllocationTable::from_roster(roster);
    let conflicts = table.conflicts();
    for conflict in &conflicts {
        let tenants: Vec<&str> = conflict.tenants.iter().map(TenantId::as_str).collect();
        warn!(
            field = %conflict.field,
            value = conflict.value,
            tenants = ?tenants,
            "Conflicting assignment, reallocating every holder"
        );
    }

    let valid_ports = table.valid_ports();
    let valid_subnets = table.valid_subnets();

    let mut ports = PortAllocator::new(
        valid_ports
            .iter()
            .chain(reservations.ports.iter())
            .copied()
            .collect(),
    );
    let mut subnets = SubnetAllocator::new(
        valid_subnets
            .iter()
            .chain(reservations.subnets.iter())
            .copied()
            .collect(),
    );

    let mut next = roster.clone();
    let mut changes = Vec::new();

    for record in next.records_mut() {
        let port_ok = record.port.is_some_and(|p| valid_ports.contains(&p));
        if !port_ok {
            let port = ports.allocate().ok_or_else(|| AllocationError::Exhausted {
                field: Field::Port,
                tenant_id: record.tenant_id.clone(),
                space: PortAllocator::space(),
            })?;
            if record.port != Some(port) {
                debug!(tenant_id = %record.tenant_id, old = ?record.port, port, "Assigned port");
                changes.push(AllocationChange {
                    tenant_id: record.tenant_id.clone(),
                    field: Field::Port,
                    old: record.port.map(u32::from),
                    new: u32::from(port),
                });
            }
            record.port = Some(port);
        }

        let subnet_ok = record.subnet_id.is_some_and(|s| valid_subnets.contains(&s));
        if !subnet_ok {
            let subnet_id =
                subnets
                    .allocate(&record.tenant_id)
                    .ok_or_else(|| AllocationError::Exhausted {
                        field: Field::Subnet,
                        tenant_id: record.tenant_id.clone(),
                        space: SUBNET_COUNT,
                    })?;
            if record.subnet_id != Some(subnet_id) {
                debug!(
                    tenant_id = %record.tenant_id,
                    old = ?record.subnet_id,
                    subnet_id,
                    "Assigned subnet"
                );
                changes.push(AllocationChange {
                    tenant_id: record.tenant_id.clone(),
                    field: Field::Subnet,
                    old: record.subnet_id.map(u32::from),
                    new: u32::from(subnet_id),
                });
            }
            record.subnet_id = Some(subnet_id);
        }
    }

    Ok(AllocationOutcome {
        roster: next,
        changes,
        conflicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_roster::TenantRecord;
    use rstest::rstest;

    fn id(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn record(s: &str) -> TenantRecord {
        TenantRecord::new(id(s), s.to_uppercase())
    }

    fn port_of(roster: &Roster, s: &str) -> u16 {
        roster.get(&id(s)).unwrap().port.unwrap()
    }

    fn subnet_of(roster: &Roster, s: &str) -> u8 {
        roster.get(&id(s)).unwrap().subnet_id.unwrap()
    }

    #[test]
    fn empty_roster_is_noop() {
        let outcome = allocate(&Roster::default()).unwrap();
        assert!(outcome.is_noop());
        assert!(outcome.roster.is_empty());
    }

    #[test]
    fn assigns_sequential_ports_from_base() {
        let roster = Roster::new(vec![record("a"), record("b"), record("c")]);
        let outcome = allocate(&roster).unwrap();

        assert_eq!(port_of(&outcome.roster, "a"), 2222);
        assert_eq!(port_of(&outcome.roster, "b"), 2223);
        assert_eq!(port_of(&outcome.roster, "c"), 2224);
        assert_eq!(outcome.roster.pending_allocation(), 0);
    }

    #[test]
    fn fills_gaps_around_existing_ports() {
        let roster = Roster::new(vec![
            record("a").with_port(2222),
            record("b"),
            record("c").with_port(2224),
            record("d"),
        ]);
        let outcome = allocate(&roster).unwrap();

        assert_eq!(port_of(&outcome.roster, "a"), 2222);
        assert_eq!(port_of(&outcome.roster, "b"), 2223);
        assert_eq!(port_of(&outcome.roster, "c"), 2224);
        assert_eq!(port_of(&outcome.roster, "d"), 2225);
    }

    #[test]
    fn duplicate_port_reallocates_every_holder() {
        let roster = Roster::new(vec![
            record("s1").with_port(2222),
            record("s2").with_port(2222),
            record("s3"),
        ]);
        let outcome = allocate(&roster).unwrap();

        let ports: BTreeSet<u16> = ["s1", "s2", "s3"]
            .iter()
            .map(|s| port_of(&outcome.roster, s))
            .collect();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().all(|p| *p >= PORT_BASE));

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].field, Field::Port);
        assert_eq!(outcome.conflicts[0].value, 2222);
        assert_eq!(outcome.conflicts[0].tenants, vec![id("s1"), id("s2")]);

        // s2 lost its claim and was moved.
        assert!(outcome
            .changes
            .iter()
            .any(|c| c.tenant_id == id("s2") && c.field == Field::Port && c.old == Some(2222)));
    }

    #[test]
    fn duplicate_port_skips_values_held_by_valid_records() {
        let roster = Roster::new(vec![
            record("s1").with_port(2230),
            record("s2").with_port(2230),
            record("s3").with_port(2222),
        ]);
        let outcome = allocate(&roster).unwrap();

        assert_eq!(port_of(&outcome.roster, "s3"), 2222);
        assert_eq!(port_of(&outcome.roster, "s1"), 2223);
        assert_eq!(port_of(&outcome.roster, "s2"), 2224);
    }

    #[test]
    fn port_conflict_does_not_touch_subnets() {
        let roster = Roster::new(vec![
            record("s1").with_port(2222).with_subnet(10),
            record("s2").with_port(2222).with_subnet(11),
        ]);
        let outcome = allocate(&roster).unwrap();

        assert_eq!(subnet_of(&outcome.roster, "s1"), 10);
        assert_eq!(subnet_of(&outcome.roster, "s2"), 11);
        assert!(outcome.changes.iter().all(|c| c.field == Field::Port));
    }

    #[test]
    fn duplicate_subnet_reallocates_every_holder() {
        let roster = Roster::new(vec![
            record("s1").with_port(2222).with_subnet(7),
            record("s2").with_port(2223).with_subnet(7),
        ]);
        let outcome = allocate(&roster).unwrap();

        let a = subnet_of(&outcome.roster, "s1");
        let b = subnet_of(&outcome.roster, "s2");
        assert_ne!(a, b);
        assert_eq!(port_of(&outcome.roster, "s1"), 2222);
        assert_eq!(port_of(&outcome.roster, "s2"), 2223);
        assert_eq!(outcome.conflicts[0].field, Field::Subnet);
    }

    #[test]
    fn fully_allocated_roster_is_unchanged() {
        let first = allocate(&Roster::new(vec![record("a"), record("b"), record("c")])).unwrap();
        let second = allocate(&first.roster).unwrap();

        assert!(second.is_noop());
        assert!(second.conflicts.is_empty());
        assert_eq!(second.roster, first.roster);
    }

    #[test]
    fn subnet_candidate_is_stable_and_in_range() {
        let a = subnet_candidate(&id("student001"));
        let b = subnet_candidate(&id("student001"));
        assert_eq!(a, b);
        assert!((SUBNET_MIN..=SUBNET_MAX).contains(&a));
    }

    #[test]
    fn fresh_subnet_uses_hash_candidate() {
        let roster = Roster::new(vec![record("student001")]);
        let outcome = allocate(&roster).unwrap();
        assert_eq!(
            subnet_of(&outcome.roster, "student001"),
            subnet_candidate(&id("student001"))
        );
    }

    #[test]
    fn subnet_probe_wraps_past_max() {
        let mut held: BTreeSet<u8> = (SUBNET_MIN..=SUBNET_MAX).collect();
        held.remove(&SUBNET_MIN);
        let mut allocator = SubnetAllocator::new(held);
        assert_eq!(allocator.allocate(&id("anyone")), Some(SUBNET_MIN));
        assert_eq!(allocator.allocate(&id("anyone-else")), None);
    }

    #[test]
    fn subnet_exhaustion_names_first_unplaced_tenant() {
        let records: Vec<_> = (0..=SUBNET_COUNT)
            .map(|i| record(&format!("t{i:03}")))
            .collect();
        let roster = Roster::new(records);

        let err = allocate(&roster).unwrap_err();
        assert_eq!(
            err,
            AllocationError::Exhausted {
                field: Field::Subnet,
                tenant_id: id(&format!("t{SUBNET_COUNT:03}")),
                space: SUBNET_COUNT,
            }
        );
    }

    #[test]
    fn exactly_full_subnet_space_succeeds() {
        let records: Vec<_> = (0..SUBNET_COUNT)
            .map(|i| record(&format!("t{i:03}")))
            .collect();
        let outcome = allocate(&Roster::new(records)).unwrap();
        let subnets: BTreeSet<u8> = outcome.roster.iter().filter_map(|r| r.subnet_id).collect();
        assert_eq!(subnets.len(), SUBNET_COUNT);
    }

    #[test]
    fn port_exhaustion_is_reported() {
        let mut allocator = PortAllocator::new([u16::MAX].into_iter().collect());
        allocator.next = Some(u16::MAX);
        assert_eq!(allocator.allocate(), None);
    }

    #[test]
    fn reservations_are_skipped_for_fresh_values() {
        let mut reserved = Reservations::none();
        reserved.reserve_port(2222);
        reserved.reserve_subnet(subnet_candidate(&id("a")));

        let roster = Roster::new(vec![record("a"), record("b").with_port(2222)]);
        let outcome = allocate_with(&roster, &reserved).unwrap();

        // Existing roster values are never displaced by a reservation.
        assert_eq!(port_of(&outcome.roster, "b"), 2222);
        assert_eq!(port_of(&outcome.roster, "a"), 2223);
        assert_ne!(subnet_of(&outcome.roster, "a"), subnet_candidate(&id("a")));
    }

    #[rstest]
    #[case(Field::Port, "port")]
    #[case(Field::Subnet, "subnet_id")]
    fn field_display(#[case] field: Field, #[case] expected: &str) {
        assert_eq!(field.to_string(), expected);
    }

    #[test]
    fn invalid_roster_is_rejected_before_allocation() {
        let roster = Roster::new(vec![record("a"), record("a")]);
        assert!(matches!(
            allocate(&roster),
            Err(AllocationError::Invalid(RosterError::DuplicateTenant { .. }))
        ));
    }

    #[test]
    fn table_reports_single_owners_only() {
        let roster = Roster::new(vec![
            record("a").with_port(2222).with_subnet(5),
            record("b").with_port(2222),
        ]);
        let table = AllocationTable::from_roster(&roster);
        assert_eq!(table.port_owner(2222), None);
        assert_eq!(table.subnet_owner(5), Some(&id("a")));
        assert!(table.valid_ports().is_empty());
    }
}
