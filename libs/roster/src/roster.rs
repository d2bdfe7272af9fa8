//! The roster: ordered desired state for every tenant.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{RosterError, TenantId, TenantRecord, PORT_BASE, SUBNET_MAX, SUBNET_MIN};

/// Ordered list of tenant records.
///
/// Row order is significant: the allocator walks records in this order, so
/// the same roster always produces the same assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(rename = "tenant", default)]
    records: Vec<TenantRecord>,
}

impl Roster {
    /// Create a roster without validating it.
    pub fn new(records: Vec<TenantRecord>) -> Self {
        Self { records }
    }

    /// Create a roster and validate it.
    pub fn validated(records: Vec<TenantRecord>) -> Result<Self, RosterError> {
        let roster = Self::new(records);
        roster.validate()?;
        Ok(roster)
    }

    /// Check structural invariants: unique IDs and in-range values.
    ///
    /// Returns the first violation in row order.
    pub fn validate(&self) -> Result<(), RosterError> {
        let mut seen: HashMap<&TenantId, usize> = HashMap::with_capacity(self.records.len());

        for (row, record) in self.records.iter().enumerate() {
            if let Some(first) = seen.insert(&record.tenant_id, row) {
                return Err(RosterError::DuplicateTenant {
                    id: record.tenant_id.to_string(),
                    first: first + 1,
                    second: row + 1,
                });
            }

            if let Some(port) = record.port {
                if port < PORT_BASE {
                    return Err(RosterError::PortOutOfRange {
                        id: record.tenant_id.to_string(),
                        port,
                        min: PORT_BASE,
                    });
                }
            }

            if let Some(subnet_id) = record.subnet_id {
                if !(SUBNET_MIN..=SUBNET_MAX).contains(&subnet_id) {
                    return Err(RosterError::SubnetOutOfRange {
                        id: record.tenant_id.to_string(),
                        subnet_id,
                        min: SUBNET_MIN,
                        max: SUBNET_MAX,
                    });
                }
            }
        }

        Ok(())
    }

    /// Parse a TOML roster document and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self, RosterError> {
        let roster: Self =
            toml::from_str(contents).map_err(|e| RosterError::Parse(e.to_string()))?;
        roster.validate()?;
        Ok(roster)
    }

    /// Render the roster as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, RosterError> {
        toml::to_string_pretty(self).map_err(|e| RosterError::Serialize(e.to_string()))
    }

    /// All records in row order.
    pub fn records(&self) -> &[TenantRecord] {
        &self.records
    }

    /// Mutable access to the records, for pipeline stages working on a copy.
    pub fn records_mut(&mut self) -> &mut [TenantRecord] {
        &mut self.records
    }

    /// Consume the roster, returning its records.
    pub fn into_records(self) -> Vec<TenantRecord> {
        self.records
    }

    /// Iterate over records in row order.
    pub fn iter(&self) -> std::slice::Iter<'_, TenantRecord> {
        self.records.iter()
    }

    /// Number of tenants.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the roster has no tenants.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a tenant by ID.
    pub fn get(&self, id: &TenantId) -> Option<&TenantRecord> {
        self.records.iter().find(|r| &r.tenant_id == id)
    }

    /// Returns true if the tenant is in the roster.
    pub fn contains(&self, id: &TenantId) -> bool {
        self.get(id).is_some()
    }

    /// Tenant IDs in row order.
    pub fn ids(&self) -> impl Iterator<Item = &TenantId> {
        self.records.iter().map(|r| &r.tenant_id)
    }

    /// Number of records still missing a port or subnet id.
    pub fn pending_allocation(&self) -> usize {
        self.records.iter().filter(|r| r.needs_allocation()).count()
    }

    /// Append a record.
    pub fn push(&mut self, record: TenantRecord) {
        self.records.push(record);
    }

    /// Remove a tenant, keeping the order of the rest.
    pub fn remove(&mut self, id: &TenantId) -> Option<TenantRecord> {
        let pos = self.records.iter().position(|r| &r.tenant_id == id)?;
        Some(self.records.remove(pos))
    }
}

impl<'a> IntoIterator for &'a Roster {
    type Item = &'a TenantRecord;
    type IntoIter = std::slice::Iter<'a, TenantRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<TenantRecord> for Roster {
    fn from_iter<I: IntoIterator<Item = TenantRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
