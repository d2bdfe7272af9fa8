//! Tenant identity and per-row desired state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cell::blank_as_none;
use crate::RosterError;

/// Maximum tenant ID length.
///
/// The ID ends up inside compose project and network names, which docker
/// caps at 63 characters including our prefix.
pub const MAX_ID_LEN: usize = 48;

/// Stable identity key of a tenant.
///
/// Lowercase ASCII letters, digits, `-` and `_`, starting with a letter or
/// digit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parses and validates a tenant ID.
    pub fn parse(s: &str) -> Result<Self, RosterError> {
        if s.is_empty() {
            return Err(RosterError::EmptyId);
        }
        if s.len() > MAX_ID_LEN {
            return Err(RosterError::IdTooLong {
                id: s.to_string(),
                len: s.len(),
                max: MAX_ID_LEN,
            });
        }
        if let Some(ch) = s
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            return Err(RosterError::InvalidIdChar {
                id: s.to_string(),
                ch,
            });
        }
        if s.starts_with(['-', '_']) {
            return Err(RosterError::InvalidIdStart(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = RosterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The `(port, subnet_id)` pair bound to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    /// Host port forwarded to the tenant's SSH entry point.
    pub port: u16,

    /// Third octet of the tenant's `172.20.X.0/24` network.
    pub subnet_id: u8,
}

impl Allocation {
    /// The tenant network in CIDR notation.
    pub fn subnet_cidr(&self) -> String {
        format!("172.20.{}.0/24", self.subnet_id)
    }
}

/// One row of desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Stable identity key.
    #[serde(rename = "id")]
    pub tenant_id: TenantId,

    /// Informational label; not required to be unique.
    #[serde(rename = "name", default)]
    pub display_name: String,

    /// Host port, unset until allocated.
    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,

    /// Subnet id, unset until allocated.
    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub subnet_id: Option<u8>,

    /// Login credential, generated once and kept.
    #[serde(
        default,
        deserialize_with = "blank_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub secret: Option<String>,
}

fn blank_secret<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

impl TenantRecord {
    /// Create a record with no allocation and no secret.
    pub fn new(tenant_id: TenantId, display_name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            display_name: display_name.into(),
            port: None,
            subnet_id: None,
            secret: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the subnet id.
    pub fn with_subnet(mut self, subnet_id: u8) -> Self {
        self.subnet_id = Some(subnet_id);
        self
    }

    /// Set the secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Returns the allocation once both fields are set.
    pub fn allocation(&self) -> Option<Allocation> {
        Some(Allocation {
            port: self.port?,
            subnet_id: self.subnet_id?,
        })
    }

    /// Returns true if either field still needs allocating.
    pub fn needs_allocation(&self) -> bool {
        self.allocation().is_none()
    }

    /// Name shown in logs and tables: the display name, or the ID.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            self.tenant_id.as_str()
        } else {
            &self.display_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("student001")]
    #[case("s1")]
    #[case("team-a_07")]
    #[case("0day")]
    fn accepts_valid_ids(#[case] raw: &str) {
        let id = TenantId::parse(raw).unwrap();
        assert_eq!(id.as_str(), raw);
        assert_eq!(id.to_string(), raw);
    }

    #[rstest]
    #[case("")]
    #[case("Student1")]
    #[case("has space")]
    #[case("-leading")]
    #[case("_leading")]
    #[case("dot.ted")]
    fn rejects_invalid_ids(#[case] raw: &str) {
        let err = TenantId::parse(raw).unwrap_err();
        assert!(err.is_id_error(), "unexpected error {err:?}");
    }

    #[test]
    fn rejects_overlong_id() {
        let raw = "a".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            TenantId::parse(&raw),
            Err(RosterError::IdTooLong { len, .. }) if len == MAX_ID_LEN + 1
        ));
    }

    #[test]
    fn allocation_requires_both_fields() {
        let id = TenantId::parse("s1").unwrap();
        let record = TenantRecord::new(id.clone(), "One").with_port(2222);
        assert!(record.needs_allocation());

        let record = record.with_subnet(9);
        assert_eq!(
            record.allocation(),
            Some(Allocation {
                port: 2222,
                subnet_id: 9
            })
        );
        assert_eq!(record.allocation().unwrap().subnet_cidr(), "172.20.9.0/24");
    }

    #[test]
    fn label_falls_back_to_id() {
        let id = TenantId::parse("s1").unwrap();
        assert_eq!(TenantRecord::new(id.clone(), "").label(), "s1");
        assert_eq!(TenantRecord::new(id, "Ada").label(), "Ada");
    }
}
