//! Error types for roster parsing and validation.

use thiserror::Error;

/// Errors raised while reading or validating a roster.
///
/// All variants are pre-flight failures: they are reported before any
/// allocation or substrate call happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RosterError {
    /// The tenant ID string is empty.
    #[error("tenant ID cannot be empty")]
    EmptyId,

    /// The tenant ID is longer than the substrate can name.
    #[error("tenant ID '{id}' is {len} characters long (max {max})")]
    IdTooLong { id: String, len: usize, max: usize },

    /// The tenant ID contains a character outside `[a-z0-9_-]`.
    #[error("tenant ID '{id}' contains invalid character {ch:?}")]
    InvalidIdChar { id: String, ch: char },

    /// The tenant ID must start with a letter or digit.
    #[error("tenant ID '{0}' must start with a lowercase letter or digit")]
    InvalidIdStart(String),

    /// Two roster rows share the same tenant ID.
    #[error("duplicate tenant ID '{id}' (rows {first} and {second})")]
    DuplicateTenant {
        id: String,
        first: usize,
        second: usize,
    },

    /// A port below the tenant range was requested.
    #[error("tenant '{id}': port {port} is below the minimum {min}")]
    PortOutOfRange { id: String, port: u16, min: u16 },

    /// A subnet id outside `[1,254]` was requested.
    #[error("tenant '{id}': subnet_id {subnet_id} is outside {min}..={max}")]
    SubnetOutOfRange {
        id: String,
        subnet_id: u8,
        min: u8,
        max: u8,
    },

    /// The roster document could not be parsed.
    #[error("invalid roster document: {0}")]
    Parse(String),

    /// The roster could not be rendered.
    #[error("failed to serialize roster: {0}")]
    Serialize(String),
}

impl RosterError {
    /// Returns true if this error concerns the shape of a tenant ID.
    pub fn is_id_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyId | Self::IdTooLong { .. } | Self::InvalidIdChar { .. } | Self::InvalidIdStart(_)
        )
    }
}
