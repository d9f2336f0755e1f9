//! Identifier newtypes.
//!
//! Trajectory and command ids are caller-chosen strings; step ids are
//! content-addressed (hex-encoded blake3); outcome ids are UUIDs derived from
//! the outcome's content.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum length of caller-chosen identifiers.
pub const MAX_ID_LENGTH: usize = 256;

fn validate_id(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_ID_LENGTH,
        });
    }
    Ok(())
}

/// Stable identifier of a trajectory.
///
/// # Examples
///
/// ```
/// use trajlog::TrajectoryId;
///
/// let id = TrajectoryId::new("deploy-42").unwrap();
/// assert_eq!(id.as_str(), "deploy-42");
/// assert!(TrajectoryId::new("  ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrajectoryId(String);

impl TrajectoryId {
    /// Creates a trajectory id from a caller-chosen string.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_id("trajectory_id", &value)?;
        Ok(Self(value))
    }

    /// Creates a fresh random trajectory id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrajectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed step identifier (64 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub(crate) fn from_hash(hash: &blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an outcome record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutcomeId(Uuid);

impl OutcomeId {
    /// Namespace for content-derived outcome ids.
    const NAMESPACE: Uuid = Uuid::from_u128(0x7a1e_0c57_4b9d_4f1a_9d3e_5c0f_2b6a_8e41);

    /// Derives an outcome id from canonical content bytes.
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        Self(Uuid::new_v5(&Self::NAMESPACE, content))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for OutcomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a command handled by a ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Creates a command id.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_id("command_id", &value)?;
        Ok(Self(value))
    }

    /// Creates a fresh random command id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
