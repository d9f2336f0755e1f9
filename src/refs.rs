//! Reference sets attached to steps and outcomes.
//!
//! Refs are grouped by ownership: entities the trajectory operates on,
//! artifacts it produced or consumed, and external resources. Entity refs use a
//! `type:identifier` convention (e.g. `file:src/main.rs`); the prefix is the
//! entity type used by the transition projection.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum refs per ownership set.
pub const MAX_REFS_PER_SET: usize = 1024;

/// How a step relates to the referenced thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Observed,
    Read,
    Modified,
    Created,
    Deleted,
    Referenced,
    Inferred,
}

impl Default for LinkKind {
    fn default() -> Self {
        Self::Observed
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Observed => "observed",
            Self::Read => "read",
            Self::Modified => "modified",
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Referenced => "referenced",
            Self::Inferred => "inferred",
        };
        f.write_str(s)
    }
}

/// A single reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefEntry {
    /// Referenced identifier.
    pub id: String,

    #[serde(default)]
    pub link: LinkKind,

    /// Optional confidence in [0, 1] that the link holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl RefEntry {
    /// Creates an observed reference without a confidence.
    pub fn observed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            link: LinkKind::Observed,
            confidence: None,
        }
    }

    /// Creates a reference with an explicit link kind.
    pub fn with_link(id: impl Into<String>, link: LinkKind) -> Self {
        Self {
            id: id.into(),
            link,
            confidence: None,
        }
    }

    /// Sets the confidence (validated by [`validate_refs`]).
    #[must_use]
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Ownership-tagged reference sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<RefEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<RefEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external: Vec<RefEntry>,
}

impl Refs {
    /// Creates empty refs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates refs observing the given entities.
    pub fn entities<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: ids.into_iter().map(RefEntry::observed).collect(),
            ..Self::default()
        }
    }

    /// Adds an entity ref.
    #[must_use]
    pub fn with_entity(mut self, entry: RefEntry) -> Self {
        self.entities.push(entry);
        self
    }

    /// Adds an artifact ref.
    #[must_use]
    pub fn with_artifact(mut self, entry: RefEntry) -> Self {
        self.artifacts.push(entry);
        self
    }

    /// Adds an external ref.
    #[must_use]
    pub fn with_external(mut self, entry: RefEntry) -> Self {
        self.external.push(entry);
        self
    }

    /// Returns true if no refs are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.artifacts.is_empty() && self.external.is_empty()
    }

    /// Sorted, deduplicated entity ids.
    #[must_use]
    pub fn entity_ids(&self) -> BTreeSet<&str> {
        self.entities.iter().map(|r| r.id.as_str()).collect()
    }
}

/// Returns the type prefix of an entity ref (`file:a.rs` -> `file`).
///
/// Refs without a prefix fall into `unknown`.
#[must_use]
pub fn entity_type_of(entity_ref: &str) -> &str {
    match entity_ref.split_once(':') {
        Some((prefix, _)) if !prefix.is_empty() => prefix,
        _ => "unknown",
    }
}

/// Validates all reference sets.
///
/// Fails if any ref has an empty id or a confidence outside [0, 1]
/// (NaN included). The boundaries 0 and 1 are accepted.
pub fn validate_refs(refs: &Refs) -> Result<(), ValidationError> {
    for (set_name, set) in [
        ("entities", &refs.entities),
        ("artifacts", &refs.artifacts),
        ("external", &refs.external),
    ] {
        if set.len() > MAX_REFS_PER_SET {
            return Err(ValidationError::FieldTooLong {
                field: format!("refs.{set_name}"),
                max_length: MAX_REFS_PER_SET,
            });
        }
        for (idx, entry) in set.iter().enumerate() {
            if entry.id.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: format!("refs.{set_name}[{idx}].id"),
                });
            }
            if let Some(c) = entry.confidence {
                if c.is_nan() || !(0.0..=1.0).contains(&c) {
                    return Err(ValidationError::ConfidenceOutOfRange {
                        field: format!("refs.{set_name}[{idx}]"),
                        value: c,
                    });
                }
            }
        }
    }
    Ok(())
}
