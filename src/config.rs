//! Runtime configuration.
//!
//! Plain serde structs with defaults; every section validates itself and
//! `TrajlogConfig::validate` must pass before the config is used.

use serde::{Deserialize, Serialize};

use crate::error::{TrajResult, ValidationError};
use crate::trajectory::{BudgetLimits, VolumePolicies};

/// Co-occurrence projection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooccurrenceConfig {
    /// Bound on trajectory lists kept per edge and per entity.
    pub top_k_trajectories: usize,
}

impl Default for CooccurrenceConfig {
    fn default() -> Self {
        Self { top_k_trajectories: 20 }
    }
}

/// Structural signature settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Number of label refinement rounds.
    pub rounds: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self { rounds: 3 }
    }
}

/// Simulation engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// `d` in the sample-size confidence `n / (n + d)`.
    pub confidence_dampener: f64,
    /// Maximum rows returned by list-valued queries.
    pub max_results: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            confidence_dampener: 10.0,
            max_results: 50,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let d = self.confidence_dampener;
        if !d.is_finite() || d <= 0.0 {
            return Err(invalid("simulation.confidence_dampener must be a positive number"));
        }
        if self.max_results == 0 {
            return Err(invalid("simulation.max_results must be > 0"));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajlogConfig {
    pub budgets: BudgetLimits,
    pub volume: VolumePolicies,
    pub cooccurrence: CooccurrenceConfig,
    pub signatures: SignatureConfig,
    pub simulation: SimulationConfig,
}

fn invalid(reason: &str) -> ValidationError {
    ValidationError::InvalidConfig {
        reason: reason.to_string(),
    }
}

impl TrajlogConfig {
    /// Parses and validates a JSON document. Missing sections take defaults.
    pub fn from_json_str(json: &str) -> TrajResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.budgets.validate()?;
        self.volume.validate()?;
        if self.cooccurrence.top_k_trajectories == 0 {
            return Err(invalid("cooccurrence.top_k_trajectories must be > 0"));
        }
        if self.signatures.rounds == 0 {
            return Err(invalid("signatures.rounds must be > 0"));
        }
        self.simulation.validate()
    }
}
