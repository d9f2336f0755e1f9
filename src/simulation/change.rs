//! Change simulation: predicted outcome distribution for touching a set of
//! entities with a given step pattern.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analytics::transitions::ngrams_of;
use crate::analytics::{OutcomeCorrelationState, TransitionState};
use crate::config::SimulationConfig;
use crate::error::ProjectionError;
use crate::outcome::OutcomeKind;
use crate::step::StepType;

use super::{sample_confidence, ALGORITHM_VERSION, FEATURE_SCHEMA_VERSION};

/// A proposed change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    #[serde(default)]
    pub affected_entities: Vec<String>,
    /// Planned step types in order; fewer than two steps contribute nothing.
    #[serde(default)]
    pub step_pattern: Vec<StepType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictedOutcome {
    pub kind: OutcomeKind,
    pub probability: f64,
}

/// Where a risk contribution comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "source", content = "key", rename_all = "snake_case")]
pub enum RiskSource {
    Entity(String),
    Pattern(String),
}

/// Share of one predicted probability attributable to one factor.
///
/// Contributions for a kind sum to its predicted probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub source: RiskSource,
    pub kind: OutcomeKind,
    pub contribution: f64,
    /// Observations behind the factor.
    pub samples: u64,
    /// Mean outcome severity, for entity factors.
    pub mean_severity: Option<f64>,
}

/// Historical outcomes of trajectories that contained a step type.
///
/// Reported next to the prediction and never folded into it; a step type
/// present in most trajectories would otherwise dominate every forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTypePrior {
    pub step_type: StepType,
    /// Most likely first.
    pub outcomes: Vec<PredictedOutcome>,
    pub samples: u64,
    pub mean_severity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSimulation {
    /// Most likely first.
    pub predicted_outcomes: Vec<PredictedOutcome>,
    pub confidence: f64,
    pub sample_size: u64,
    /// Largest contribution first.
    pub risk_factors: Vec<RiskFactor>,
    /// One per distinct step type of the request that has outcome history.
    #[serde(default)]
    pub step_type_priors: Vec<StepTypePrior>,
    pub algorithm_version: String,
    pub feature_schema_version: String,
}

/// One conditioning factor: counts by kind.
struct Factor {
    source: RiskSource,
    counts: BTreeMap<OutcomeKind, u64>,
    total: u64,
    mean_severity: Option<f64>,
}

/// Factors from one signal, each weighted so the weights sum to 1.
struct Signal {
    factors: Vec<(Factor, f64)>,
    samples: u64,
}

#[allow(clippy::cast_precision_loss)]
fn pattern_signal(transitions: &TransitionState, pattern: &[StepType]) -> Result<Option<Signal>, ProjectionError> {
    let mut factors = Vec::new();
    let mut samples = 0;
    let grams: BTreeSet<String> = ngrams_of(pattern).into_iter().collect();
    for gram in grams {
        let Some(counts) = transitions.outcome_counts(&gram)? else {
            continue;
        };
        let total: u64 = counts.values().sum();
        if total == 0 {
            continue;
        }
        samples += total;
        factors.push(Factor {
            source: RiskSource::Pattern(gram),
            counts: counts.clone(),
            total,
            mean_severity: None,
        });
    }
    if samples == 0 {
        return Ok(None);
    }
    // The pattern distribution pools all matching n-grams, so each factor
    // weighs in proportion to its sample count.
    let factors = factors
        .into_iter()
        .map(|f| {
            let w = f.total as f64 / samples as f64;
            (f, w)
        })
        .collect();
    Ok(Some(Signal { factors, samples }))
}

#[allow(clippy::cast_precision_loss)]
fn entity_signal(
    correlation: &OutcomeCorrelationState,
    entities: &[String],
) -> Result<Option<Signal>, ProjectionError> {
    let mut factors = Vec::new();
    let mut samples = 0;
    let unique: BTreeSet<&str> = entities.iter().map(String::as_str).collect();
    for entity in unique {
        let Some(counts) = correlation.entity(entity)? else {
            continue;
        };
        if counts.total == 0 {
            continue;
        }
        samples += counts.total;
        factors.push(Factor {
            source: RiskSource::Entity(entity.to_string()),
            counts: counts.counts.clone(),
            total: counts.total,
            mean_severity: Some(counts.mean_severity()),
        });
    }
    if factors.is_empty() {
        return Ok(None);
    }
    // Per-entity distributions are averaged over the entities that have data.
    let w = 1.0 / factors.len() as f64;
    Ok(Some(Signal {
        factors: factors.into_iter().map(|f| (f, w)).collect(),
        samples,
    }))
}

fn step_type_priors(
    correlation: &OutcomeCorrelationState,
    pattern: &[StepType],
) -> Result<Vec<StepTypePrior>, ProjectionError> {
    let mut priors = Vec::new();
    for step_type in pattern.iter().copied().collect::<BTreeSet<_>>() {
        let Some(counts) = correlation.pattern(step_type)? else {
            continue;
        };
        if counts.total == 0 {
            continue;
        }
        let mut outcomes: Vec<PredictedOutcome> = counts
            .probabilities()
            .into_iter()
            .map(|(kind, probability)| PredictedOutcome { kind, probability })
            .collect();
        sort_predictions(&mut outcomes);
        priors.push(StepTypePrior {
            step_type,
            outcomes,
            samples: counts.total,
            mean_severity: counts.mean_severity(),
        });
    }
    Ok(priors)
}

fn sort_predictions(predictions: &mut [PredictedOutcome]) {
    predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability).then(a.kind.cmp(&b.kind)));
}

#[allow(clippy::cast_precision_loss)]
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Predicts the outcome distribution of a change.
///
/// The pattern signal comes from the transition model (outcomes of every
/// bigram/trigram of `step_pattern`), the entity signal from the correlation
/// table. When both exist they are averaged per kind. Confidence is
/// `n / (n + dampener)` scaled by `1 - variance` of the predicted
/// probabilities. No matching data yields an empty prediction with
/// confidence 0. Per-step-type outcome history is attached as
/// [`StepTypePrior`]s.
#[allow(clippy::cast_precision_loss)]
pub fn simulate_change(
    transitions: &TransitionState,
    correlation: &OutcomeCorrelationState,
    request: &ChangeRequest,
    config: &SimulationConfig,
) -> Result<ChangeSimulation, ProjectionError> {
    let signals: Vec<Signal> = [
        pattern_signal(transitions, &request.step_pattern)?,
        entity_signal(correlation, &request.affected_entities)?,
    ]
    .into_iter()
    .flatten()
    .collect();

    let source_weight = if signals.is_empty() {
        0.0
    } else {
        1.0 / signals.len() as f64
    };
    let mut probabilities: BTreeMap<OutcomeKind, f64> = BTreeMap::new();
    let mut risk_factors = Vec::new();
    let mut sample_size = 0;
    for signal in &signals {
        sample_size += signal.samples;
        for (factor, weight) in &signal.factors {
            for (kind, n) in &factor.counts {
                let contribution = source_weight * weight * (*n as f64 / factor.total as f64);
                *probabilities.entry(*kind).or_default() += contribution;
                risk_factors.push(RiskFactor {
                    source: factor.source.clone(),
                    kind: *kind,
                    contribution,
                    samples: factor.total,
                    mean_severity: factor.mean_severity,
                });
            }
        }
    }

    let mut predicted_outcomes: Vec<PredictedOutcome> = probabilities
        .into_iter()
        .map(|(kind, probability)| PredictedOutcome { kind, probability })
        .collect();
    sort_predictions(&mut predicted_outcomes);

    let values: Vec<f64> = predicted_outcomes.iter().map(|p| p.probability).collect();
    let confidence = (sample_confidence(sample_size, config.confidence_dampener) * (1.0 - variance(&values)))
        .clamp(0.0, 1.0);

    risk_factors.sort_by(|a, b| {
        b.contribution
            .total_cmp(&a.contribution)
            .then_with(|| a.source.cmp(&b.source))
            .then(a.kind.cmp(&b.kind))
    });
    risk_factors.truncate(config.max_results);
    let step_type_priors = step_type_priors(correlation, &request.step_pattern)?;

    debug!(
        entities = request.affected_entities.len(),
        pattern_len = request.step_pattern.len(),
        sample_size,
        confidence,
        "simulated change"
    );

    Ok(ChangeSimulation {
        predicted_outcomes,
        confidence,
        sample_size,
        risk_factors,
        step_type_priors,
        algorithm_version: ALGORITHM_VERSION.to_string(),
        feature_schema_version: FEATURE_SCHEMA_VERSION.to_string(),
    })
}
