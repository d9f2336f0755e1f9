//! Structural signatures by iterative label refinement.
//!
//! Trajectories, entities and tools form an undirected graph. Each node gets
//! a coarse label from bucketed counts, then every round relabels each node
//! with a hash of its label and the sorted multiset of its neighbors' labels
//! (Weisfeiler-Leman). Entities with equal final labels sit in structurally
//! equivalent positions, whatever their identities.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SignatureConfig;
use crate::entry::LogEntry;
use crate::error::ProjectionError;
use crate::hash::short_label;
use crate::ids::{OutcomeId, TrajectoryId};
use crate::outcome::OutcomeKind;
use crate::projection::{Freshness, Projection};
use crate::step::StepType;

const TRAJECTORY_DOMAIN: &str = "trajlog.sig.trajectory";
const ENTITY_DOMAIN: &str = "trajlog.sig.entity";
const TOOL_DOMAIN: &str = "trajlog.sig.tool";
const ROUND_DOMAIN: &str = "trajlog.sig.round";
const DISTRIBUTION_DOMAIN: &str = "trajlog.sig.distribution";

/// `0 -> 0`, otherwise `floor(log2(n)) + 1`.
#[must_use]
pub const fn log2_bucket(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Trajectory(TrajectoryId),
    Entity(String),
    Tool(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TrajectoryAcc {
    steps: u64,
    entities: BTreeSet<String>,
    tools: BTreeSet<String>,
    outcomes: BTreeMap<OutcomeKind, u64>,
    terminal: Option<(DateTime<Utc>, OutcomeId, OutcomeKind)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Accumulator {
    trajectories: BTreeMap<TrajectoryId, TrajectoryAcc>,
    /// `(entity, tool)` pairs from entity refs on `tool_called` steps.
    entity_tools: BTreeSet<(String, String)>,
    /// Outcome kinds attached directly to an entity through outcome refs.
    direct_outcomes: BTreeMap<String, BTreeMap<OutcomeKind, u64>>,
}

/// Finalized signature tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTables {
    /// `entity -> signature`.
    pub entity_signatures: BTreeMap<String, String>,
    /// `signature -> entities`.
    pub signature_index: BTreeMap<String, BTreeSet<String>>,
    /// `entity -> trajectories referencing it`.
    pub entity_trajectories: BTreeMap<String, BTreeSet<TrajectoryId>>,
    pub rounds: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "snake_case")]
enum Mode {
    Accumulating(Accumulator),
    Finalized(SignatureTables),
}

/// Signature projection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureState {
    mode: Mode,
    #[serde(skip)]
    freshness: Freshness,
}

impl Default for SignatureState {
    fn default() -> Self {
        Self {
            mode: Mode::Accumulating(Accumulator::default()),
            freshness: Freshness::default(),
        }
    }
}

impl SignatureState {
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self.mode, Mode::Finalized(_))
    }

    pub fn tables(&self) -> Result<&SignatureTables, ProjectionError> {
        match &self.mode {
            Mode::Finalized(tables) => Ok(tables),
            Mode::Accumulating(_) => Err(ProjectionError::NotFinalized {
                name: SignatureProjection::NAME.to_string(),
            }),
        }
    }

    pub fn signature_of(&self, entity: &str) -> Result<Option<&str>, ProjectionError> {
        Ok(self.tables()?.entity_signatures.get(entity).map(String::as_str))
    }

    /// Entities sharing `signature`.
    pub fn entities_with(&self, signature: &str) -> Result<Option<&BTreeSet<String>>, ProjectionError> {
        Ok(self.tables()?.signature_index.get(signature))
    }

    pub fn trajectories_of(&self, entity: &str) -> Result<Option<&BTreeSet<TrajectoryId>>, ProjectionError> {
        Ok(self.tables()?.entity_trajectories.get(entity))
    }
}

fn distribution_label(counts: &BTreeMap<OutcomeKind, u64>) -> String {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return short_label(DISTRIBUTION_DOMAIN, &["none"]);
    }
    #[allow(clippy::cast_precision_loss)]
    let parts: Vec<String> = counts
        .iter()
        .map(|(kind, n)| format!("{kind}={:.2}", *n as f64 / total as f64))
        .collect();
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
    short_label(DISTRIBUTION_DOMAIN, &parts)
}

fn refine(acc: Accumulator, rounds: usize) -> SignatureTables {
    let mut adjacency: BTreeMap<Node, BTreeSet<Node>> = BTreeMap::new();
    let mut link = |a: Node, b: Node| {
        adjacency.entry(a.clone()).or_default().insert(b.clone());
        adjacency.entry(b).or_default().insert(a);
    };

    let mut entity_trajectories: BTreeMap<String, BTreeSet<TrajectoryId>> = BTreeMap::new();
    let mut entity_outcomes = acc.direct_outcomes;
    for (id, t) in &acc.trajectories {
        let node = Node::Trajectory(id.clone());
        link(node.clone(), node.clone());
        for entity in &t.entities {
            link(node.clone(), Node::Entity(entity.clone()));
            entity_trajectories
                .entry(entity.clone())
                .or_default()
                .insert(id.clone());
            let counts = entity_outcomes.entry(entity.clone()).or_default();
            for (kind, n) in &t.outcomes {
                *counts.entry(*kind).or_default() += n;
            }
        }
        for tool in &t.tools {
            link(node.clone(), Node::Tool(tool.clone()));
        }
    }
    for (entity, tool) in &acc.entity_tools {
        link(Node::Entity(entity.clone()), Node::Tool(tool.clone()));
    }
    // Self loops were only inserted to register isolated trajectories.
    for (node, neighbors) in &mut adjacency {
        neighbors.remove(node);
    }

    let degree = |node: &Node| adjacency.get(node).map_or(0, BTreeSet::len) as u64;
    let mut labels: BTreeMap<&Node, String> = BTreeMap::new();
    for node in adjacency.keys() {
        let bucket = log2_bucket(degree(node)).to_string();
        let label = match node {
            Node::Trajectory(id) => {
                let t = acc.trajectories.get(id);
                let steps = log2_bucket(t.map_or(0, |t| t.steps)).to_string();
                let terminal = t
                    .and_then(|t| t.terminal.as_ref())
                    .map_or("none", |(_, _, kind)| kind.as_str());
                short_label(TRAJECTORY_DOMAIN, &[steps.as_str(), terminal])
            }
            Node::Entity(entity) => {
                let empty = BTreeMap::new();
                let dist = distribution_label(entity_outcomes.get(entity).unwrap_or(&empty));
                short_label(ENTITY_DOMAIN, &[bucket.as_str(), dist.as_str()])
            }
            Node::Tool(_) => short_label(TOOL_DOMAIN, &[bucket.as_str()]),
        };
        labels.insert(node, label);
    }

    for _ in 0..rounds {
        let mut next = BTreeMap::new();
        for (node, neighbors) in &adjacency {
            let mut around: Vec<&str> = neighbors
                .iter()
                .filter_map(|n| labels.get(n).map(String::as_str))
                .collect();
            around.sort_unstable();
            let own = labels.get(node).map_or("", String::as_str);
            let mut parts = Vec::with_capacity(around.len() + 1);
            parts.push(own);
            parts.extend(around);
            next.insert(node, short_label(ROUND_DOMAIN, &parts));
        }
        labels = next;
    }

    let mut tables = SignatureTables {
        rounds,
        entity_trajectories,
        ..SignatureTables::default()
    };
    for (node, label) in labels {
        if let Node::Entity(entity) = node {
            tables
                .signature_index
                .entry(label.clone())
                .or_default()
                .insert(entity.clone());
            tables.entity_signatures.insert(entity.clone(), label);
        }
    }
    tables
}

/// Signature projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureProjection {
    config: SignatureConfig,
}

impl SignatureProjection {
    #[must_use]
    pub const fn new(config: SignatureConfig) -> Self {
        Self { config }
    }
}

impl Projection for SignatureProjection {
    const NAME: &'static str = "signatures";
    const VERSION: u32 = 1;
    type State = SignatureState;

    fn init(&self) -> SignatureState {
        SignatureState::default()
    }

    fn apply(&self, state: &mut SignatureState, entry: &LogEntry) -> Result<(), ProjectionError> {
        let Mode::Accumulating(acc) = &mut state.mode else {
            return Err(ProjectionError::AlreadyFinalized {
                name: Self::NAME.to_string(),
            });
        };
        state.freshness.observe(entry);
        match entry {
            LogEntry::Step(step) => {
                let t = acc.trajectories.entry(step.trajectory_id.clone()).or_default();
                t.steps += 1;
                let entities = step.refs.entity_ids();
                t.entities.extend(entities.iter().map(|e| (*e).to_string()));
                if step.step_type == StepType::ToolCalled {
                    if let Some(tool) = step.tool_name() {
                        t.tools.insert(tool.to_string());
                        for entity in entities {
                            acc.entity_tools.insert((entity.to_string(), tool.to_string()));
                        }
                    }
                }
            }
            LogEntry::Outcome(outcome) => {
                for entity in outcome.refs.entity_ids() {
                    *acc.direct_outcomes
                        .entry(entity.to_string())
                        .or_default()
                        .entry(outcome.kind)
                        .or_default() += 1;
                }
                if let Some(id) = &outcome.attaches_to.trajectory_id {
                    let t = acc.trajectories.entry(id.clone()).or_default();
                    *t.outcomes.entry(outcome.kind).or_default() += 1;
                    let candidate = (outcome.timestamp, outcome.outcome_id, outcome.kind);
                    let newer = t
                        .terminal
                        .as_ref()
                        .map_or(true, |(ts, oid, _)| (candidate.0, candidate.1) > (*ts, *oid));
                    if newer {
                        t.terminal = Some(candidate);
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize(&self, state: &mut SignatureState) -> Result<(), ProjectionError> {
        if let Mode::Accumulating(acc) = &mut state.mode {
            let acc = std::mem::take(acc);
            state.mode = Mode::Finalized(refine(acc, self.config.rounds));
        }
        Ok(())
    }

    fn freshness(&self, state: &SignatureState) -> Freshness {
        state.freshness.clone()
    }
}
