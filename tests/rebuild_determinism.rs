//! Rebuilding projections from the same log must reproduce the same hashes,
//! whatever the interleaving of trajectories or the rebuild strategy.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use trajlog::analytics::{
    prune_cooccurrence, CooccurrenceProjection, OutcomeCorrelationProjection, SignatureProjection,
    TransitionProjection,
};
use trajlog::{
    build_outcome, rebuild_one, standard_registry, AnalyticsSnapshot, InMemoryStepLog, LogEntry, OutcomeInput,
    OutcomeKind, Refs, StepDraft, StepLog, StepType, TrajectoryContext, TrajectoryId, TrajlogConfig,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn context(log: &Arc<InMemoryStepLog>, id: &str) -> TrajectoryContext {
    let mut ctx = TrajectoryContext::new(TrajectoryId::new(id).unwrap(), "corr", log.clone(), &TrajlogConfig::default())
        .unwrap();
    ctx.start("test", json!(null)).unwrap();
    ctx
}

fn read(entities: &[&str], secs: i64) -> StepDraft {
    StepDraft::new(StepType::EntityRead, json!({}))
        .refs(Refs::entities(entities.iter().copied()))
        .at(at(secs))
}

fn tool(name: &str, entities: &[&str], secs: i64) -> StepDraft {
    StepDraft::new(StepType::ToolCalled, json!({"tool": name}))
        .refs(Refs::entities(entities.iter().copied()))
        .at(at(secs))
}

fn record(log: &InMemoryStepLog, id: &str, kind: OutcomeKind, secs: i64) {
    let outcome = build_outcome(
        OutcomeInput::for_trajectory(TrajectoryId::new(id).unwrap(), kind, at(secs)).severity(2),
    )
    .unwrap();
    log.append(outcome.into()).unwrap();
}

/// Three interleaved trajectories with outcomes.
fn workload() -> Arc<InMemoryStepLog> {
    let log = Arc::new(InMemoryStepLog::new());
    let mut a = context(&log, "t-a");
    let mut b = context(&log, "t-b");
    let mut c = context(&log, "t-c");

    a.emit(read(&["db:orders", "svc:api"], 10)).unwrap();
    b.emit(read(&["db:users"], 11)).unwrap();
    a.emit(tool("migrate", &["db:orders"], 12)).unwrap();
    c.emit(read(&["db:orders", "cache:sessions"], 13)).unwrap();
    b.emit(tool("migrate", &["db:users"], 14)).unwrap();
    c.emit(tool("flush", &["cache:sessions"], 15)).unwrap();
    a.end(json!(null)).unwrap();
    record(&log, "t-a", OutcomeKind::Success, 20);
    b.end(json!(null)).unwrap();
    c.end(json!(null)).unwrap();
    record(&log, "t-b", OutcomeKind::Success, 21);
    record(&log, "t-c", OutcomeKind::Incident, 22);
    log
}

#[test]
fn each_projection_rebuilds_to_the_same_hash() {
    let log = workload();
    let config = TrajlogConfig::default();

    let first = standard_registry(&config).unwrap().rebuild_all(log.as_ref()).unwrap();
    let second = standard_registry(&config).unwrap().rebuild_all(log.as_ref()).unwrap();

    let names: Vec<_> = first.names().collect();
    assert_eq!(names.len(), 4);
    for name in names {
        assert_eq!(first.hash(name), second.hash(name), "{name}");
    }

    let single = rebuild_one(&TransitionProjection, log.as_ref()).unwrap();
    assert_eq!(Some(single.hash.as_str()), first.hash("transitions"));
    assert_eq!(single.entries, log.len().unwrap());
}

/// One trajectory's steps and outcome, every timestamp fixed.
fn trajectory_entries(id: &str, base: i64, entities: &[&str], kind: OutcomeKind) -> Vec<LogEntry> {
    let scratch = Arc::new(InMemoryStepLog::new());
    let mut ctx = TrajectoryContext::new(TrajectoryId::new(id).unwrap(), "corr", scratch.clone(), &TrajlogConfig::default())
        .unwrap();
    ctx.emit(StepDraft::new(StepType::TrajectoryStarted, json!({"trigger": "test"})).at(at(base)))
        .unwrap();
    ctx.emit(read(entities, base + 1)).unwrap();
    ctx.emit(tool("migrate", &entities[..1], base + 2)).unwrap();
    ctx.emit(read(&entities[1..], base + 3)).unwrap();
    ctx.emit(StepDraft::new(StepType::TrajectoryEnded, json!({"outcome_summary": null})).at(at(base + 4)))
        .unwrap();
    record(&scratch, id, kind, base + 5);
    scratch.stream().unwrap().collect::<Result<_, _>>().unwrap()
}

#[test]
fn interleaving_does_not_change_any_projection_hash() {
    let trajectories = vec![
        trajectory_entries("t-a", 100, &["db:orders", "svc:api"], OutcomeKind::Success),
        trajectory_entries("t-b", 100, &["db:orders", "cache:sessions"], OutcomeKind::Incident),
        trajectory_entries("t-c", 200, &["db:users", "svc:api", "db:orders"], OutcomeKind::Rollback),
    ];

    let sequential = InMemoryStepLog::new();
    for entry in trajectories.iter().flatten() {
        sequential.append(entry.clone()).unwrap();
    }

    // Round-robin, starting from the last trajectory.
    let round_robin = InMemoryStepLog::new();
    let longest = trajectories.iter().map(Vec::len).max().unwrap();
    for i in 0..longest {
        for entries in trajectories.iter().rev() {
            if let Some(entry) = entries.get(i) {
                round_robin.append(entry.clone()).unwrap();
            }
        }
    }
    assert_eq!(sequential.len().unwrap(), round_robin.len().unwrap());

    let config = TrajlogConfig::default();
    let registry = standard_registry(&config).unwrap();
    let a = registry.rebuild_all(&sequential).unwrap();
    let b = registry.rebuild_all(&round_robin).unwrap();
    let names: Vec<_> = registry.names().collect();
    assert_eq!(names.len(), 4);
    for name in names {
        assert!(a.hash(name).is_some(), "{name}");
        assert_eq!(a.hash(name), b.hash(name), "{name}");
    }
}

#[test]
fn parallel_rebuild_matches_sequential() {
    let log = workload();
    let config = TrajlogConfig::default();
    let registry = standard_registry(&config).unwrap();

    let sequential = registry.rebuild_all(log.as_ref()).unwrap();
    let parallel = registry.rebuild_all_parallel(log.as_ref()).unwrap();
    for name in registry.names() {
        assert_eq!(sequential.hash(name), parallel.hash(name), "{name}");
    }
}

#[test]
fn hashes_change_when_the_log_grows() {
    let log = workload();
    let before = rebuild_one(&OutcomeCorrelationProjection, log.as_ref()).unwrap();
    record(&log, "t-a", OutcomeKind::Rollback, 30);
    let after = rebuild_one(&OutcomeCorrelationProjection, log.as_ref()).unwrap();
    assert_ne!(before.hash, after.hash);
}

#[test]
fn cooccurrence_edges_and_prune() {
    let log = Arc::new(InMemoryStepLog::new());
    let mut t1 = context(&log, "t1");
    t1.emit(read(&["A", "B"], 100)).unwrap();
    t1.emit(read(&["A", "C"], 200)).unwrap();
    t1.end(json!(null)).unwrap();

    let mut rebuilt = rebuild_one(&CooccurrenceProjection::default(), log.as_ref()).unwrap();
    let graph = &rebuilt.state;
    assert_eq!(graph.edge("A", "B").map(|e| e.weight), Some(1));
    assert_eq!(graph.edge("A", "C").map(|e| e.weight), Some(1));
    assert!(graph.edge("B", "C").is_none());

    let original = rebuilt.hash.clone();
    let stats = prune_cooccurrence(&mut rebuilt.state, -1);
    assert_eq!(stats.edges_removed, 2);
    assert!(rebuilt.state.edges.is_empty());
    assert_ne!(rebuilt.rehash().unwrap(), original);
}

#[test]
fn structurally_equivalent_entities_share_a_signature() {
    let log = Arc::new(InMemoryStepLog::new());
    for (id, entity) in [("t-x", "db:left"), ("t-y", "db:right")] {
        let mut ctx = context(&log, id);
        ctx.emit(read(&[entity], 10)).unwrap();
        ctx.emit(tool("vacuum", &[], 11)).unwrap();
        ctx.end(json!(null)).unwrap();
        record(&log, id, OutcomeKind::Success, 20);
    }
    let mut odd = context(&log, "t-z");
    odd.emit(read(&["db:odd"], 10)).unwrap();
    odd.end(json!(null)).unwrap();
    record(&log, "t-z", OutcomeKind::Incident, 20);

    let rebuilt = rebuild_one(&SignatureProjection::default(), log.as_ref()).unwrap();
    let state = &rebuilt.state;
    let left = state.signature_of("db:left").unwrap().unwrap();
    let right = state.signature_of("db:right").unwrap().unwrap();
    assert_eq!(left, right);
    assert_ne!(state.signature_of("db:odd").unwrap().unwrap(), left);

    let group = state.entities_with(left).unwrap().unwrap();
    assert!(group.contains("db:left") && group.contains("db:right"));
}

#[test]
fn snapshot_answers_queries_without_the_log() {
    let log = workload();
    let config = TrajlogConfig::default();
    let analytics = AnalyticsSnapshot::rebuild(log.as_ref(), &config).unwrap();
    let engine = trajlog::SimulationEngine::new(&analytics, config.simulation).unwrap();

    let radius = engine.blast_radius("db:orders");
    let affected: Vec<_> = radius.affected.iter().map(|a| a.entity.as_str()).collect();
    assert_eq!(affected, vec!["cache:sessions", "svc:api"]);
    assert!(radius.confidence > 0.0);

    let unknown = engine.blast_radius("db:nowhere");
    assert!(unknown.affected.is_empty());
    assert_eq!(unknown.confidence, 0.0);

    let similar = engine.similar_trajectories(&["db:nowhere"]).unwrap();
    assert!(similar.trajectories.is_empty());

    let sim = engine
        .simulate_change(&trajlog::ChangeRequest {
            affected_entities: vec!["db:orders".to_string()],
            step_pattern: vec![StepType::EntityRead, StepType::ToolCalled],
        })
        .unwrap();
    let total: f64 = sim.predicted_outcomes.iter().map(|p| p.probability).sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert!(sim.confidence > 0.0 && sim.confidence <= 1.0);
}
