use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use trajlog::storage::{CommandStatus, EntryRef};
use trajlog::{
    verify_chain, CommandEnvelope, CommandLog, CommandOutcome, InMemoryCommandLog, InMemoryStepLog, OutcomeInput,
    OutcomeKind, Producer, Refs, StepLog, StepType, TrajectoryCommand, TrajectoryId, TrajectoryLedger,
};

struct Harness {
    log: Arc<InMemoryStepLog>,
    commands: Arc<InMemoryCommandLog>,
    ledger: TrajectoryLedger,
}

fn harness() -> Harness {
    let log = Arc::new(InMemoryStepLog::new());
    let commands = Arc::new(InMemoryCommandLog::new());
    let ledger = TrajectoryLedger::new(log.clone(), commands.clone());
    Harness { log, commands, ledger }
}

fn tid() -> TrajectoryId {
    TrajectoryId::new("incident-7").unwrap()
}

fn start() -> TrajectoryCommand {
    TrajectoryCommand::Start {
        trajectory_id: tid(),
        correlation_id: "corr-7".to_string(),
        trigger: "pager".to_string(),
        context: json!({"service": "checkout"}),
        timestamp: Utc.timestamp_opt(1_000, 0).unwrap(),
    }
}

fn end() -> TrajectoryCommand {
    TrajectoryCommand::End {
        trajectory_id: tid(),
        correlation_id: "corr-7".to_string(),
        outcome_summary: json!({"resolved": true}),
        timestamp: Utc.timestamp_opt(2_000, 0).unwrap(),
    }
}

#[test]
fn replayed_command_appends_nothing() {
    let h = harness();
    let first = h.ledger.execute(CommandEnvelope::new("start-7", start())).unwrap();
    assert!(!first.replayed);
    let CommandOutcome::Applied { entries } = first.outcome() else {
        panic!("expected applied outcome");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(h.log.len().unwrap(), 1);

    let second = h.ledger.execute(CommandEnvelope::new("start-7", start())).unwrap();
    assert!(second.replayed);
    assert_eq!(second.record, first.record);
    assert_eq!(h.log.len().unwrap(), 1);

    let recorded = h.commands.lookup("start-7").unwrap().unwrap();
    assert_eq!(recorded.status, CommandStatus::Applied);
}

#[test]
fn full_lifecycle_folds_into_registry() {
    let h = harness();
    h.ledger.execute(CommandEnvelope::new("k-start", start())).unwrap();
    h.ledger
        .execute(CommandEnvelope::new(
            "k-note",
            TrajectoryCommand::Annotate {
                trajectory_id: tid(),
                correlation_id: "corr-7".to_string(),
                step_type: StepType::DecisionRationale,
                producer: Producer::Human,
                payload: json!({"text": "roll back first"}),
                refs: Refs::entities(["svc:checkout"]),
                timestamp: Utc.timestamp_opt(1_500, 0).unwrap(),
            },
        ))
        .unwrap();
    h.ledger.execute(CommandEnvelope::new("k-end", end())).unwrap();

    let outcome = OutcomeInput::for_trajectory(tid(), OutcomeKind::Rollback, Utc.timestamp_opt(3_000, 0).unwrap())
        .severity(3)
        .refs(Refs::entities(["svc:checkout"]));
    let receipt = h
        .ledger
        .execute(CommandEnvelope::new("k-outcome", TrajectoryCommand::RecordOutcome(outcome.clone())))
        .unwrap();
    let CommandOutcome::Applied { entries } = receipt.outcome() else {
        panic!("expected applied outcome");
    };
    assert!(matches!(entries.as_slice(), [EntryRef::Outcome(_)]));

    // The same outcome under a new key is recognised as already processed.
    let again = h
        .ledger
        .execute(CommandEnvelope::new("k-outcome-retry", TrajectoryCommand::RecordOutcome(outcome)))
        .unwrap();
    assert_eq!(again.outcome(), CommandOutcome::AlreadyProcessed);
    assert_eq!(h.log.len().unwrap(), 4);

    // Ending twice is a no-op as well.
    let again = h.ledger.execute(CommandEnvelope::new("k-end-2", end())).unwrap();
    assert_eq!(again.outcome(), CommandOutcome::AlreadyProcessed);

    let registry = h.ledger.state().unwrap();
    let record = registry.get(&tid()).unwrap();
    assert!(record.ended);
    assert_eq!(record.next_seq, 3);
    assert_eq!(record.outcomes, 1);

    let steps = h.log.trajectory_steps(&tid()).unwrap();
    verify_chain(&steps).unwrap();
    assert_eq!(
        steps[1]
            .causation
            .as_ref()
            .and_then(|c| c.command_id.as_ref())
            .map(|id| id.as_str()),
        Some("k-note")
    );
}

#[test]
fn failed_command_releases_its_key() {
    let h = harness();
    let err = h.ledger.execute(CommandEnvelope::new("k-end", end())).unwrap_err();
    assert!(err.is_precondition());
    assert!(h.commands.lookup("k-end").unwrap().is_none());
    assert!(h.log.is_empty().unwrap());

    h.ledger.execute(CommandEnvelope::new("k-start", start())).unwrap();
    let receipt = h.ledger.execute(CommandEnvelope::new("k-end", end())).unwrap();
    assert!(!receipt.replayed);
    assert_eq!(h.log.len().unwrap(), 2);
}

#[test]
fn empty_idempotency_key_is_rejected() {
    let h = harness();
    let err = h.ledger.execute(CommandEnvelope::new("  ", start())).unwrap_err();
    assert!(err.is_validation());
}
