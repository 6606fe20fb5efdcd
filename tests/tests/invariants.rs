//! Cross-component invariants and the full pre/post/close loop.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;

use e2e_tests::harness;
use eidos_core::distillation::{normalize_statement, Distillation, DistillationKind};
use eidos_core::episode::Outcome;
use eidos_core::phase::Phase;
use eidos_core::storage::{EidosStorage as _, EvidenceStorage as _};
use proptest::prelude::*;

/// Full loop: pre-action opens episode and step, post-action completes the
/// envelope, close distills, and health reflects all of it.
#[tokio::test]
async fn full_loop_through_the_collaborator_api() {
    let h = harness().await;

    h.ctx
        .record_pending_goal("session-1", "Fix the flaky auth test");
    let mut input = HashMap::new();
    input.insert("command".to_string(), "pytest -k auth".to_string());
    let (step, decision) = h
        .ctx
        .create_step_before_action("session-1", "Bash", &input, "auth tests pass", Some("t-1"))
        .await
        .unwrap();
    assert!(decision.allowed);

    // The preliminary row exists before the action completes
    let preliminary = h.store.get_step(&step.step_id).await.unwrap().unwrap();
    assert_eq!(preliminary.evaluation, eidos_core::step::Evaluation::Unknown);

    // The step belongs to an existing episode carrying the pending goal
    let episode = h
        .store
        .get_episode(&preliminary.episode_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(episode.goal, "Fix the flaky auth test");
    assert_eq!(episode.step_count, 1);

    let completed = h
        .ctx
        .complete_step_after_action("session-1", "Bash", true, "3 passed", None)
        .await
        .unwrap();
    assert_eq!(completed.evaluation, eidos_core::step::Evaluation::Pass);
    assert!(completed.is_envelope_complete());

    // Evidence landed for the step
    let artifacts = h.evidence.get_for_step(&completed.step_id).await.unwrap();
    assert_eq!(artifacts.len(), 1);

    let closed = h
        .ctx
        .complete_episode("session-1", None, None)
        .await
        .unwrap();
    assert_eq!(closed.outcome, Outcome::Success);
    assert!(closed.end_ts.unwrap() >= closed.start_ts);

    let health = h.ctx.get_eidos_health().await.unwrap();
    assert_eq!(health.episodes, 1);
    assert_eq!(health.steps, 1);
    assert_eq!(health.stale, 0);
}

/// Claimed success is downgraded when the step record disagrees.
#[tokio::test]
async fn claimed_success_is_cross_checked() {
    let h = harness().await;

    let mut input = HashMap::new();
    input.insert("command".to_string(), "cargo build".to_string());
    h.ctx
        .create_step_before_action("session-2", "Bash", &input, "build succeeds", Some("t-1"))
        .await
        .unwrap();
    h.ctx
        .complete_step_after_action("session-2", "Bash", false, "", Some("compile error"))
        .await
        .unwrap();

    let closed = h
        .ctx
        .complete_episode("session-2", Some(Outcome::Success), None)
        .await
        .unwrap();
    assert_eq!(closed.outcome, Outcome::Failure);
}

/// Usage feedback moves confidence strictly, in both directions.
#[tokio::test]
async fn usage_feedback_is_strictly_monotone() {
    let h = harness().await;

    let d = Distillation::new(
        DistillationKind::Heuristic,
        "When the dev server port is taken, kill the stale process first",
        0.3,
    );
    let id = h.store.save_distillation(&d).await.unwrap();

    let before = h.store.get_distillation(&id).await.unwrap().unwrap();
    h.store.record_distillation_usage(&id, true).await.unwrap();
    let after = h.store.get_distillation(&id).await.unwrap().unwrap();
    assert!(after.confidence > before.confidence);

    h.store.record_distillation_usage(&id, false).await.unwrap();
    let dropped = h.store.get_distillation(&id).await.unwrap().unwrap();
    assert!(dropped.confidence < after.confidence);
}

/// High-contradiction rules end up at or below 0.5 confidence.
#[tokio::test]
async fn contradicted_rules_decay_below_half() {
    let h = harness().await;

    let mut d = Distillation::new(
        DistillationKind::Policy,
        "Always rewrite failing modules from scratch immediately",
        0.7,
    );
    d.confidence = 0.7;
    let id = h.store.save_distillation(&d).await.unwrap();
    for _ in 0..10 {
        h.store.record_distillation_usage(&id, false).await.unwrap();
    }
    let row = h.store.get_distillation(&id).await.unwrap().unwrap();
    assert!(row.times_used >= 10);
    assert!(row.contradiction_count as f32 / row.times_used as f32 >= 0.8);
    assert!(row.confidence <= 0.5);
}

/// The convenience gate blocks without creating steps.
#[tokio::test]
async fn should_block_action_leaves_no_trace() {
    let h = harness().await;

    let mut input = HashMap::new();
    input.insert("command".to_string(), "echo hello".to_string());
    h.ctx
        .create_step_before_action("session-3", "Bash", &input, "prints hello", Some("t-1"))
        .await
        .unwrap();
    h.ctx
        .complete_step_after_action("session-3", "Bash", true, "hello", None)
        .await
        .unwrap();

    let steps_before = h.ctx.get_eidos_health().await.unwrap().steps;
    let mut edit_input = HashMap::new();
    edit_input.insert("file_path".to_string(), "src/main.rs".to_string());
    let verdict = h
        .ctx
        .should_block_action("session-3", "Edit", &edit_input)
        .await
        .unwrap();
    assert!(verdict.is_none());

    let steps_after = h.ctx.get_eidos_health().await.unwrap().steps;
    assert_eq!(steps_before, steps_after);
}

/// A tool call arriving in explore walks the episode through plan into
/// execute, and the acceptance gate is satisfied by a compiled, approved
/// plan along the way.
#[tokio::test]
async fn first_tool_call_advances_through_the_acceptance_gate() {
    let h = harness().await;

    h.ctx
        .record_pending_goal("session-adv", "Make the login tests pass");
    let mut input = HashMap::new();
    input.insert("command".to_string(), "cargo test login".to_string());
    let (step, decision) = h
        .ctx
        .create_step_before_action("session-adv", "Bash", &input, "tests pass", Some("t-1"))
        .await
        .unwrap();
    assert!(decision.allowed);

    let episode = h
        .store
        .get_episode(&step.episode_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(episode.phase, Phase::Execute);

    let plan = h.ctx.acceptance().get_plan(&episode.episode_id).unwrap();
    assert!(plan.is_approved);
    assert!(!plan.critical_tests().is_empty());
    assert!(h
        .ctx
        .acceptance()
        .check_can_execute(&episode.episode_id)
        .ready);
}

/// A destructive command is refused by the high-risk guard, but the
/// preliminary step still lands for the audit trail.
#[tokio::test]
async fn destructive_command_is_refused_but_audited() {
    let h = harness().await;

    let mut input = HashMap::new();
    input.insert("command".to_string(), "rm -rf /".to_string());
    let (step, decision) = h
        .ctx
        .create_step_before_action("session-risk", "Bash", &input, "disk wiped", Some("t-1"))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert!(decision.message.contains("high-risk shell command"));
    assert!(decision
        .required_action
        .as_deref()
        .unwrap()
        .contains("remove_or_sandbox_command"));

    // The audit row exists even though the action was refused
    assert!(h.store.get_step(&step.step_id).await.unwrap().is_some());
}

/// Secret-store reads are refused through the convenience gate as well.
#[tokio::test]
async fn secret_read_is_refused_by_should_block_action() {
    let h = harness().await;

    let mut input = HashMap::new();
    input.insert("command".to_string(), "echo ready".to_string());
    h.ctx
        .create_step_before_action("session-sec", "Bash", &input, "prints ready", Some("t-1"))
        .await
        .unwrap();

    let mut read_input = HashMap::new();
    read_input.insert(
        "file_path".to_string(),
        "/home/user/.ssh/id_rsa".to_string(),
    );
    let verdict = h
        .ctx
        .should_block_action("session-sec", "Read", &read_input)
        .await
        .unwrap();
    assert!(verdict.unwrap().contains("likely-secret"));
}

/// Escape artifacts persist even when the pre-action check refuses the
/// action, so every stuck episode leaves at least one rule behind.
#[tokio::test]
async fn escape_always_leaves_a_learning_artifact() {
    let h = harness().await;

    let mut episode = eidos_core::episode::Episode::new(
        "Chase the deadlock",
        "",
        eidos_core::episode::Budget {
            max_steps: 10,
            ..eidos_core::episode::Budget::default()
        },
    );
    episode.step_count = 9;
    h.store.save_episode(&episode).await.unwrap();

    let mut step = eidos_core::step::Step::new(&episode.episode_id, "poke the scheduler");
    step.decision = "add one more lock".to_string();
    step.prediction = "deadlock clears".to_string();
    step.trace_id = Some("t-1".to_string());

    let outcome = h
        .ctx
        .control()
        .check_before_action(&mut episode, &step, &[], false)
        .await
        .unwrap();
    assert!(outcome.escape.is_some());
    assert!(!h.store.get_all_distillations(10).await.unwrap().is_empty());
}

proptest! {
    /// Statement normalization is idempotent.
    #[test]
    fn normalization_is_idempotent(statement in "[ -~]{0,120}") {
        let once = normalize_statement(&statement);
        let twice = normalize_statement(&once);
        prop_assert_eq!(once, twice);
    }

    /// Any two percentages collapse to the same dedupe key.
    #[test]
    fn percentage_variants_collapse(a in 0u32..1000, b in 0u32..1000) {
        let left = normalize_statement(&format!("When budget is {a}% used, simplify scope"));
        let right = normalize_statement(&format!("When budget is {b}% used, simplify scope"));
        prop_assert_eq!(left, right);
    }
}

/// The transition predicate agrees with the table for every phase pair.
#[test]
fn phase_table_round_trip() {
    for &from in Phase::all() {
        for &to in Phase::all() {
            assert_eq!(
                from.can_transition(to),
                from.allowed_transitions().contains(&to),
                "{from} -> {to}"
            );
        }
    }
    assert!(Phase::Halt.allowed_transitions().is_empty());
}

/// The quality gate rejects the tautology corpus and accepts the good one.
#[test]
fn quality_gate_corpora() {
    use eidos_core::engine::is_quality_distillation;

    let tautologies = [
        "When stuck, try a different approach to the problem",
        "Remember to step back and reconsider your options here",
        "Always validate assumptions before doing anything at all",
        "Be careful when touching the production configuration",
        "When Execute Read, try: Use Read tool",
        "Tool sequence Read -> Edit -> Bash observed in session",
        "This pattern shows a 90% success rate over recent runs",
    ];
    for statement in tautologies {
        assert!(
            !is_quality_distillation(statement, DistillationKind::Heuristic),
            "should reject: {statement}"
        );
    }

    let keepers = [
        "When the auth token check fails in tests, compare expiry in UTC before changing handlers",
        "Never edit generated bindings by hand; regenerate them from the schema definition",
        "Check virtualenv activation before diagnosing any import failure in the test runner",
    ];
    for statement in keepers {
        assert!(
            is_quality_distillation(statement, DistillationKind::Heuristic),
            "should accept: {statement}"
        );
    }
}
