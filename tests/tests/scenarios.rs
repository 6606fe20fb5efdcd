//! End-to-end scenarios over fresh stores, driving the full
//! pre-action → post-action → close → distill loop.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;

use e2e_tests::harness;
use eidos_core::distillation::{Distillation, DistillationKind};
use eidos_core::episode::{Budget, Episode, Outcome};
use eidos_core::escape::EscapeProtocol;
use eidos_core::phase::Phase;
use eidos_core::step::{Evaluation, Step};
use eidos_core::storage::EidosStorage as _;
use eidos_core::watchers::WatcherTag;

fn completed_step(
    episode_id: &str,
    intent: &str,
    decision: &str,
    tool: &str,
    evaluation: Evaluation,
    confidence_after: f32,
) -> Step {
    let mut step = Step::new(episode_id, intent);
    step.decision = decision.to_string();
    step.prediction = "works as intended".to_string();
    step.action_details
        .insert("tool".to_string(), tool.to_string());
    step.result = match evaluation {
        Evaluation::Fail => "it failed".to_string(),
        _ => "it worked".to_string(),
    };
    step.evaluation = evaluation;
    step.confidence_after = confidence_after;
    step.validated = true;
    step.validation_method = "output:expected".to_string();
    step
}

/// S1 — a success episode produces exactly one heuristic anchored on the
/// decisive edit, plus (at most) a low-confidence playbook.
#[tokio::test]
async fn s1_success_episode_produces_one_heuristic() {
    let h = harness().await;

    let mut episode = Episode::new("Fix auth timeout", "tests pass", Budget::default());
    let steps = vec![
        completed_step(
            &episode.episode_id,
            "Read auth.py",
            "Inspect token.expired()",
            "Read",
            Evaluation::Pass,
            0.75,
        ),
        completed_step(
            &episode.episode_id,
            "Edit auth.py",
            "Replace token.expired() with token.expired_utc()",
            "Edit",
            Evaluation::Pass,
            0.82,
        ),
        {
            let mut run = completed_step(
                &episode.episode_id,
                "Run tests",
                "pytest tests/test_auth.py",
                "Bash",
                Evaluation::Pass,
                0.90,
            );
            run.validation_method = "test:passed".to_string();
            run
        },
    ];
    h.store.save_episode(&episode).await.unwrap();
    for step in &steps {
        h.store.save_step(step).await.unwrap();
    }
    episode.step_count = 3;
    episode.close(Outcome::Success, "auth timeout fixed");
    h.store.save_episode(&episode).await.unwrap();

    h.ctx
        .engine()
        .distill_episode(&h.store, &episode, &steps)
        .await
        .unwrap();

    let heuristics = h
        .store
        .get_distillations_by_kind(DistillationKind::Heuristic, 20)
        .await
        .unwrap();
    assert_eq!(heuristics.len(), 1);
    let heuristic = &heuristics[0];
    assert!(heuristic
        .statement
        .contains("Replace token.expired() with token.expired_utc()"));
    assert!(heuristic.confidence <= 0.4);
    assert!(!heuristic.triggers.is_empty());
    assert!(heuristic
        .triggers
        .iter()
        .any(|t| t == "read" || t == "edit" || t == "bash" || t.contains("auth")));

    let playbooks = h
        .store
        .get_distillations_by_kind(DistillationKind::Playbook, 20)
        .await
        .unwrap();
    for playbook in &playbooks {
        assert!((playbook.confidence - 0.30).abs() < f32::EPSILON);
    }
}

/// S2 — a repeated error signature refuses the third attempt, forces
/// diagnose, and the escape routine's artifact is a 0.7 sharp edge.
#[tokio::test]
async fn s2_repeat_failure_forces_diagnose_with_learning_artifact() {
    let h = harness().await;

    let mut episode = Episode::new("Fix failing import", "pytest green", Budget::default());
    episode.phase = Phase::Execute;
    h.store.save_episode(&episode).await.unwrap();

    let failing = |episode_id: &str| {
        let mut step = completed_step(
            episode_id,
            "Run pytest",
            "Execute: pytest -k auth",
            "Bash",
            Evaluation::Fail,
            0.4,
        );
        step.result = "ImportError: no module X".to_string();
        step
    };

    let first = failing(&episode.episode_id);
    h.store.save_step(&first).await.unwrap();
    h.ctx.control().process_after_action(&mut episode, &first);
    let second = failing(&episode.episode_id);
    h.store.save_step(&second).await.unwrap();
    h.ctx.control().process_after_action(&mut episode, &second);
    h.store.save_episode(&episode).await.unwrap();

    let mut third = Step::new(&episode.episode_id, "Run pytest again");
    third.decision = "Execute: pytest -k auth".to_string();
    third.prediction = "tests pass this time".to_string();
    third.trace_id = Some("t-3".to_string());

    let recent = vec![first, second];
    let outcome = h
        .ctx
        .control()
        .check_before_action(&mut episode, &third, &recent, false)
        .await
        .unwrap();
    assert!(!outcome.decision.allowed);
    let alert = outcome
        .alerts
        .iter()
        .find(|a| a.tag == WatcherTag::RepeatFailure)
        .unwrap();
    assert_eq!(alert.forced_phase, Some(Phase::Diagnose));
    assert_eq!(episode.phase, Phase::Diagnose);

    // The escape routine's mandatory artifact for this state
    let result = EscapeProtocol::execute(&episode, &recent);
    let artifact = &result.learning_artifact;
    assert_eq!(artifact.kind, DistillationKind::SharpEdge);
    assert!(artifact.statement.starts_with("When error '"));
    assert!(artifact.statement.contains("ImportError"));
    assert!(artifact.statement.contains("occurs twice, stop and diagnose"));
    assert!((artifact.confidence - 0.7).abs() < f32::EPSILON);
}

/// S3 — percentage variants of one rule collapse into a single row with a
/// stable id and summed counters.
#[tokio::test]
async fn s3_deduplicated_distillations() {
    let h = harness().await;

    let first = Distillation::new(
        DistillationKind::Heuristic,
        "When budget is 82% used without progress, simplify scope",
        0.3,
    );
    let mut second = Distillation::new(
        DistillationKind::Heuristic,
        "When budget is 91% used without progress, simplify scope",
        0.3,
    );
    second.times_used = 2;

    let id1 = h.store.save_distillation(&first).await.unwrap();
    let id2 = h.store.save_distillation(&second).await.unwrap();
    assert_eq!(id2, id1);

    let all = h.store.get_all_distillations(10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].distillation_id, id1);
    assert_eq!(all[0].times_used, 2);
}

/// S4 — anti-pattern feedback only fires when the rule's targeted action
/// overlaps the step's decision.
#[tokio::test]
async fn s4_anti_pattern_relevance_filter() {
    let h = harness().await;

    let mut anti = Distillation::new(
        DistillationKind::AntiPattern,
        "When repeated 'find' commands fail, try a different approach",
        0.35,
    );
    anti.anti_triggers = vec!["execute".to_string()];
    let anti_id = h.store.save_distillation(&anti).await.unwrap();

    // Unrelated decision: feedback MUST NOT be recorded
    let mut input = HashMap::new();
    input.insert("command".to_string(), "git push origin main".to_string());
    let (step, _decision) = h
        .ctx
        .create_step_before_action("s4-git", "Bash", &input, "push succeeds", Some("t-1"))
        .await
        .unwrap();
    assert!(step.retrieved_memories.contains(&anti_id));
    h.ctx
        .complete_step_after_action("s4-git", "Bash", false, "", Some("error: failed to push"))
        .await
        .unwrap();
    let row = h.store.get_distillation(&anti_id).await.unwrap().unwrap();
    assert_eq!(row.times_used, 0);

    // Targeted decision: feedback MUST be recorded
    let mut input = HashMap::new();
    input.insert("command".to_string(), "find . -name '*.py'".to_string());
    let (step, _decision) = h
        .ctx
        .create_step_before_action("s4-find", "Bash", &input, "files listed", Some("t-2"))
        .await
        .unwrap();
    assert!(step.retrieved_memories.contains(&anti_id));
    h.ctx
        .complete_step_after_action("s4-find", "Bash", false, "", Some("error: nothing found"))
        .await
        .unwrap();
    let row = h.store.get_distillation(&anti_id).await.unwrap().unwrap();
    assert_eq!(row.times_used, 1);
    assert_eq!(row.contradiction_count, 1);
}

/// S5 — an idle in-progress episode auto-closes with the majority outcome
/// and a distillation pass.
#[tokio::test]
async fn s5_stale_episode_auto_closes() {
    let h = harness().await;

    let mut episode = Episode::new("Fix auth timeout", "tests pass", Budget::default());
    episode.start_ts = chrono::Utc::now() - chrono::Duration::seconds(2000);
    episode.step_count = 2;
    h.store.save_episode(&episode).await.unwrap();

    let passing = completed_step(
        &episode.episode_id,
        "Edit handler",
        "Raise the read timeout on the auth client",
        "Edit",
        Evaluation::Pass,
        0.8,
    );
    let failing = completed_step(
        &episode.episode_id,
        "Run checks",
        "Execute: pytest -k timeout",
        "Bash",
        Evaluation::Fail,
        0.4,
    );
    h.store.save_step(&passing).await.unwrap();
    h.store.save_step(&failing).await.unwrap();

    let closed = h.ctx.sweep_stale_episodes().await.unwrap();
    assert_eq!(closed, vec![episode.episode_id.clone()]);

    let reloaded = h
        .store
        .get_episode(&episode.episode_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.outcome, Outcome::Partial);
    assert!(reloaded.end_ts.is_some());
    assert_eq!(
        reloaded.final_evaluation,
        "Auto-closed: 1 passed, 1 failed out of 2 steps"
    );

    // The distillation engine ran on close
    let distillations = h.store.get_all_distillations(20).await.unwrap();
    assert!(!distillations.is_empty());
}

/// S6 — at 90% budget with no progress, the escape protocol fires and its
/// heuristic artifact lands in the store under the escape domain, free of
/// literal paths.
#[tokio::test]
async fn s6_escape_after_budget_overrun() {
    let h = harness().await;

    let mut episode = Episode::new("Untangle the build", "green build", Budget::default());
    episode.budget.max_steps = 10;
    episode.step_count = 9;
    h.store.save_episode(&episode).await.unwrap();

    let stalled: Vec<Step> = (0..5)
        .map(|i| {
            let mut step = Step::new(&episode.episode_id, format!("poke at config {i}"));
            step.decision = "adjust one flag".to_string();
            step.prediction = "build recovers".to_string();
            step.trace_id = Some(format!("t-{i}"));
            step
        })
        .collect();

    let mut attempt = Step::new(&episode.episode_id, "try another flag");
    attempt.decision = "adjust one more flag".to_string();
    attempt.prediction = "build recovers".to_string();
    attempt.trace_id = Some("t-9".to_string());

    let outcome = h
        .ctx
        .control()
        .check_before_action(&mut episode, &attempt, &stalled, false)
        .await
        .unwrap();
    assert!(!outcome.decision.allowed);
    let escape = outcome.escape.unwrap();
    assert_eq!(escape.new_phase, Phase::Diagnose);
    assert!(episode.escape_protocol_triggered);

    let artifacts = h
        .store
        .get_distillations_by_domain("escape_protocol", 10)
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 1);
    let artifact = &artifacts[0];
    assert_eq!(artifact.kind, DistillationKind::Heuristic);
    assert!(!artifact.statement.contains('/'));
    assert!(!artifact.statement.contains('\\'));

    // With a history of being stuck, the protocol escalates instead
    let mut stuck = Episode::new("Untangle the build again", "", Budget::default());
    stuck.budget.max_steps = 10;
    stuck.step_count = 9;
    stuck.stuck_count = 2;
    let result = EscapeProtocol::execute(&stuck, &[]);
    assert_eq!(result.new_phase, Phase::Escalate);
}
