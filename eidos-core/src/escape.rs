//! Escape protocol: the universal recovery routine.
//!
//! When watchers indicate stuck state, the protocol freezes the current
//! approach, summarizes, isolates the smallest failing unit, flips the
//! question, produces up to three hypotheses and one discriminating test,
//! and always leaves behind a learning artifact. If progress is unclear,
//! stop acting and change the question.

use serde::{Deserialize, Serialize};

use crate::distillation::{Distillation, DistillationKind};
use crate::episode::Episode;
use crate::phase::Phase;
use crate::step::{Evaluation, Step};
use crate::watchers::{Severity, WatcherAlert, WatcherEngine, WatcherTag};

/// Budget fraction above which the protocol fires regardless of watchers.
pub const BUDGET_TRIGGER_FRACTION: f32 = 0.8;

/// Output of one escape-protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscapeProtocolResult {
    /// Goal, steps taken, phase, unique errors, recent failures
    pub summary: String,
    /// Most-frequent file across failed steps, or the latest failed decision
    pub smallest_failing_unit: String,
    /// The inverted question that reframes the problem
    pub flipped_question: String,
    /// Up to three candidate explanations
    pub hypotheses: Vec<String>,
    /// The one test that discriminates between them
    pub discriminating_test: String,
    /// Where the episode goes next
    pub new_phase: Phase,
    /// The mandatory learning artifact; saved even if no further progress
    pub learning_artifact: Distillation,
}

/// Deterministic recovery routine.
pub struct EscapeProtocol;

impl EscapeProtocol {
    /// Whether the protocol should fire for this step.
    ///
    /// Any one condition suffices: a watcher tag with two or more firings in
    /// the engine's history, more than 80% of the step budget spent, or two
    /// or more force-severity alerts on the current step.
    #[must_use]
    pub fn should_trigger(
        engine: &WatcherEngine,
        episode: &Episode,
        current_alerts: &[WatcherAlert],
    ) -> bool {
        const TAGS: [WatcherTag; 9] = [
            WatcherTag::RepeatFailure,
            WatcherTag::NoNewEvidence,
            WatcherTag::DiffThrash,
            WatcherTag::ConfidenceStagnation,
            WatcherTag::MemoryBypass,
            WatcherTag::BudgetHalfNoProgress,
            WatcherTag::ScopeCreep,
            WatcherTag::ValidationGap,
            WatcherTag::TraceGap,
        ];
        if TAGS
            .iter()
            .any(|&tag| engine.count_watcher_triggers(tag) >= 2)
        {
            return true;
        }
        if episode.budget_percentage_used() > BUDGET_TRIGGER_FRACTION {
            return true;
        }
        current_alerts
            .iter()
            .filter(|a| a.severity == Severity::Force)
            .count()
            >= 2
    }

    /// Execute the routine against the episode's step history.
    #[must_use]
    pub fn execute(episode: &Episode, steps: &[Step]) -> EscapeProtocolResult {
        let failed: Vec<&Step> = steps
            .iter()
            .filter(|s| s.evaluation == Evaluation::Fail)
            .collect();

        let summary = build_summary(episode, steps, &failed);
        let smallest_failing_unit = isolate_smallest_failing_unit(&failed);
        let flipped_question = flip_question(steps);
        let hypotheses = build_hypotheses(steps);
        let discriminating_test = hypotheses
            .first()
            .map_or_else(String::new, |h| format!("Verify '{h}' directly"));
        let new_phase = if episode.stuck_count >= 2 {
            Phase::Escalate
        } else {
            Phase::Diagnose
        };
        let learning_artifact = build_learning_artifact(episode, steps, &failed);

        EscapeProtocolResult {
            summary,
            smallest_failing_unit,
            flipped_question,
            hypotheses,
            discriminating_test,
            new_phase,
            learning_artifact,
        }
    }
}

fn build_summary(episode: &Episode, steps: &[Step], failed: &[&Step]) -> String {
    let recent_failures: Vec<String> = failed
        .iter()
        .rev()
        .take(3)
        .map(|s| truncate(&s.decision, 60))
        .collect();
    format!(
        "Goal: {}. Steps taken: {}. Phase: {}. Unique errors: {}. Last failures: [{}]",
        truncate(&episode.goal, 80),
        steps.len(),
        episode.phase,
        episode.error_counts.len(),
        recent_failures.join("; ")
    )
}

fn isolate_smallest_failing_unit(failed: &[&Step]) -> String {
    // Most-frequent file across failed steps wins; otherwise the latest
    // failed decision stands in.
    let mut file_counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for step in failed {
        let path = step.file_path();
        if !path.is_empty() {
            *file_counts.entry(path).or_insert(0) += 1;
        }
    }
    if let Some((path, _)) = file_counts.iter().max_by_key(|(_, &count)| count) {
        return (*path).to_string();
    }
    failed
        .last()
        .map_or_else(String::new, |s| truncate(&s.decision, 80))
}

fn flip_question(steps: &[Step]) -> String {
    for step in steps.iter().rev() {
        if let Some(assumption) = step.assumptions.first() {
            return format!("What if assumption '{}' is wrong?", truncate(assumption, 60));
        }
    }
    steps.last().map_or_else(
        || "What would make the current approach impossible?".to_string(),
        |s| {
            format!(
                "What would make '{}' impossible?",
                truncate(&s.decision, 60)
            )
        },
    )
}

fn build_hypotheses(steps: &[Step]) -> Vec<String> {
    let mut hypotheses = Vec::with_capacity(3);
    if let Some(assumption) = steps.iter().rev().find_map(|s| s.assumptions.first()) {
        hypotheses.push(format!(
            "The assumption '{}' is false",
            truncate(assumption, 60)
        ));
    }
    hypotheses.push("The problem lives at a different layer of abstraction".to_string());
    hypotheses.push("A prerequisite is missing, not the logic itself".to_string());
    hypotheses.truncate(3);
    hypotheses
}

fn build_learning_artifact(episode: &Episode, steps: &[Step], failed: &[&Step]) -> Distillation {
    let repeating_error = episode
        .error_counts
        .iter()
        .filter(|(_, &count)| count >= 2)
        .max_by_key(|(_, &count)| count)
        .map(|(signature, _)| signature.clone());

    let (kind, statement) = if let Some(signature) = repeating_error {
        (
            DistillationKind::SharpEdge,
            format!(
                "When error '{}' occurs twice, stop and diagnose the root cause before retrying",
                truncate(&signature, 60)
            ),
        )
    } else if let Some(last_failed) = failed.last() {
        let pattern = generalize_failed_decision(&last_failed.decision);
        (
            DistillationKind::AntiPattern,
            format!("Stop repeating {pattern} after they fail; gather evidence first"),
        )
    } else {
        (
            DistillationKind::Heuristic,
            format!(
                "When budget is {:.0}% used without progress, simplify scope",
                episode.budget_percentage_used() * 100.0
            ),
        )
    };

    let mut artifact = Distillation::new(kind, statement, 0.7);
    // Escape artifacts carry fixed confidence above the per-kind intake cap
    artifact.confidence = 0.7;
    artifact.domains = vec!["escape_protocol".to_string()];
    artifact.triggers = vec![crate::retriever::normalize_intent(&episode.goal)];
    artifact.source_steps = steps.iter().rev().take(3).map(|s| s.step_id.clone()).collect();
    artifact
}

/// Generalize a literal failed decision into a tool/action pattern.
///
/// Encoding a raw command like "Execute: cd /home/x && find ..." verbatim
/// would only ever match itself; "'find' commands" matches future similar
/// actions without matching every unrelated shell command.
#[must_use]
pub fn generalize_failed_decision(raw: &str) -> String {
    const BASH_COMMANDS: &[&str] = &[
        "find", "grep", "cd", "ls", "dir", "cat", "type", "timeout", "curl", "pip", "npm", "git",
        "python", "pytest", "mkdir", "rm", "cp", "mv", "chmod", "findstr",
    ];
    let lower = raw.to_lowercase();
    let lower = lower.trim();

    let tool = if lower.starts_with("execute:") || lower.starts_with("run command:") {
        "Bash"
    } else if lower.starts_with("modify") {
        "Edit"
    } else if lower.starts_with("inspect") {
        "Read"
    } else if lower.starts_with("locate files") {
        "Glob"
    } else if lower.starts_with("search for") {
        "Grep"
    } else {
        "tool"
    };

    if tool == "Bash" {
        for word in lower.split(|c: char| !c.is_ascii_alphanumeric()) {
            if BASH_COMMANDS.contains(&word) {
                return format!("'{word}' commands");
            }
        }
    }
    format!("{tool} operations")
}

fn truncate(text: &str, max_chars: usize) -> String {
    crate::ids::prefix(text, max_chars).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::Budget;

    fn episode() -> Episode {
        Episode::new("Fix auth timeout", "tests pass", Budget::default())
    }

    fn failed_step(decision: &str, file_path: Option<&str>) -> Step {
        let mut step = Step::new("ep0123456789", "attempt fix");
        step.decision = decision.to_string();
        step.evaluation = Evaluation::Fail;
        if let Some(path) = file_path {
            step.action_details
                .insert("file_path".to_string(), path.to_string());
        }
        step
    }

    #[test]
    fn test_trigger_on_budget_fraction() {
        let engine = WatcherEngine::new(false);
        let mut ep = episode();
        ep.budget.max_steps = 10;
        ep.step_count = 9;
        assert!(EscapeProtocol::should_trigger(&engine, &ep, &[]));

        ep.step_count = 7;
        assert!(!EscapeProtocol::should_trigger(&engine, &ep, &[]));
    }

    #[test]
    fn test_trigger_on_repeated_watcher_firings() {
        let engine = WatcherEngine::new(false);
        let mut ep = episode();
        ep.record_error("Bash:boom");
        ep.record_error("Bash:boom");
        let step = Step::new(&ep.episode_id, "retry");
        engine.check_all(&ep, &step, &[], false);
        assert!(!EscapeProtocol::should_trigger(&engine, &ep, &[]));
        engine.check_all(&ep, &step, &[], false);
        assert!(EscapeProtocol::should_trigger(&engine, &ep, &[]));
    }

    #[test]
    fn test_sharp_edge_artifact_for_repeating_error() {
        let mut ep = episode();
        ep.record_error("Bash:ImportError: no module X");
        ep.record_error("Bash:ImportError: no module X");
        let steps = vec![failed_step("pytest -k auth", None)];

        let result = EscapeProtocol::execute(&ep, &steps);
        let artifact = &result.learning_artifact;
        assert_eq!(artifact.kind, DistillationKind::SharpEdge);
        assert!(artifact
            .statement
            .starts_with("When error 'Bash:ImportError"));
        assert!((artifact.confidence - 0.7).abs() < f32::EPSILON);
        assert_eq!(artifact.domains, vec!["escape_protocol".to_string()]);
        assert_eq!(result.new_phase, Phase::Diagnose);
    }

    #[test]
    fn test_anti_pattern_artifact_generalizes_command() {
        let ep = episode();
        let steps = vec![failed_step(
            "Execute: cd /home/user/project && find . -name '*.py'",
            None,
        )];
        let result = EscapeProtocol::execute(&ep, &steps);
        let artifact = &result.learning_artifact;
        assert_eq!(artifact.kind, DistillationKind::AntiPattern);
        assert!(artifact.statement.contains("'find' commands"));
        assert!(!artifact.statement.contains("/home/user"));
    }

    #[test]
    fn test_heuristic_artifact_without_failures() {
        let mut ep = episode();
        ep.budget.max_steps = 10;
        ep.step_count = 9;
        let result = EscapeProtocol::execute(&ep, &[]);
        let artifact = &result.learning_artifact;
        assert_eq!(artifact.kind, DistillationKind::Heuristic);
        assert!(artifact.statement.contains("simplify scope"));
        assert!(!artifact.statement.contains('/'));
    }

    #[test]
    fn test_escalate_when_stuck_twice() {
        let mut ep = episode();
        ep.stuck_count = 2;
        let result = EscapeProtocol::execute(&ep, &[]);
        assert_eq!(result.new_phase, Phase::Escalate);
    }

    #[test]
    fn test_smallest_failing_unit_prefers_frequent_file() {
        let ep = episode();
        let steps = vec![
            failed_step("edit a", Some("src/auth.rs")),
            failed_step("edit b", Some("src/auth.rs")),
            failed_step("edit c", Some("src/other.rs")),
        ];
        let result = EscapeProtocol::execute(&ep, &steps);
        assert_eq!(result.smallest_failing_unit, "src/auth.rs");
    }

    #[test]
    fn test_flipped_question_uses_recent_assumption() {
        let ep = episode();
        let mut step = failed_step("edit auth", None);
        step.assumptions = vec!["token refresh is enabled".to_string()];
        let result = EscapeProtocol::execute(&ep, &[step]);
        assert!(result
            .flipped_question
            .contains("token refresh is enabled"));
        assert_eq!(result.hypotheses.len(), 3);
        assert!(result.discriminating_test.starts_with("Verify"));
    }

    #[test]
    fn test_generalize_failed_decision_variants() {
        assert_eq!(
            generalize_failed_decision("Execute: cd /x && find . -name foo"),
            "'find' commands"
        );
        assert_eq!(
            generalize_failed_decision("Run command: git push origin main"),
            "'git' commands"
        );
        assert_eq!(generalize_failed_decision("Modify src/auth.rs"), "Edit operations");
        assert_eq!(generalize_failed_decision("Inspect the config"), "Read operations");
        assert_eq!(generalize_failed_decision("Something else"), "tool operations");
    }
}
