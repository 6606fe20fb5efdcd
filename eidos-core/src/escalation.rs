//! Escalation: intelligent recognition of limits.
//!
//! Escalation is not failure. When the budget runs out, a loop repeats,
//! confidence collapses, a guardrail blocks, or the territory is unknown,
//! the core produces a structured document for external display; rendering
//! and delivery are someone else's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::episode::Episode;
use crate::step::{Evaluation, Step};

/// Why the episode is escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// Budget exhausted
    Budget,
    /// Loop detected
    Loop,
    /// Confidence collapsed
    Confidence,
    /// Guardrail blocked the action
    Blocked,
    /// Unknown territory
    Unknown,
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            EscalationKind::Budget => "budget",
            EscalationKind::Loop => "loop",
            EscalationKind::Confidence => "confidence",
            EscalationKind::Blocked => "blocked",
            EscalationKind::Unknown => "unknown",
        };
        write!(f, "{value}")
    }
}

/// What kind of help is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Missing context or knowledge
    Info,
    /// Choice between valid approaches
    Decision,
    /// Stuck, need intervention
    Help,
    /// Uncertain about a risky action
    Review,
}

/// Record of an attempted approach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub approach: String,
    pub result: String,
    pub why_failed: String,
}

/// A finding collected during the episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: String,
    pub finding: String,
}

/// Minimal reproduction of an issue, when one exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinimalReproduction {
    pub description: String,
    pub steps_to_reproduce: Vec<String>,
    pub expected: String,
    pub actual: String,
    pub environment: HashMap<String, String>,
}

/// A suggested option with its tradeoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedOption {
    pub option: String,
    pub tradeoff: String,
}

/// The escalation document surfaced to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub episode_id: String,
    pub escalation_kind: EscalationKind,

    pub goal: String,
    pub progress: String,
    pub blocker: String,

    pub attempts: Vec<Attempt>,
    pub evidence_gathered: Vec<Finding>,

    pub current_hypothesis: String,
    pub minimal_reproduction: Option<MinimalReproduction>,

    pub request_kind: RequestKind,
    pub specific_question: String,
    pub suggested_options: Vec<SuggestedOption>,

    pub created_at: DateTime<Utc>,
    pub step_count: usize,
    pub elapsed_seconds: i64,
}

impl Escalation {
    /// Render the document as YAML for external display.
    #[must_use]
    pub fn to_yaml(&self) -> String {
        let mut lines = vec![
            "escalation:".to_string(),
            format!("  episode_id: \"{}\"", self.episode_id),
            format!(
                "  escalation_type: {}",
                self.escalation_kind.to_string().to_uppercase()
            ),
            String::new(),
            "  summary:".to_string(),
            format!("    goal: \"{}\"", self.goal),
            format!("    progress: \"{}\"", self.progress),
            format!("    blocker: \"{}\"", self.blocker),
        ];

        if !self.attempts.is_empty() {
            lines.push(String::new());
            lines.push("  attempts:".to_string());
            for attempt in &self.attempts {
                lines.push(format!("    - approach: \"{}\"", attempt.approach));
                lines.push(format!("      result: \"{}\"", attempt.result));
                lines.push(format!("      why_failed: \"{}\"", attempt.why_failed));
            }
        }

        if !self.evidence_gathered.is_empty() {
            lines.push(String::new());
            lines.push("  evidence_gathered:".to_string());
            for finding in &self.evidence_gathered {
                lines.push(format!("    - type: \"{}\"", finding.kind));
                lines.push(format!("      finding: \"{}\"", finding.finding));
            }
        }

        if !self.current_hypothesis.is_empty() {
            lines.push(String::new());
            lines.push(format!(
                "  current_hypothesis: \"{}\"",
                self.current_hypothesis
            ));
        }

        if let Some(repro) = &self.minimal_reproduction {
            lines.push(String::new());
            lines.push("  minimal_reproduction:".to_string());
            lines.push(format!("    description: \"{}\"", repro.description));
            lines.push("    steps_to_reproduce:".to_string());
            for step in &repro.steps_to_reproduce {
                lines.push(format!("      - \"{step}\""));
            }
            lines.push(format!("    expected: \"{}\"", repro.expected));
            lines.push(format!("    actual: \"{}\"", repro.actual));
        }

        lines.push(String::new());
        lines.push(format!(
            "  request_type: {}",
            format!("{:?}", self.request_kind).to_uppercase()
        ));
        lines.push(format!(
            "  specific_question: \"{}\"",
            self.specific_question
        ));

        if !self.suggested_options.is_empty() {
            lines.push(String::new());
            lines.push("  suggested_options:".to_string());
            for option in &self.suggested_options {
                lines.push(format!("    - option: \"{}\"", option.option));
                lines.push(format!("      tradeoff: \"{}\"", option.tradeoff));
            }
        }

        lines.join("\n")
    }
}

/// Build an escalation document from episode state.
#[must_use]
pub fn build_escalation(
    episode: &Episode,
    steps: &[Step],
    kind: EscalationKind,
    blocker: &str,
) -> Escalation {
    let elapsed = (Utc::now() - episode.start_ts).num_seconds().max(0);

    // Last 5 failed approaches with their reasons
    let attempts: Vec<Attempt> = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Fail)
        .map(|s| Attempt {
            approach: clip(&s.decision, 100, "Unknown approach"),
            result: clip(&s.result, 100, "Unknown result"),
            why_failed: clip(&s.lesson, 100, "Unknown reason"),
        })
        .collect();
    let attempts = tail(attempts, 5);

    // Last 5 lessons with a known evaluation
    let evidence: Vec<Finding> = steps
        .iter()
        .filter(|s| !s.lesson.is_empty() && s.evaluation != Evaluation::Unknown)
        .map(|s| Finding {
            kind: s.action_kind.to_string(),
            finding: clip(&s.lesson, 150, ""),
        })
        .collect();
    let evidence = tail(evidence, 5);

    // Hypothesis: the latest confident lesson
    let hypothesis = steps
        .iter()
        .rev()
        .find(|s| s.confidence_after > 0.5 && !s.lesson.is_empty())
        .map(|s| clip(&s.lesson, 200, ""))
        .unwrap_or_default();

    let (request_kind, question) = determine_request(kind, steps.len(), blocker);

    let options = if request_kind == RequestKind::Decision {
        generate_options(blocker)
    } else {
        Vec::new()
    };

    Escalation {
        episode_id: episode.episode_id.clone(),
        escalation_kind: kind,
        goal: episode.goal.clone(),
        progress: summarize_progress(steps),
        blocker: blocker.to_string(),
        attempts,
        evidence_gathered: evidence,
        current_hypothesis: hypothesis,
        minimal_reproduction: None,
        request_kind,
        specific_question: question,
        suggested_options: options,
        created_at: Utc::now(),
        step_count: steps.len(),
        elapsed_seconds: elapsed,
    }
}

fn determine_request(kind: EscalationKind, step_count: usize, blocker: &str) -> (RequestKind, String) {
    match kind {
        EscalationKind::Budget => (
            RequestKind::Help,
            format!("Budget exhausted with {step_count} steps. Need guidance on how to proceed."),
        ),
        EscalationKind::Loop => (
            RequestKind::Decision,
            "Detected loop pattern. Which approach should I try next?".to_string(),
        ),
        EscalationKind::Confidence => (
            RequestKind::Info,
            "Confidence dropped significantly. What context am I missing?".to_string(),
        ),
        EscalationKind::Blocked => (
            RequestKind::Review,
            format!("Action blocked: {blocker}. Please confirm how to proceed."),
        ),
        EscalationKind::Unknown => (
            RequestKind::Info,
            "No relevant memory found and high uncertainty. What should I know?".to_string(),
        ),
    }
}

fn generate_options(blocker: &str) -> Vec<SuggestedOption> {
    let blocker_lower = blocker.to_lowercase();
    let mut options = Vec::new();
    if blocker_lower.contains("edit") || blocker_lower.contains("modify") {
        options.push(SuggestedOption {
            option: "Gather more diagnostic evidence before editing".to_string(),
            tradeoff: "Slower but more likely to succeed".to_string(),
        });
        options.push(SuggestedOption {
            option: "Try a different approach entirely".to_string(),
            tradeoff: "May require rethinking the solution".to_string(),
        });
    } else {
        options.push(SuggestedOption {
            option: "Continue with current approach".to_string(),
            tradeoff: "Risk of more failures".to_string(),
        });
        options.push(SuggestedOption {
            option: "Escalate to human for guidance".to_string(),
            tradeoff: "Requires human time".to_string(),
        });
    }
    options.truncate(4);
    options
}

fn summarize_progress(steps: &[Step]) -> String {
    let passed = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Pass)
        .count();
    let failed = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Fail)
        .count();
    let total = steps.len();

    if passed > 0 && failed == 0 {
        format!("Made good progress: {passed}/{total} steps succeeded")
    } else if passed > failed {
        format!("Partial progress: {passed} succeeded, {failed} failed")
    } else if passed == 0 {
        format!("Struggling: {failed} failed attempts so far")
    } else {
        format!("Mixed results: {passed} passed, {failed} failed")
    }
}

fn clip(text: &str, max_chars: usize, fallback: &str) -> String {
    if text.is_empty() {
        return fallback.to_string();
    }
    crate::ids::prefix(text, max_chars).to_string()
}

fn tail<T>(mut items: Vec<T>, keep: usize) -> Vec<T> {
    if items.len() > keep {
        items.drain(..items.len() - keep);
    }
    items
}
