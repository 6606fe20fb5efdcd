use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{derive_id, now_micros, prefix};
use crate::phase::Phase;

/// Confidence-stagnation threshold: the spread of recent confidence samples
/// must stay strictly below this for the stagnation watcher to fire.
pub const CONFIDENCE_STAGNATION_THRESHOLD: f32 = 0.05;

/// Confidence samples kept per episode.
pub const CONFIDENCE_HISTORY_CAP: usize = 10;

/// Outcome of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
    Escalated,
    InProgress,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
            Outcome::Escalated => "escalated",
            Outcome::InProgress => "in_progress",
        };
        write!(f, "{value}")
    }
}

impl Outcome {
    /// Parse the snake_case wire value, falling back to `InProgress`.
    #[must_use]
    pub fn parse(value: &str) -> Outcome {
        match value {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            "partial" => Outcome::Partial,
            "escalated" => Outcome::Escalated,
            _ => Outcome::InProgress,
        }
    }
}

/// Resource constraints for an episode.
///
/// Budget exhaustion forces a transition to `Halt` and produces an
/// escalation document plus at least one learning artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum steps before the episode halts
    pub max_steps: u32,
    /// Wall-clock limit in seconds
    pub max_time_seconds: u64,
    /// After this many failures with one error signature, stop retrying
    pub max_retries_per_error: u32,
    /// Maximum modifications of the same file per episode
    pub max_file_touches: u32,
    /// Force diagnose after this many steps without new evidence
    pub no_evidence_limit: u32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_time_seconds: 720,
            max_retries_per_error: 2,
            max_file_touches: 3,
            no_evidence_limit: 5,
        }
    }
}

/// A bounded learning unit.
///
/// Every episode has a clear goal, success criteria, budget constraints, and
/// explicit phase tracking. Counters accumulated here (error signatures,
/// file touches, evidence streak, confidence history) feed the watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Opaque 12-hex id derived from goal prefix + start time
    pub episode_id: String,
    /// What this episode is trying to accomplish
    pub goal: String,
    /// How success will be judged
    pub success_criteria: String,
    /// Operating constraints stated for this episode
    pub constraints: Vec<String>,
    /// Resource envelope, fixed at creation
    pub budget: Budget,
    /// Current phase
    pub phase: Phase,
    /// Outcome; `InProgress` iff `end_ts` is unset
    pub outcome: Outcome,
    /// Closing summary text
    pub final_evaluation: String,
    /// When the episode started
    pub start_ts: DateTime<Utc>,
    /// When the episode closed
    pub end_ts: Option<DateTime<Utc>>,

    /// Number of persisted steps
    pub step_count: u32,
    /// error_signature -> occurrence count
    pub error_counts: HashMap<String, u32>,
    /// file path -> touch count
    pub file_touch_counts: HashMap<String, u32>,
    /// Consecutive steps without new evidence
    pub no_evidence_streak: u32,
    /// Recent confidence samples, capped at [`CONFIDENCE_HISTORY_CAP`]
    pub confidence_history: Vec<f32>,
    /// Times the episode entered diagnose/simplify
    pub stuck_count: u32,
    /// Whether the escape protocol has fired
    pub escape_protocol_triggered: bool,
}

impl Episode {
    /// Create a new episode in the explore phase.
    pub fn new(goal: impl Into<String>, success_criteria: impl Into<String>, budget: Budget) -> Self {
        let goal = goal.into();
        let start_ts = now_micros();
        let episode_id = derive_id(&format!("{}:{}", prefix(&goal, 50), start_ts.timestamp()));
        Self {
            episode_id,
            goal,
            success_criteria: success_criteria.into(),
            constraints: Vec::new(),
            budget,
            phase: Phase::Explore,
            outcome: Outcome::InProgress,
            final_evaluation: String::new(),
            start_ts,
            end_ts: None,
            step_count: 0,
            error_counts: HashMap::new(),
            file_touch_counts: HashMap::new(),
            no_evidence_streak: 0,
            confidence_history: Vec::new(),
            stuck_count: 0,
            escape_protocol_triggered: false,
        }
    }

    /// Check if any budget limit is exceeded.
    #[must_use]
    pub fn is_budget_exceeded(&self) -> bool {
        if self.step_count >= self.budget.max_steps {
            return true;
        }
        let elapsed = (Utc::now() - self.start_ts).num_seconds();
        elapsed >= 0 && elapsed as u64 >= self.budget.max_time_seconds
    }

    /// Check if the retry limit is hit for an error signature.
    #[must_use]
    pub fn is_error_limit_exceeded(&self, error_signature: &str) -> bool {
        self.error_counts.get(error_signature).copied().unwrap_or(0)
            >= self.budget.max_retries_per_error
    }

    /// Record an error occurrence.
    pub fn record_error(&mut self, error_signature: impl Into<String>) {
        *self.error_counts.entry(error_signature.into()).or_insert(0) += 1;
    }

    /// Record that a file was modified.
    pub fn record_file_touch(&mut self, file_path: impl Into<String>) {
        *self.file_touch_counts.entry(file_path.into()).or_insert(0) += 1;
    }

    /// Check if a file has been touched too many times to keep modifying.
    #[must_use]
    pub fn is_file_frozen(&self, file_path: &str) -> bool {
        self.file_touch_counts.get(file_path).copied().unwrap_or(0) >= self.budget.max_file_touches
    }

    /// Files that can no longer be modified this episode.
    #[must_use]
    pub fn frozen_files(&self) -> Vec<&str> {
        self.file_touch_counts
            .iter()
            .filter(|(_, &count)| count >= self.budget.max_file_touches)
            .map(|(path, _)| path.as_str())
            .collect()
    }

    /// Track the evidence streak: resets on any step with new evidence.
    pub fn record_evidence(&mut self, has_evidence: bool) {
        if has_evidence {
            self.no_evidence_streak = 0;
        } else {
            self.no_evidence_streak += 1;
        }
    }

    /// Check if the episode has gone too long without new evidence.
    #[must_use]
    pub fn is_no_evidence_limit_exceeded(&self) -> bool {
        self.no_evidence_streak >= self.budget.no_evidence_limit
    }

    /// Track confidence over time for stagnation detection.
    pub fn record_confidence(&mut self, confidence: f32) {
        self.confidence_history.push(confidence);
        if self.confidence_history.len() > CONFIDENCE_HISTORY_CAP {
            let excess = self.confidence_history.len() - CONFIDENCE_HISTORY_CAP;
            self.confidence_history.drain(..excess);
        }
    }

    /// Check if confidence has failed to move across the last `window` samples.
    ///
    /// The spread must be strictly below the threshold: a spread of exactly
    /// 0.05 is not stagnant.
    #[must_use]
    pub fn is_confidence_stagnant(&self, threshold: Option<f32>, window: usize) -> bool {
        if self.confidence_history.len() < window {
            return false;
        }
        let recent = &self.confidence_history[self.confidence_history.len() - window..];
        let max = recent.iter().copied().fold(f32::MIN, f32::max);
        let min = recent.iter().copied().fold(f32::MAX, f32::min);
        (max - min) < threshold.unwrap_or(CONFIDENCE_STAGNATION_THRESHOLD)
    }

    /// Fraction of the step budget used.
    #[must_use]
    pub fn budget_percentage_used(&self) -> f32 {
        if self.budget.max_steps == 0 {
            return 1.0;
        }
        self.step_count as f32 / self.budget.max_steps as f32
    }

    /// Whether the episode is closed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end_ts.is_some() && self.outcome != Outcome::InProgress
    }

    /// Close the episode with an outcome and summary.
    pub fn close(&mut self, outcome: Outcome, final_evaluation: impl Into<String>) {
        self.outcome = outcome;
        self.final_evaluation = final_evaluation.into();
        self.end_ts = Some(now_micros());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_creation() {
        let episode = Episode::new("Fix auth timeout", "tests pass", Budget::default());

        assert_eq!(episode.episode_id.len(), 12);
        assert_eq!(episode.phase, Phase::Explore);
        assert_eq!(episode.outcome, Outcome::InProgress);
        assert!(!episode.is_complete());
        assert_eq!(episode.step_count, 0);
    }

    #[test]
    fn test_budget_exceeded_at_exact_step_limit() {
        let mut episode = Episode::new("goal", "", Budget::default());
        episode.step_count = episode.budget.max_steps - 1;
        assert!(!episode.is_budget_exceeded());
        episode.step_count = episode.budget.max_steps;
        assert!(episode.is_budget_exceeded());
    }

    #[test]
    fn test_error_limit() {
        let mut episode = Episode::new("goal", "", Budget::default());
        episode.record_error("Bash:ImportError");
        assert!(!episode.is_error_limit_exceeded("Bash:ImportError"));
        episode.record_error("Bash:ImportError");
        assert!(episode.is_error_limit_exceeded("Bash:ImportError"));
        assert!(!episode.is_error_limit_exceeded("Bash:other"));
    }

    #[test]
    fn test_file_freeze_after_max_touches() {
        let mut episode = Episode::new("goal", "", Budget::default());
        for _ in 0..3 {
            episode.record_file_touch("src/auth.rs");
        }
        assert!(episode.is_file_frozen("src/auth.rs"));
        assert_eq!(episode.frozen_files(), vec!["src/auth.rs"]);
        assert!(!episode.is_file_frozen("src/other.rs"));
    }

    #[test]
    fn test_no_evidence_streak_resets() {
        let mut episode = Episode::new("goal", "", Budget::default());
        for _ in 0..4 {
            episode.record_evidence(false);
        }
        assert_eq!(episode.no_evidence_streak, 4);
        episode.record_evidence(true);
        assert_eq!(episode.no_evidence_streak, 0);
    }

    #[test]
    fn test_confidence_history_is_bounded() {
        let mut episode = Episode::new("goal", "", Budget::default());
        for i in 0..20 {
            episode.record_confidence(i as f32 / 20.0);
        }
        assert_eq!(episode.confidence_history.len(), CONFIDENCE_HISTORY_CAP);
        // Oldest samples were dropped
        assert!((episode.confidence_history[0] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_confidence_stagnation_is_strict() {
        let mut episode = Episode::new("goal", "", Budget::default());
        episode.confidence_history = vec![0.50, 0.52, 0.53];
        assert!(episode.is_confidence_stagnant(None, 3));

        // Spread of exactly 0.05 is not stagnant (strict less-than)
        episode.confidence_history = vec![0.50, 0.52, 0.55];
        assert!(!episode.is_confidence_stagnant(None, 3));

        // Too few samples
        episode.confidence_history = vec![0.5, 0.5];
        assert!(!episode.is_confidence_stagnant(None, 3));
    }

    #[test]
    fn test_close_sets_end_ts() {
        let mut episode = Episode::new("goal", "", Budget::default());
        episode.close(Outcome::Success, "done");
        assert!(episode.is_complete());
        assert!(episode.end_ts.is_some());
        assert!(episode.end_ts.unwrap() >= episode.start_ts);
    }
}
