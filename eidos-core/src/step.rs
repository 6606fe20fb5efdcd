use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::episode::Episode;
use crate::ids::{derive_id, now_micros, prefix};

/// Step evaluation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evaluation {
    Pass,
    Fail,
    Partial,
    Unknown,
}

impl std::fmt::Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Evaluation::Pass => "pass",
            Evaluation::Fail => "fail",
            Evaluation::Partial => "partial",
            Evaluation::Unknown => "unknown",
        };
        write!(f, "{value}")
    }
}

impl Evaluation {
    /// Parse the snake_case wire value, falling back to `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Evaluation {
        match value {
            "pass" => Evaluation::Pass,
            "fail" => Evaluation::Fail,
            "partial" => Evaluation::Partial,
            _ => Evaluation::Unknown,
        }
    }
}

/// Kinds of actions a step can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ToolCall,
    Reasoning,
    Question,
    Wait,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ActionKind::ToolCall => "tool_call",
            ActionKind::Reasoning => "reasoning",
            ActionKind::Question => "question",
            ActionKind::Wait => "wait",
        };
        write!(f, "{value}")
    }
}

impl ActionKind {
    /// Parse the snake_case wire value, falling back to `Reasoning`.
    #[must_use]
    pub fn parse(value: &str) -> ActionKind {
        match value {
            "tool_call" => ActionKind::ToolCall,
            "question" => ActionKind::Question,
            "wait" => ActionKind::Wait,
            _ => ActionKind::Reasoning,
        }
    }
}

/// Budget state captured at step start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub steps_used: u32,
    pub max_steps: u32,
    pub elapsed_seconds: u64,
    pub max_time_seconds: u64,
}

impl BudgetSnapshot {
    /// Snapshot an episode's budget state.
    #[must_use]
    pub fn of(episode: &Episode) -> Self {
        let elapsed = (Utc::now() - episode.start_ts).num_seconds().max(0) as u64;
        Self {
            steps_used: episode.step_count,
            max_steps: episode.budget.max_steps,
            elapsed_seconds: elapsed,
            max_time_seconds: episode.budget.max_time_seconds,
        }
    }
}

/// The atomic intelligence unit: a decision packet (step envelope).
///
/// The envelope is a non-negotiable contract. Before the action the step must
/// carry intent, decision, prediction, and memory binding; after the action
/// it must carry result, evaluation, and validation. A step whose envelope is
/// incomplete persists with `is_valid = false` and cannot produce
/// distillations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Opaque 12-hex id derived from episode + intent + time
    pub step_id: String,
    /// Owning episode
    pub episode_id: String,
    /// Ties pre- and post-action records of the same logical operation
    pub trace_id: Option<String>,

    // Before action
    /// What is being attempted
    pub intent: String,
    /// What was chosen
    pub decision: String,
    /// Falsifiable claim being tested
    pub hypothesis: String,
    /// What was considered but not done
    pub alternatives: Vec<String>,
    /// What must be true for this to work
    pub assumptions: Vec<String>,
    /// Expected result
    pub prediction: String,
    /// When to abort and change approach
    pub stop_condition: String,
    /// Confidence in [0, 1] before acting
    pub confidence_before: f32,
    /// Budget state at step start
    pub budget_snapshot: BudgetSnapshot,

    // The action
    pub action_kind: ActionKind,
    /// Minimal provenance: tool, file_path, command, ...
    pub action_details: HashMap<String, String>,

    // After action
    /// What actually happened
    pub result: String,
    /// Concrete evidence: test output, metric, file hash
    pub validation_evidence: String,
    pub evaluation: Evaluation,
    /// Distance between prediction and result, in [0, 1]
    pub surprise_level: f32,
    /// What was learned
    pub lesson: String,
    /// Confidence in [0, 1] after the outcome is known
    pub confidence_after: f32,
    pub confidence_delta: f32,

    // Memory binding
    /// Distillation ids retrieved for this step
    pub retrieved_memories: Vec<String>,
    /// Did retrieved memory actually influence the decision?
    pub memory_cited: bool,
    /// Was the cited memory helpful?
    pub memory_useful: Option<bool>,
    /// Explicitly declared "no relevant memory found"
    pub memory_absent_declared: bool,

    // Validation
    pub validated: bool,
    pub validation_method: String,
    /// False when required envelope fields are missing
    pub is_valid: bool,

    // Progress tracking
    pub evidence_gathered: bool,
    pub progress_made: bool,

    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Create a new step bound to an episode.
    pub fn new(episode_id: impl Into<String>, intent: impl Into<String>) -> Self {
        let episode_id = episode_id.into();
        let intent = intent.into();
        let created_at = now_micros();
        let step_id = derive_id(&format!(
            "{}:{}:{}",
            episode_id,
            prefix(&intent, 30),
            created_at.timestamp_micros()
        ));
        Self {
            step_id,
            episode_id,
            trace_id: None,
            intent,
            decision: String::new(),
            hypothesis: String::new(),
            alternatives: Vec::new(),
            assumptions: Vec::new(),
            prediction: String::new(),
            stop_condition: String::new(),
            confidence_before: 0.5,
            budget_snapshot: BudgetSnapshot::default(),
            action_kind: ActionKind::Reasoning,
            action_details: HashMap::new(),
            result: String::new(),
            validation_evidence: String::new(),
            evaluation: Evaluation::Unknown,
            surprise_level: 0.0,
            lesson: String::new(),
            confidence_after: 0.5,
            confidence_delta: 0.0,
            retrieved_memories: Vec::new(),
            memory_cited: false,
            memory_useful: None,
            memory_absent_declared: false,
            validated: false,
            validation_method: String::new(),
            is_valid: true,
            evidence_gathered: false,
            progress_made: false,
            created_at,
        }
    }

    /// Known action-detail key: tool name.
    #[must_use]
    pub fn tool(&self) -> &str {
        self.action_details.get("tool").map_or("", String::as_str)
    }

    /// Known action-detail key: file path.
    #[must_use]
    pub fn file_path(&self) -> &str {
        self.action_details
            .get("file_path")
            .map_or("", String::as_str)
    }

    /// Known action-detail key: shell command.
    #[must_use]
    pub fn command(&self) -> &str {
        self.action_details
            .get("command")
            .map_or("", String::as_str)
    }

    /// Check the before-action envelope; returns the missing field names.
    #[must_use]
    pub fn missing_before_action(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.intent.is_empty() {
            missing.push("intent");
        }
        if self.decision.is_empty() {
            missing.push("decision");
        }
        if self.prediction.is_empty() {
            missing.push("prediction");
        }
        missing
    }

    /// Check the after-action envelope; returns the missing field names.
    #[must_use]
    pub fn missing_after_action(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.result.is_empty() {
            missing.push("result");
        }
        if self.evaluation == Evaluation::Unknown {
            missing.push("evaluation");
        }
        if !self.validated && self.validation_method.is_empty() {
            missing.push("validation");
        }
        missing
    }

    /// Whether both halves of the envelope validate; only such steps are
    /// distillation-eligible.
    #[must_use]
    pub fn is_envelope_complete(&self) -> bool {
        self.missing_before_action().is_empty() && self.missing_after_action().is_empty()
    }

    /// How surprising the result was versus the prediction, in [0, 1].
    ///
    /// Failure is usually surprising; otherwise the distance is one minus the
    /// Jaccard overlap of prediction and result words.
    #[must_use]
    pub fn calculate_surprise(&self) -> f32 {
        if self.prediction.is_empty() || self.result.is_empty() {
            return 0.0;
        }
        match self.evaluation {
            Evaluation::Fail => return 0.8,
            Evaluation::Partial => return 0.5,
            _ => {}
        }

        let pred_words: HashSet<String> = self
            .prediction
            .to_lowercase()
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        let result_words: HashSet<String> = self
            .result
            .to_lowercase()
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        if pred_words.is_empty() || result_words.is_empty() {
            return 0.0;
        }
        let intersection = pred_words.intersection(&result_words).count() as f32;
        let union = pred_words.union(&result_words).count() as f32;
        1.0 - intersection / union
    }
}
