//! The memory gate decides what earns persistence.
//!
//! Memory quality usually fails because everything gets stored. The gate
//! scores each step or distillation on impact, novelty, surprise, evidence,
//! stakes, and lesson quality; only items at or above the threshold become
//! durable memory, everything else stays short-lived cache.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

use crate::distillation::Distillation;
use crate::step::Step;

/// Keywords indicating high-stakes, hard-to-reverse actions. Irreversibility
/// deliberately dominates the weight table.
const HIGH_STAKES_KEYWORDS: &[&str] = &[
    "deploy",
    "production",
    "delete",
    "remove",
    "drop",
    "security",
    "auth",
    "authentication",
    "payment",
    "billing",
    "secret",
    "credential",
    "password",
    "key",
    "token",
    "database",
    "migration",
    "rollback",
    "backup",
];

/// Scoring weights for the gate components.
#[derive(Debug, Clone, PartialEq)]
pub struct GateWeights {
    /// Did it unblock progress?
    pub impact: f32,
    /// Is this a new pattern?
    pub novelty: f32,
    /// Was the outcome unexpected?
    pub surprise: f32,
    /// Multiple occurrences?
    pub recurrence: f32,
    /// High stakes? Dominant on purpose.
    pub irreversible: f32,
    /// Has validation?
    pub evidence: f32,
}

impl Default for GateWeights {
    fn default() -> Self {
        Self {
            impact: 0.30,
            novelty: 0.20,
            surprise: 0.30,
            recurrence: 0.20,
            irreversible: 0.60,
            evidence: 0.10,
        }
    }
}

/// Result of memory-gate scoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateScore {
    pub score: f32,
    pub passes: bool,
    pub reasons: Vec<String>,
    pub breakdown: HashMap<String, f32>,
}

/// Running statistics for one gate instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GateStats {
    pub total_evaluated: u64,
    pub passed: u64,
    pub rejected: u64,
    pub avg_score: f32,
}

/// Context hints for scoring raw insight text without full step structure.
#[derive(Debug, Clone, Default)]
pub struct RawInsightContext {
    pub has_outcome: bool,
    pub occurrence_count: u32,
}

/// Quality-control layer in front of durable memory.
pub struct MemoryGate {
    threshold: f32,
    weights: GateWeights,
    seen_patterns: RwLock<HashSet<String>>,
    stats: Mutex<GateStats>,
}

impl Default for MemoryGate {
    fn default() -> Self {
        Self::new(0.5, GateWeights::default())
    }
}

impl MemoryGate {
    /// Create a gate with a pass threshold and weights.
    #[must_use]
    pub fn new(threshold: f32, weights: GateWeights) -> Self {
        Self {
            threshold,
            weights,
            seen_patterns: RwLock::new(HashSet::new()),
            stats: Mutex::new(GateStats::default()),
        }
    }

    /// Score a step for persistence worthiness.
    pub fn score_step(&self, step: &Step) -> GateScore {
        let mut score = 0.0;
        let mut reasons = Vec::new();
        let mut breakdown = HashMap::new();

        // Impact
        let impact = if step.progress_made {
            self.weights.impact
        } else if step.evidence_gathered {
            self.weights.impact * 0.5
        } else {
            0.0
        };
        score += impact;
        breakdown.insert("impact".to_string(), impact);
        if impact > 0.0 {
            reasons.push(format!("impact:{impact:.2}"));
        }

        // Novelty
        let novelty = self.score_novelty(&format!("{}:{}", step.intent, step.decision));
        score += novelty;
        breakdown.insert("novelty".to_string(), novelty);
        if novelty > 0.0 {
            reasons.push("novelty:new_pattern".to_string());
        }

        // Surprise
        let surprise = if step.surprise_level >= 0.5 {
            self.weights.surprise
        } else if step.surprise_level >= 0.3 {
            self.weights.surprise * 0.5
        } else {
            0.0
        };
        score += surprise;
        breakdown.insert("surprise".to_string(), surprise);
        if surprise > 0.0 {
            reasons.push(format!("surprise:{:.2}", step.surprise_level));
        }

        // Evidence
        let evidence = if step.validated && !step.validation_evidence.is_empty() {
            self.weights.evidence
        } else if step.validated {
            self.weights.evidence * 0.5
        } else {
            0.0
        };
        score += evidence;
        breakdown.insert("evidence".to_string(), evidence);
        if evidence > 0.0 {
            reasons.push("validated".to_string());
        }

        // Irreversibility
        let stakes = self.score_stakes(&format!("{} {}", step.intent, step.decision));
        score += stakes;
        breakdown.insert("irreversible".to_string(), stakes);
        if stakes > 0.0 {
            reasons.push("high_stakes".to_string());
        }

        // Lesson quality
        let lesson = if step.lesson.len() > 50 {
            0.15
        } else if step.lesson.len() > 20 {
            0.10
        } else {
            0.0
        };
        score += lesson;
        breakdown.insert("lesson".to_string(), lesson);
        if lesson > 0.0 {
            reasons.push("has_lesson".to_string());
        }

        self.finish(score, reasons, breakdown)
    }

    /// Score a distillation for persistence worthiness.
    pub fn score_distillation(
        &self,
        distillation: &Distillation,
        source_steps: Option<&[Step]>,
    ) -> GateScore {
        let mut score = 0.0;
        let mut reasons = Vec::new();
        let mut breakdown = HashMap::new();

        if distillation.source_steps.len() >= 3 {
            score += 0.3;
            breakdown.insert("evidence".to_string(), 0.3);
            reasons.push(format!("evidence:{}_steps", distillation.source_steps.len()));
        }

        if distillation.confidence > 0.7 {
            let bonus = self.weights.impact * (distillation.confidence - 0.5);
            score += bonus;
            breakdown.insert("confidence".to_string(), bonus);
            reasons.push(format!("confidence:{:.2}", distillation.confidence));
        }

        if !distillation.triggers.is_empty() {
            score += 0.2;
            breakdown.insert("actionable".to_string(), 0.2);
            reasons.push("actionable".to_string());
        }

        let len = distillation.statement.len();
        if (30..=500).contains(&len) {
            score += 0.1;
            breakdown.insert("specific".to_string(), 0.1);
            reasons.push("specific".to_string());
        }

        let stakes = self.score_stakes(&distillation.statement);
        score += stakes;
        breakdown.insert("irreversible".to_string(), stakes);
        if stakes > 0.0 {
            reasons.push("high_stakes".to_string());
        }

        let novelty = self.score_novelty(&distillation.statement);
        score += novelty;
        breakdown.insert("novelty".to_string(), novelty);
        if novelty > 0.0 {
            reasons.push("novel".to_string());
        }

        if let Some(steps) = source_steps {
            let progressed = steps.iter().filter(|s| s.progress_made).count();
            if !steps.is_empty() && progressed * 2 > steps.len() {
                score += 0.15;
                breakdown.insert("step_impact".to_string(), 0.15);
                reasons.push("steps_made_progress".to_string());
            }
        }

        self.finish(score, reasons, breakdown)
    }

    /// Score raw insight text that lacks full step structure.
    pub fn score_raw_insight(&self, text: &str, context: &RawInsightContext) -> GateScore {
        if text.len() < 10 {
            return GateScore {
                score: 0.0,
                passes: false,
                reasons: vec!["too_short".to_string()],
                breakdown: HashMap::new(),
            };
        }

        let mut score = 0.0;
        let mut reasons = Vec::new();
        let mut breakdown = HashMap::new();

        let novelty = self.score_novelty(text);
        score += novelty;
        breakdown.insert("novelty".to_string(), novelty);
        if novelty > 0.0 {
            reasons.push("novel".to_string());
        }

        let stakes = self.score_stakes(text);
        score += stakes;
        breakdown.insert("irreversible".to_string(), stakes);
        if stakes > 0.0 {
            reasons.push("high_stakes".to_string());
        }

        if text.len() > 30 && text.len() < 500 {
            score += 0.15;
            breakdown.insert("specific".to_string(), 0.15);
            reasons.push("specific".to_string());
        }

        if context.has_outcome {
            score += 0.2;
            breakdown.insert("has_outcome".to_string(), 0.2);
            reasons.push("outcome_linked".to_string());
        }

        if context.occurrence_count >= 3 {
            score += self.weights.recurrence;
            breakdown.insert("recurrence".to_string(), self.weights.recurrence);
            reasons.push(format!("recurrence:{}", context.occurrence_count));
        }

        self.finish(score, reasons, breakdown)
    }

    /// Keep only the steps that pass the gate.
    pub fn filter_steps(&self, steps: &[Step]) -> Vec<Step> {
        steps
            .iter()
            .filter(|step| self.score_step(step).passes)
            .cloned()
            .collect()
    }

    /// Keep only the distillations that pass the gate.
    pub fn filter_distillations(&self, distillations: &[Distillation]) -> Vec<Distillation> {
        distillations
            .iter()
            .filter(|d| self.score_distillation(d, None).passes)
            .cloned()
            .collect()
    }

    /// Gate statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> GateStats {
        *self.stats.lock()
    }

    /// Forget seen patterns (new session or test isolation).
    pub fn reset_seen_patterns(&self) {
        self.seen_patterns.write().clear();
    }

    fn finish(
        &self,
        score: f32,
        reasons: Vec<String>,
        breakdown: HashMap<String, f32>,
    ) -> GateScore {
        let passes = score >= self.threshold;
        let mut stats = self.stats.lock();
        stats.total_evaluated += 1;
        if passes {
            stats.passed += 1;
        } else {
            stats.rejected += 1;
        }
        let n = stats.total_evaluated as f32;
        stats.avg_score = (stats.avg_score * (n - 1.0) + score) / n;
        drop(stats);

        GateScore {
            score,
            passes,
            reasons,
            breakdown,
        }
    }

    fn score_novelty(&self, text: &str) -> f32 {
        let key = normalize_for_dedup(text);
        if key.is_empty() {
            return 0.0;
        }
        {
            let seen = self.seen_patterns.read();
            if seen.contains(&key) {
                return 0.0;
            }
        }
        self.seen_patterns.write().insert(key);
        self.weights.novelty
    }

    fn score_stakes(&self, text: &str) -> f32 {
        let lower = text.to_lowercase();
        let matches = HIGH_STAKES_KEYWORDS
            .iter()
            .filter(|kw| lower.contains(**kw))
            .count();
        match matches {
            0 => 0.0,
            1 => self.weights.irreversible * 0.5,
            _ => self.weights.irreversible,
        }
    }
}

/// Numeric importance of a step, from the default gate weights.
#[must_use]
pub fn score_step_importance(gate: &MemoryGate, step: &Step) -> f32 {
    gate.score_step(step).score
}

/// Lowercase, collapse whitespace, drop non-alphanumerics, and truncate to a
/// 100-char dedup key.
fn normalize_for_dedup(text: &str) -> String {
    let mut normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distillation::DistillationKind;
    use crate::step::Evaluation;

    fn progressing_step(intent: &str) -> Step {
        let mut step = Step::new("ep0123456789", intent);
        step.decision = format!("do {intent}");
        step.prediction = "works".to_string();
        step.evaluation = Evaluation::Pass;
        step.progress_made = true;
        step.validated = true;
        step.validation_evidence = "test output".to_string();
        step
    }

    #[test]
    fn test_high_stakes_step_passes() {
        let gate = MemoryGate::default();
        let mut step = progressing_step("deploy to production");
        step.surprise_level = 0.6;
        let score = gate.score_step(&step);
        assert!(score.passes, "score {} should pass", score.score);
        assert!(score.reasons.iter().any(|r| r == "high_stakes"));
    }

    #[test]
    fn test_routine_step_rejected() {
        let gate = MemoryGate::default();
        let mut step = Step::new("ep0123456789", "list files");
        step.decision = "ls".to_string();
        // First evaluation earns novelty only
        gate.score_step(&step);
        let score = gate.score_step(&step);
        assert!(!score.passes);
    }

    #[test]
    fn test_novelty_only_counts_once() {
        let gate = MemoryGate::default();
        let step = progressing_step("same intent");
        let first = gate.score_step(&step);
        let second = gate.score_step(&step);
        assert!(first.score > second.score);
        assert!((first.score - second.score - 0.20).abs() < 1e-6);
    }

    #[test]
    fn test_distillation_scoring_components() {
        let gate = MemoryGate::default();
        let mut d = Distillation::new(
            DistillationKind::SharpEdge,
            "Check token expiry before touching the auth database migration",
            0.3,
        );
        d.source_steps = vec!["a".into(), "b".into(), "c".into()];
        d.triggers = vec!["auth".into()];
        let score = gate.score_distillation(&d, None);
        assert!(score.passes);
        assert!(score.breakdown["evidence"] > 0.0);
        assert!(score.breakdown["actionable"] > 0.0);
        assert!(score.breakdown["irreversible"] > 0.0);
    }

    #[test]
    fn test_raw_insight_too_short() {
        let gate = MemoryGate::default();
        let score = gate.score_raw_insight("short", &RawInsightContext::default());
        assert!(!score.passes);
        assert_eq!(score.reasons, vec!["too_short".to_string()]);
    }

    #[test]
    fn test_raw_insight_recurrence() {
        let gate = MemoryGate::default();
        let context = RawInsightContext {
            has_outcome: true,
            occurrence_count: 3,
        };
        let score = gate.score_raw_insight(
            "retries on the deploy pipeline mask the real credential failure",
            &context,
        );
        assert!(score.passes);
        assert!(score.breakdown["recurrence"] > 0.0);
    }

    #[test]
    fn test_stats_track_pass_rate() {
        let gate = MemoryGate::default();
        let step = progressing_step("deploy auth database");
        gate.score_step(&step);
        let stats = gate.stats();
        assert_eq!(stats.total_evaluated, 1);
        assert!(stats.avg_score > 0.0);
    }

    #[test]
    fn test_score_step_importance_wraps_gate() {
        let gate = MemoryGate::default();
        let step = progressing_step("deploy production database");
        let expected = gate.score_step(&step).score;
        gate.reset_seen_patterns();
        let got = score_step_importance(&gate, &step);
        assert!((got - expected).abs() < f32::EPSILON);
    }
}
