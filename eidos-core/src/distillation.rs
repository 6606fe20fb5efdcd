use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{derive_id, now_micros, prefix};

/// Kinds of distilled knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationKind {
    /// "If X, then Y"
    Heuristic,
    /// Gotcha / pitfall to check
    SharpEdge,
    /// "Stop doing X because..."
    AntiPattern,
    /// Step-by-step procedure
    Playbook,
    /// Operating constraint
    Policy,
}

impl DistillationKind {
    /// Initial confidence cap: new rules must earn trust through usage.
    #[must_use]
    pub fn initial_confidence_cap(self) -> f32 {
        match self {
            DistillationKind::Heuristic => 0.4,
            DistillationKind::AntiPattern => 0.35,
            DistillationKind::SharpEdge => 0.35,
            DistillationKind::Playbook => 0.30,
            DistillationKind::Policy => 0.70,
        }
    }

    /// Retrieval priority: lower sorts first.
    #[must_use]
    pub fn retrieval_priority(self) -> u8 {
        match self {
            DistillationKind::Policy => 1,
            DistillationKind::Playbook => 2,
            DistillationKind::SharpEdge => 3,
            DistillationKind::Heuristic => 4,
            DistillationKind::AntiPattern => 5,
        }
    }

    /// Parse the snake_case wire value.
    #[must_use]
    pub fn parse(value: &str) -> Option<DistillationKind> {
        match value {
            "heuristic" => Some(DistillationKind::Heuristic),
            "sharp_edge" => Some(DistillationKind::SharpEdge),
            "anti_pattern" => Some(DistillationKind::AntiPattern),
            "playbook" => Some(DistillationKind::Playbook),
            "policy" => Some(DistillationKind::Policy),
            _ => None,
        }
    }
}

impl std::fmt::Display for DistillationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            DistillationKind::Heuristic => "heuristic",
            DistillationKind::SharpEdge => "sharp_edge",
            DistillationKind::AntiPattern => "anti_pattern",
            DistillationKind::Playbook => "playbook",
            DistillationKind::Policy => "policy",
        };
        write!(f, "{value}")
    }
}

/// Advisory-quality verdict attached by the external delivery layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryQuality {
    /// Unified quality score assigned by the advisory pipeline
    pub unified_score: Option<f32>,
    /// Whether delivery of this rule is suppressed
    pub suppressed: bool,
    /// Tag explaining the suppression
    pub suppressed_tag: String,
}

/// A reusable rule extracted from experience.
///
/// Confidence rises on helpful use (cap 1.0) and falls on unhelpful use
/// (floor 0.1); rules contradicted in ≥80% of ten or more uses decay faster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distillation {
    /// Opaque 12-hex id derived from kind + statement prefix + time
    pub distillation_id: String,
    pub kind: DistillationKind,
    /// Canonical rule text
    pub statement: String,
    /// Human-refined replacement for the statement, if any
    pub refined_statement: String,

    /// Where this applies
    pub domains: Vec<String>,
    /// When to retrieve this
    pub triggers: Vec<String>,
    /// When NOT to apply
    pub anti_triggers: Vec<String>,

    /// Step ids that generated this rule
    pub source_steps: Vec<String>,
    pub validation_count: u32,
    pub contradiction_count: u32,
    /// Belief in [0, 1]
    pub confidence: f32,

    pub times_retrieved: u32,
    /// Actually influenced a decision
    pub times_used: u32,
    /// Led to success
    pub times_helped: u32,

    pub created_at: DateTime<Utc>,
    /// When this rule should be re-checked against fresh evidence
    pub revalidate_by: Option<DateTime<Utc>>,
    pub advisory_quality: AdvisoryQuality,
}

impl Distillation {
    /// Create a new distillation; confidence is clamped to the kind's cap.
    pub fn new(kind: DistillationKind, statement: impl Into<String>, confidence: f32) -> Self {
        let statement = statement.into();
        let created_at = now_micros();
        let distillation_id = derive_id(&format!(
            "{}:{}:{}",
            kind,
            prefix(&statement, 50),
            created_at.timestamp_micros()
        ));
        Self {
            distillation_id,
            kind,
            statement,
            refined_statement: String::new(),
            domains: Vec::new(),
            triggers: Vec::new(),
            anti_triggers: Vec::new(),
            source_steps: Vec::new(),
            validation_count: 0,
            contradiction_count: 0,
            confidence: confidence.clamp(0.0, kind.initial_confidence_cap()),
            times_retrieved: 0,
            times_used: 0,
            times_helped: 0,
            created_at,
            revalidate_by: None,
            advisory_quality: AdvisoryQuality::default(),
        }
    }

    /// How effective this rule is when used: helped / used.
    #[must_use]
    pub fn effectiveness(&self) -> f32 {
        self.times_helped as f32 / self.times_used.max(1) as f32
    }

    /// How reliable this rule is: validations / (validations + contradictions).
    #[must_use]
    pub fn reliability(&self) -> f32 {
        let total = self.validation_count + self.contradiction_count;
        if total == 0 {
            return self.confidence;
        }
        self.validation_count as f32 / total as f32
    }

    /// Record that this rule was surfaced by retrieval.
    pub fn record_retrieval(&mut self) {
        self.times_retrieved += 1;
    }

    /// Record usage feedback, moving confidence up (+0.05) or down (−0.1),
    /// with an extra −0.15 decay once the rule is contradicted in ≥80% of
    /// ten or more uses.
    pub fn record_usage(&mut self, helped: bool) {
        self.times_used += 1;
        if helped {
            self.times_helped += 1;
            self.validation_count += 1;
            self.confidence = (self.confidence + 0.05).min(1.0);
        } else {
            self.contradiction_count += 1;
            self.confidence = (self.confidence - 0.1).max(0.1);
        }
        if self.times_used >= 10
            && self.contradiction_count as f32 / self.times_used as f32 >= 0.8
        {
            self.confidence = (self.confidence - 0.15).max(0.1);
        }
    }

    /// Statement key used for deduplication on save.
    #[must_use]
    pub fn normalized_key(&self) -> String {
        normalize_statement(&self.statement)
    }
}

/// Normalize a statement for deduplication: lowercase, strip punctuation,
/// collapse whitespace, and replace digit runs followed by `%` with a
/// wildcard so "82% used" and "91% used" collapse to the same rule.
#[must_use]
pub fn normalize_statement(statement: &str) -> String {
    let mut normalized = String::with_capacity(statement.len());
    let mut chars = statement.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            // Consume the whole digit run, then check for '%'
            while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
                chars.next();
            }
            if matches!(chars.peek(), Some('%')) {
                chars.next();
                normalized.push_str("n%");
            } else {
                normalized.push('0');
            }
        } else if c.is_alphanumeric() || c == '%' {
            for lower in c.to_lowercase() {
                normalized.push(lower);
            }
        } else if c.is_whitespace() {
            normalized.push(' ');
        }
        // Other punctuation is dropped
    }
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scope of a policy constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyScope {
    Global,
    Project,
    Session,
}

impl std::fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            PolicyScope::Global => "GLOBAL",
            PolicyScope::Project => "PROJECT",
            PolicyScope::Session => "SESSION",
        };
        write!(f, "{value}")
    }
}

impl PolicyScope {
    /// Parse the uppercase wire value, falling back to `Global`.
    #[must_use]
    pub fn parse(value: &str) -> PolicyScope {
        match value {
            "PROJECT" => PolicyScope::Project,
            "SESSION" => PolicyScope::Session,
            _ => PolicyScope::Global,
        }
    }
}

/// Where a policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicySource {
    /// Explicitly stated by the user
    User,
    /// Extracted from experience
    Distilled,
    /// Detected from patterns
    Inferred,
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            PolicySource::User => "USER",
            PolicySource::Distilled => "DISTILLED",
            PolicySource::Inferred => "INFERRED",
        };
        write!(f, "{value}")
    }
}

impl PolicySource {
    /// Parse the uppercase wire value, falling back to `Inferred`.
    #[must_use]
    pub fn parse(value: &str) -> PolicySource {
        match value {
            "USER" => PolicySource::User,
            "DISTILLED" => PolicySource::Distilled,
            _ => PolicySource::Inferred,
        }
    }
}

/// An operating constraint the agent must respect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Opaque 12-hex id derived from scope + statement prefix + time
    pub policy_id: String,
    pub statement: String,
    pub scope: PolicyScope,
    /// 0-100; higher binds harder
    pub priority: u8,
    pub source: PolicySource,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    /// Create a policy. User-sourced policies with "always"/"never" wording
    /// default to priority 60.
    pub fn new(statement: impl Into<String>, scope: PolicyScope, source: PolicySource) -> Self {
        let statement = statement.into();
        let created_at = now_micros();
        let lower = statement.to_lowercase();
        let priority = if source == PolicySource::User
            && (lower.contains("always") || lower.contains("never"))
        {
            60
        } else {
            50
        };
        let policy_id = derive_id(&format!(
            "{}:{}:{}",
            scope,
            prefix(&statement, 50),
            created_at.timestamp_micros()
        ));
        Self {
            policy_id,
            statement,
            scope,
            priority: priority.min(100),
            source,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_confidence_capped_per_kind() {
        let h = Distillation::new(DistillationKind::Heuristic, "When X stalls, try Y", 0.9);
        assert!((h.confidence - 0.4).abs() < f32::EPSILON);

        let p = Distillation::new(DistillationKind::Playbook, "Playbook for task", 0.9);
        assert!((p.confidence - 0.30).abs() < f32::EPSILON);

        let pol = Distillation::new(DistillationKind::Policy, "Never push to main", 0.9);
        assert!((pol.confidence - 0.70).abs() < f32::EPSILON);
    }

    #[test]
    fn test_usage_feedback_moves_confidence() {
        let mut d = Distillation::new(DistillationKind::Heuristic, "rule text here", 0.3);
        d.record_usage(true);
        assert!((d.confidence - 0.35).abs() < 1e-6);
        assert_eq!(d.validation_count, 1);
        assert_eq!(d.times_helped, 1);

        d.record_usage(false);
        assert!((d.confidence - 0.25).abs() < 1e-6);
        assert_eq!(d.contradiction_count, 1);
    }

    #[test]
    fn test_high_contradiction_rules_decay_faster() {
        let mut d = Distillation::new(DistillationKind::Heuristic, "bad rule text", 0.4);
        d.confidence = 1.0;
        for _ in 0..10 {
            d.record_usage(false);
        }
        assert_eq!(d.times_used, 10);
        assert!(d.confidence <= 0.5, "confidence {} too high", d.confidence);
    }

    #[test]
    fn test_confidence_monotone_until_cap() {
        let mut d = Distillation::new(DistillationKind::Policy, "always run tests", 0.7);
        d.confidence = 1.0;
        d.record_usage(true);
        assert!((d.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_effectiveness_and_reliability() {
        let mut d = Distillation::new(DistillationKind::Heuristic, "some rule text", 0.3);
        assert!((d.effectiveness() - 0.0).abs() < f32::EPSILON);
        d.record_usage(true);
        d.record_usage(false);
        assert!((d.effectiveness() - 0.5).abs() < f32::EPSILON);
        assert!((d.reliability() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_normalize_collapses_percent_variants() {
        let a = normalize_statement("When budget is 82% used without progress, simplify scope");
        let b = normalize_statement("When budget is 91% used without progress, simplify scope");
        assert_eq!(a, b);
        assert!(a.contains("n%"));
    }

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(
            normalize_statement("Stop: 'find' commands!"),
            normalize_statement("stop find commands")
        );
    }

    #[test]
    fn test_user_policy_priority_defaults() {
        let p = Policy::new("Never force-push to main", PolicyScope::Global, PolicySource::User);
        assert_eq!(p.priority, 60);

        let p = Policy::new("Prefer small diffs", PolicyScope::Global, PolicySource::User);
        assert_eq!(p.priority, 50);

        let p = Policy::new(
            "Never force-push to main",
            PolicyScope::Global,
            PolicySource::Inferred,
        );
        assert_eq!(p.priority, 50);
    }
}
