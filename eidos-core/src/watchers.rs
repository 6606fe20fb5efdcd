//! Watchers: automatic rabbit-hole detection.
//!
//! A rabbit hole is not lack of intelligence, it is loss of progress signal.
//! Nine detectors run after every step against a snapshot supplied by the
//! caller; each classifies the current state and, when it fires, names the
//! phase the control plane must force and the output the next step owes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::phase::Phase;
use crate::step::Step;

/// Alert history entries kept in memory.
pub const ALERT_HISTORY_CAP: usize = 2000;

/// The nine watcher tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherTag {
    RepeatFailure,
    NoNewEvidence,
    DiffThrash,
    ConfidenceStagnation,
    MemoryBypass,
    BudgetHalfNoProgress,
    ScopeCreep,
    ValidationGap,
    TraceGap,
}

impl std::fmt::Display for WatcherTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            WatcherTag::RepeatFailure => "repeat_failure",
            WatcherTag::NoNewEvidence => "no_new_evidence",
            WatcherTag::DiffThrash => "diff_thrash",
            WatcherTag::ConfidenceStagnation => "confidence_stagnation",
            WatcherTag::MemoryBypass => "memory_bypass",
            WatcherTag::BudgetHalfNoProgress => "budget_half_no_progress",
            WatcherTag::ScopeCreep => "scope_creep",
            WatcherTag::ValidationGap => "validation_gap",
            WatcherTag::TraceGap => "trace_gap",
        };
        write!(f, "{value}")
    }
}

/// How hard an alert binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Surface only
    Warning,
    /// Refuse the action
    Block,
    /// Refuse the action and force a phase
    Force,
}

impl Severity {
    /// Whether this severity refuses the action.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Block | Severity::Force)
    }
}

/// One watcher firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherAlert {
    pub tag: WatcherTag,
    pub severity: Severity,
    pub message: String,
    /// Phase the control plane must force, when the watcher demands one
    pub forced_phase: Option<Phase>,
    /// What the next step must produce
    pub required_action: String,
    pub created_at: DateTime<Utc>,
}

impl WatcherAlert {
    fn new(
        tag: WatcherTag,
        severity: Severity,
        message: String,
        forced_phase: Option<Phase>,
        required_action: &str,
    ) -> Self {
        Self {
            tag,
            severity,
            message,
            forced_phase,
            required_action: required_action.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Runs the nine detectors and keeps a bounded alert history.
pub struct WatcherEngine {
    /// When true, a missing trace id blocks instead of warning
    trace_strict: bool,
    history: Mutex<Vec<WatcherAlert>>,
}

impl WatcherEngine {
    /// Create an engine; `trace_strict` hardens the trace-gap watcher.
    #[must_use]
    pub fn new(trace_strict: bool) -> Self {
        Self {
            trace_strict,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Evaluate all nine watchers against the current snapshot. Fired alerts
    /// are appended to the history (capped at [`ALERT_HISTORY_CAP`]).
    pub fn check_all(
        &self,
        episode: &Episode,
        step: &Step,
        recent_steps: &[Step],
        memories_exist: bool,
    ) -> Vec<WatcherAlert> {
        let mut alerts = Vec::new();

        if let Some(alert) = check_repeat_failure(episode) {
            alerts.push(alert);
        }
        if let Some(alert) = check_no_new_evidence(episode) {
            alerts.push(alert);
        }
        if let Some(alert) = check_diff_thrash(episode, step) {
            alerts.push(alert);
        }
        if let Some(alert) = check_confidence_stagnation(episode) {
            alerts.push(alert);
        }
        if let Some(alert) = check_memory_bypass(step, memories_exist) {
            alerts.push(alert);
        }
        if let Some(alert) = check_budget_half_no_progress(episode, recent_steps) {
            alerts.push(alert);
        }
        if let Some(alert) = check_scope_creep(recent_steps) {
            alerts.push(alert);
        }
        if let Some(alert) = check_validation_gap(recent_steps) {
            alerts.push(alert);
        }
        if let Some(alert) = check_trace_gap(step, recent_steps, self.trace_strict) {
            alerts.push(alert);
        }

        let mut history = self.history.lock();
        history.extend(alerts.iter().cloned());
        if history.len() > ALERT_HISTORY_CAP {
            let excess = history.len() - ALERT_HISTORY_CAP;
            history.drain(..excess);
        }

        alerts
    }

    /// How many times a tag has fired in this engine's history.
    #[must_use]
    pub fn count_watcher_triggers(&self, tag: WatcherTag) -> usize {
        self.history.lock().iter().filter(|a| a.tag == tag).count()
    }

    /// Total alerts retained.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Snapshot of the retained alerts.
    #[must_use]
    pub fn history(&self) -> Vec<WatcherAlert> {
        self.history.lock().clone()
    }
}

fn check_repeat_failure(episode: &Episode) -> Option<WatcherAlert> {
    let (signature, count) = episode
        .error_counts
        .iter()
        .max_by_key(|(_, &count)| count)?;
    if *count >= 2 {
        return Some(WatcherAlert::new(
            WatcherTag::RepeatFailure,
            Severity::Force,
            format!("Error '{signature}' has occurred {count} times"),
            Some(Phase::Diagnose),
            "produce a new hypothesis and a discriminating test",
        ));
    }
    None
}

fn check_no_new_evidence(episode: &Episode) -> Option<WatcherAlert> {
    if episode.is_no_evidence_limit_exceeded() {
        return Some(WatcherAlert::new(
            WatcherTag::NoNewEvidence,
            Severity::Force,
            format!(
                "{} consecutive steps without new evidence",
                episode.no_evidence_streak
            ),
            Some(Phase::Diagnose),
            "next step must be an evidence-gathering plan only",
        ));
    }
    None
}

fn check_diff_thrash(episode: &Episode, step: &Step) -> Option<WatcherAlert> {
    let file_path = step.file_path();
    if !file_path.is_empty() && episode.is_file_frozen(file_path) {
        return Some(WatcherAlert::new(
            WatcherTag::DiffThrash,
            Severity::Block,
            format!(
                "File '{file_path}' touched {} times; it is frozen",
                episode.file_touch_counts.get(file_path).copied().unwrap_or(0)
            ),
            Some(Phase::Simplify),
            "build a minimal reproduction before touching this file again",
        ));
    }
    None
}

fn check_confidence_stagnation(episode: &Episode) -> Option<WatcherAlert> {
    if episode.is_confidence_stagnant(None, 3) {
        return Some(WatcherAlert::new(
            WatcherTag::ConfidenceStagnation,
            Severity::Force,
            "Confidence has not moved across the last 3 steps".to_string(),
            Some(Phase::Plan),
            "produce 2 alternate hypotheses with tests",
        ));
    }
    None
}

fn check_memory_bypass(step: &Step, memories_exist: bool) -> Option<WatcherAlert> {
    if memories_exist && !step.memory_cited && !step.memory_absent_declared {
        return Some(WatcherAlert::new(
            WatcherTag::MemoryBypass,
            Severity::Block,
            "Relevant memory exists but was neither cited nor declared absent".to_string(),
            None,
            "retrieve memory and cite it, or declare none applies",
        ));
    }
    None
}

fn check_budget_half_no_progress(episode: &Episode, recent_steps: &[Step]) -> Option<WatcherAlert> {
    if episode.budget_percentage_used() <= 0.5 || recent_steps.len() < 5 {
        return None;
    }
    let window = &recent_steps[recent_steps.len() - 5..];
    if window.iter().any(|s| s.progress_made) {
        return None;
    }
    Some(WatcherAlert::new(
        WatcherTag::BudgetHalfNoProgress,
        Severity::Force,
        format!(
            "{:.0}% of step budget used with no progress in the last 5 steps",
            episode.budget_percentage_used() * 100.0
        ),
        Some(Phase::Simplify),
        "reduce scope before spending more budget",
    ))
}

fn check_scope_creep(recent_steps: &[Step]) -> Option<WatcherAlert> {
    if recent_steps.len() < 10 {
        return None;
    }
    let window = &recent_steps[recent_steps.len() - 10..];
    let (first, second) = window.split_at(5);

    let detail = |steps: &[Step]| -> usize {
        steps
            .iter()
            .map(|s| s.alternatives.len() + s.assumptions.len())
            .sum()
    };
    let progress = |steps: &[Step]| -> usize { steps.iter().filter(|s| s.progress_made).count() };

    let detail_first = detail(first);
    let detail_second = detail(second);
    if detail_first == 0 {
        return None;
    }
    if detail_second as f32 > detail_first as f32 * 1.5 && progress(second) <= progress(first) {
        return Some(WatcherAlert::new(
            WatcherTag::ScopeCreep,
            Severity::Force,
            format!(
                "Considered detail grew from {detail_first} to {detail_second} without progress"
            ),
            Some(Phase::Simplify),
            "cut scope by 50%",
        ));
    }
    None
}

fn check_validation_gap(recent_steps: &[Step]) -> Option<WatcherAlert> {
    if recent_steps.len() < 3 {
        return None;
    }
    let window = &recent_steps[recent_steps.len() - 3..];
    let unvalidated = window
        .iter()
        .filter(|s| !s.validated && s.validation_evidence.is_empty())
        .count();
    if unvalidated >= 2 {
        return Some(WatcherAlert::new(
            WatcherTag::ValidationGap,
            Severity::Force,
            format!("{unvalidated} of the last 3 steps carry no validation"),
            Some(Phase::Validate),
            "next step must be verification only",
        ));
    }
    None
}

fn check_trace_gap(step: &Step, recent_steps: &[Step], strict: bool) -> Option<WatcherAlert> {
    let tail = recent_steps.len().saturating_sub(5);
    let gap = step.trace_id.is_none()
        || recent_steps[tail..].iter().any(|s| s.trace_id.is_none());
    if gap {
        return Some(WatcherAlert::new(
            WatcherTag::TraceGap,
            if strict { Severity::Block } else { Severity::Warning },
            "Steps are missing a trace id".to_string(),
            None,
            "bind a trace_id to tie pre- and post-action records",
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::Budget;
    use crate::step::Evaluation;

    fn episode() -> Episode {
        Episode::new("Fix auth timeout", "tests pass", Budget::default())
    }

    fn traced_step(intent: &str) -> Step {
        let mut step = Step::new("ep0123456789", intent);
        step.trace_id = Some("trace-1".to_string());
        step
    }

    fn traced_steps(n: usize) -> Vec<Step> {
        (0..n).map(|i| traced_step(&format!("step {i}"))).collect()
    }

    #[test]
    fn test_repeat_failure_fires_at_two() {
        let engine = WatcherEngine::new(false);
        let mut ep = episode();
        ep.record_error("Bash:ImportError");
        let alerts = engine.check_all(&ep, &traced_step("retry"), &traced_steps(0), false);
        assert!(alerts.iter().all(|a| a.tag != WatcherTag::RepeatFailure));

        ep.record_error("Bash:ImportError");
        let alerts = engine.check_all(&ep, &traced_step("retry"), &traced_steps(0), false);
        let alert = alerts
            .iter()
            .find(|a| a.tag == WatcherTag::RepeatFailure)
            .unwrap();
        assert_eq!(alert.severity, Severity::Force);
        assert_eq!(alert.forced_phase, Some(Phase::Diagnose));
    }

    #[test]
    fn test_diff_thrash_fires_iff_file_frozen() {
        let engine = WatcherEngine::new(false);
        let mut ep = episode();
        let mut step = traced_step("edit auth");
        step.action_details
            .insert("file_path".to_string(), "src/auth.rs".to_string());

        ep.record_file_touch("src/auth.rs");
        ep.record_file_touch("src/auth.rs");
        let alerts = engine.check_all(&ep, &step, &traced_steps(0), false);
        assert!(alerts.iter().all(|a| a.tag != WatcherTag::DiffThrash));

        ep.record_file_touch("src/auth.rs");
        let alerts = engine.check_all(&ep, &step, &traced_steps(0), false);
        let alert = alerts
            .iter()
            .find(|a| a.tag == WatcherTag::DiffThrash)
            .unwrap();
        assert_eq!(alert.severity, Severity::Block);
        assert_eq!(alert.forced_phase, Some(Phase::Simplify));
    }

    #[test]
    fn test_memory_bypass_blocks() {
        let engine = WatcherEngine::new(false);
        let ep = episode();
        let step = traced_step("act");
        let alerts = engine.check_all(&ep, &step, &traced_steps(0), true);
        assert!(alerts.iter().any(|a| a.tag == WatcherTag::MemoryBypass));

        let mut cited = traced_step("act again");
        cited.memory_absent_declared = true;
        let alerts = engine.check_all(&ep, &cited, &traced_steps(0), true);
        assert!(alerts.iter().all(|a| a.tag != WatcherTag::MemoryBypass));
    }

    #[test]
    fn test_budget_half_no_progress() {
        let engine = WatcherEngine::new(false);
        let mut ep = episode();
        ep.step_count = 14; // > 50% of 25
        let steps = traced_steps(5);
        let alerts = engine.check_all(&ep, &traced_step("next"), &steps, false);
        assert!(alerts
            .iter()
            .any(|a| a.tag == WatcherTag::BudgetHalfNoProgress));

        let mut progressing = traced_steps(5);
        progressing[4].progress_made = true;
        let alerts = engine.check_all(&ep, &traced_step("next"), &progressing, false);
        assert!(alerts
            .iter()
            .all(|a| a.tag != WatcherTag::BudgetHalfNoProgress));
    }

    #[test]
    fn test_scope_creep() {
        let engine = WatcherEngine::new(false);
        let ep = episode();
        let mut steps = traced_steps(10);
        for step in &mut steps[..5] {
            step.alternatives = vec!["a".to_string()];
        }
        for step in &mut steps[5..] {
            step.alternatives = vec!["a".to_string(), "b".to_string()];
            step.assumptions = vec!["x".to_string()];
        }
        let alerts = engine.check_all(&ep, &traced_step("next"), &steps, false);
        let alert = alerts
            .iter()
            .find(|a| a.tag == WatcherTag::ScopeCreep)
            .unwrap();
        assert_eq!(alert.forced_phase, Some(Phase::Simplify));
    }

    #[test]
    fn test_validation_gap() {
        let engine = WatcherEngine::new(false);
        let ep = episode();
        let mut steps = traced_steps(3);
        steps[2].validated = true;
        let alerts = engine.check_all(&ep, &traced_step("next"), &steps, false);
        assert!(alerts.iter().any(|a| a.tag == WatcherTag::ValidationGap));

        for step in &mut steps {
            step.validated = true;
        }
        let alerts = engine.check_all(&ep, &traced_step("next"), &steps, false);
        assert!(alerts.iter().all(|a| a.tag != WatcherTag::ValidationGap));
    }

    #[test]
    fn test_trace_gap_severity_depends_on_strictness() {
        let ep = episode();
        let untraced = Step::new("ep0123456789", "act");

        let relaxed = WatcherEngine::new(false);
        let alerts = relaxed.check_all(&ep, &untraced, &traced_steps(0), false);
        let alert = alerts.iter().find(|a| a.tag == WatcherTag::TraceGap).unwrap();
        assert_eq!(alert.severity, Severity::Warning);
        assert!(!alert.severity.is_blocking());

        let strict = WatcherEngine::new(true);
        let alerts = strict.check_all(&ep, &untraced, &traced_steps(0), false);
        let alert = alerts.iter().find(|a| a.tag == WatcherTag::TraceGap).unwrap();
        assert_eq!(alert.severity, Severity::Block);
    }

    #[test]
    fn test_history_counts_and_cap() {
        let engine = WatcherEngine::new(false);
        let mut ep = episode();
        ep.record_error("Bash:boom");
        ep.record_error("Bash:boom");
        for _ in 0..3 {
            engine.check_all(&ep, &traced_step("retry"), &traced_steps(0), false);
        }
        assert_eq!(engine.count_watcher_triggers(WatcherTag::RepeatFailure), 3);
        assert!(engine.history_len() <= ALERT_HISTORY_CAP);
    }
}
