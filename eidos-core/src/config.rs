//! Configuration snapshot for the core.
//!
//! The hot-reload machinery lives outside the core: an external coordinator
//! hands the core a JSON dict of tuneables, and `reload_from` applies the
//! sections it understands, clamping out-of-range values and ignoring
//! unknown keys. Episodes capture a [`Budget`] from the snapshot at creation
//! and honor it for their lifetime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::episode::Budget;

/// Report from a configuration reload: which keys were applied and what was
/// rejected or clamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
}

/// Auto-tuner section: bounds for recommendation application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTunerConfig {
    pub min_boost: f32,
    pub max_boost: f32,
    pub max_change_per_run: f32,
    pub run_interval_s: u64,
    pub source_boosts: HashMap<String, f32>,
    pub source_effectiveness: HashMap<String, f32>,
    pub tuning_log: Vec<String>,
}

impl Default for AutoTunerConfig {
    fn default() -> Self {
        Self {
            min_boost: 0.8,
            max_boost: 1.1,
            max_change_per_run: 0.15,
            run_interval_s: 86_400,
            source_boosts: HashMap::new(),
            source_effectiveness: HashMap::new(),
            tuning_log: Vec::new(),
        }
    }
}

/// Tuning-log entries kept in the snapshot.
pub const TUNING_LOG_CAP: usize = 50;

/// Advisor section: delivery-side ranking knobs the core carries through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorConfig {
    pub min_rank_score: f32,
    pub max_advice_items: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            min_rank_score: 0.0,
            max_advice_items: 3,
        }
    }
}

/// Request-tracker section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTrackerConfig {
    pub max_pending: u32,
    pub max_completed: u32,
    pub max_age_seconds: u64,
}

impl Default for RequestTrackerConfig {
    fn default() -> Self {
        Self {
            max_pending: 50,
            max_completed: 200,
            max_age_seconds: 3600,
        }
    }
}

/// Snapshot of the externally-managed tuneables the core reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EidosConfig {
    /// Per-episode budget defaults (the `eidos` section)
    pub budget: Budget,
    /// Whether a missing trace id blocks the action instead of warning
    pub trace_strict: bool,
    /// Master switch for the high-risk tool-use guard
    pub safety_guardrails: bool,
    /// Permit reads of likely-secret files despite the safety guard
    pub allow_secret_access: bool,
    /// Idle seconds before the staleness sweep force-closes an episode
    pub stale_after_seconds: u64,
    pub auto_tuner: AutoTunerConfig,
    pub advisor: AdvisorConfig,
    /// `meta_ralph` quality threshold, 0-10
    pub quality_threshold: u8,
    /// Promotion threshold for rule promotion
    pub promotion_threshold: f32,
    pub request_tracker: RequestTrackerConfig,
}

impl Default for EidosConfig {
    fn default() -> Self {
        Self {
            budget: Budget::default(),
            trace_strict: false,
            safety_guardrails: true,
            allow_secret_access: false,
            stale_after_seconds: 1800,
            auto_tuner: AutoTunerConfig::default(),
            advisor: AdvisorConfig::default(),
            quality_threshold: 6,
            promotion_threshold: 0.7,
            request_tracker: RequestTrackerConfig::default(),
        }
    }
}

impl EidosConfig {
    /// Apply a tuneables dict. Sections the core understands are `eidos`,
    /// `values` (shared budget overrides), `auto_tuner`, `advisor`,
    /// `meta_ralph`, `promotion`, and `request_tracker`. Missing sections
    /// keep their current values; out-of-range values are clamped with a
    /// warning; unknown sections are ignored. Idempotent for a fixed dict.
    pub fn reload_from(&mut self, dict: &serde_json::Value) -> ReloadReport {
        let mut report = ReloadReport::default();
        let Some(sections) = dict.as_object() else {
            report
                .warnings
                .push("tuneables root is not an object; nothing applied".to_string());
            return report;
        };

        // `values` provides shared fallbacks for budget keys the `eidos`
        // section does not set itself.
        let values = sections.get("values").and_then(|v| v.as_object());
        let eidos = sections.get("eidos").and_then(|v| v.as_object());

        let lookup = |key: &str, alias: Option<&str>| -> Option<serde_json::Value> {
            if let Some(section) = eidos {
                if let Some(v) = section.get(key) {
                    return Some(v.clone());
                }
            }
            if let Some(section) = values {
                if let Some(v) = section.get(key) {
                    return Some(v.clone());
                }
                if let Some(alias) = alias {
                    if let Some(v) = section.get(alias) {
                        return Some(v.clone());
                    }
                }
            }
            None
        };

        if let Some(v) = lookup("max_steps", None) {
            if let Some(n) = apply_u64(&v, "eidos.max_steps", 1, 10_000, &mut report) {
                self.budget.max_steps = n as u32;
            }
        }
        if let Some(v) = lookup("max_time_seconds", None) {
            if let Some(n) = apply_u64(&v, "eidos.max_time_seconds", 1, 86_400, &mut report) {
                self.budget.max_time_seconds = n;
            }
        }
        if let Some(v) = lookup("max_retries_per_error", None) {
            if let Some(n) = apply_u64(&v, "eidos.max_retries_per_error", 1, 100, &mut report) {
                self.budget.max_retries_per_error = n as u32;
            }
        }
        if let Some(v) = lookup("max_file_touches", None) {
            if let Some(n) = apply_u64(&v, "eidos.max_file_touches", 1, 100, &mut report) {
                self.budget.max_file_touches = n as u32;
            }
        }
        if let Some(v) = lookup("no_evidence_limit", Some("no_evidence_steps")) {
            if let Some(n) = apply_u64(&v, "eidos.no_evidence_limit", 1, 100, &mut report) {
                self.budget.no_evidence_limit = n as u32;
            }
        }
        if let Some(section) = eidos {
            if let Some(v) = section.get("trace_strict").and_then(serde_json::Value::as_bool) {
                self.trace_strict = v;
                report.applied.push("eidos.trace_strict".to_string());
            }
            if let Some(v) = section
                .get("safety_guardrails")
                .and_then(serde_json::Value::as_bool)
            {
                self.safety_guardrails = v;
                report.applied.push("eidos.safety_guardrails".to_string());
            }
            if let Some(v) = section
                .get("allow_secret_access")
                .and_then(serde_json::Value::as_bool)
            {
                self.allow_secret_access = v;
                report.applied.push("eidos.allow_secret_access".to_string());
            }
            if let Some(v) = section.get("stale_after_seconds") {
                if let Some(n) = apply_u64(v, "eidos.stale_after_seconds", 60, 86_400, &mut report)
                {
                    self.stale_after_seconds = n;
                }
            }
        }

        if let Some(section) = sections.get("auto_tuner").and_then(|v| v.as_object()) {
            if let Some(v) = section.get("min_boost") {
                if let Some(f) = apply_f32(v, "auto_tuner.min_boost", 0.5, 2.0, &mut report) {
                    self.auto_tuner.min_boost = f;
                }
            }
            if let Some(v) = section.get("max_boost") {
                if let Some(f) = apply_f32(v, "auto_tuner.max_boost", 0.5, 2.0, &mut report) {
                    self.auto_tuner.max_boost = f;
                }
            }
            if self.auto_tuner.max_boost < self.auto_tuner.min_boost {
                report.warnings.push(
                    "auto_tuner.max_boost < min_boost; swapping bounds".to_string(),
                );
                std::mem::swap(&mut self.auto_tuner.min_boost, &mut self.auto_tuner.max_boost);
            }
            if let Some(v) = section.get("max_change_per_run") {
                if let Some(f) =
                    apply_f32(v, "auto_tuner.max_change_per_run", 0.0, 1.0, &mut report)
                {
                    self.auto_tuner.max_change_per_run = f;
                }
            }
            if let Some(v) = section.get("run_interval_s") {
                if let Some(n) = apply_u64(v, "auto_tuner.run_interval_s", 60, 604_800, &mut report)
                {
                    self.auto_tuner.run_interval_s = n;
                }
            }
            if let Some(map) = section.get("source_boosts").and_then(|v| v.as_object()) {
                self.auto_tuner.source_boosts = map
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f as f32)))
                    .collect();
                report.applied.push("auto_tuner.source_boosts".to_string());
            }
            if let Some(map) = section.get("source_effectiveness").and_then(|v| v.as_object()) {
                self.auto_tuner.source_effectiveness = map
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f as f32)))
                    .collect();
                report
                    .applied
                    .push("auto_tuner.source_effectiveness".to_string());
            }
            if let Some(list) = section.get("tuning_log").and_then(|v| v.as_array()) {
                self.auto_tuner.tuning_log = list
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect();
                if self.auto_tuner.tuning_log.len() > TUNING_LOG_CAP {
                    let excess = self.auto_tuner.tuning_log.len() - TUNING_LOG_CAP;
                    self.auto_tuner.tuning_log.drain(..excess);
                }
                report.applied.push("auto_tuner.tuning_log".to_string());
            }
        }

        if let Some(section) = sections.get("advisor").and_then(|v| v.as_object()) {
            if let Some(v) = section.get("min_rank_score") {
                if let Some(f) = apply_f32(v, "advisor.min_rank_score", 0.0, 10.0, &mut report) {
                    self.advisor.min_rank_score = f;
                }
            }
            if let Some(v) = section.get("max_advice_items") {
                if let Some(n) = apply_u64(v, "advisor.max_advice_items", 0, 50, &mut report) {
                    self.advisor.max_advice_items = n as u32;
                }
            }
        }

        if let Some(section) = sections.get("meta_ralph").and_then(|v| v.as_object()) {
            if let Some(v) = section.get("quality_threshold") {
                if let Some(n) = apply_u64(v, "meta_ralph.quality_threshold", 0, 10, &mut report) {
                    self.quality_threshold = n as u8;
                }
            }
        }

        if let Some(section) = sections.get("promotion").and_then(|v| v.as_object()) {
            if let Some(v) = section.get("threshold") {
                if let Some(f) = apply_f32(v, "promotion.threshold", 0.0, 1.0, &mut report) {
                    self.promotion_threshold = f;
                }
            }
        }

        if let Some(section) = sections.get("request_tracker").and_then(|v| v.as_object()) {
            if let Some(v) = section.get("max_pending") {
                if let Some(n) = apply_u64(v, "request_tracker.max_pending", 1, 10_000, &mut report)
                {
                    self.request_tracker.max_pending = n as u32;
                }
            }
            if let Some(v) = section.get("max_completed") {
                if let Some(n) =
                    apply_u64(v, "request_tracker.max_completed", 1, 100_000, &mut report)
                {
                    self.request_tracker.max_completed = n as u32;
                }
            }
            if let Some(v) = section.get("max_age_seconds") {
                if let Some(n) =
                    apply_u64(v, "request_tracker.max_age_seconds", 1, 86_400, &mut report)
                {
                    self.request_tracker.max_age_seconds = n;
                }
            }
        }

        report
    }

    /// Budget snapshot for a new episode.
    #[must_use]
    pub fn budget(&self) -> Budget {
        self.budget.clone()
    }
}

fn apply_u64(
    value: &serde_json::Value,
    key: &str,
    min: u64,
    max: u64,
    report: &mut ReloadReport,
) -> Option<u64> {
    let raw = value.as_u64().or_else(|| {
        // Tolerate floats from hand-edited JSON
        value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)
    });
    match raw {
        Some(n) => {
            let clamped = n.clamp(min, max);
            if clamped != n {
                report
                    .warnings
                    .push(format!("{key}={n} clamped to {clamped}"));
            }
            report.applied.push(key.to_string());
            Some(clamped)
        }
        None => {
            report
                .warnings
                .push(format!("{key} is not a number; kept current value"));
            None
        }
    }
}

fn apply_f32(
    value: &serde_json::Value,
    key: &str,
    min: f32,
    max: f32,
    report: &mut ReloadReport,
) -> Option<f32> {
    match value.as_f64() {
        Some(f) => {
            let f = f as f32;
            let clamped = f.clamp(min, max);
            if (clamped - f).abs() > f32::EPSILON {
                report
                    .warnings
                    .push(format!("{key}={f} clamped to {clamped}"));
            }
            report.applied.push(key.to_string());
            Some(clamped)
        }
        None => {
            report
                .warnings
                .push(format!("{key} is not a number; kept current value"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = EidosConfig::default();
        assert_eq!(config.budget.max_steps, 25);
        assert_eq!(config.budget.max_time_seconds, 720);
        assert_eq!(config.budget.no_evidence_limit, 5);
        assert_eq!(config.stale_after_seconds, 1800);
        assert!(!config.trace_strict);
        assert!(config.safety_guardrails);
        assert!(!config.allow_secret_access);
    }

    #[test]
    fn test_reload_toggles_safety_guards() {
        let mut config = EidosConfig::default();
        config.reload_from(&json!({
            "eidos": {"safety_guardrails": false, "allow_secret_access": true}
        }));
        assert!(!config.safety_guardrails);
        assert!(config.allow_secret_access);
    }

    #[test]
    fn test_reload_applies_eidos_section() {
        let mut config = EidosConfig::default();
        let report = config.reload_from(&json!({
            "eidos": {"max_steps": 40, "trace_strict": true}
        }));
        assert_eq!(config.budget.max_steps, 40);
        assert!(config.trace_strict);
        assert!(report.applied.contains(&"eidos.max_steps".to_string()));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_values_section_fallback() {
        let mut config = EidosConfig::default();
        config.reload_from(&json!({
            "values": {"max_steps": 30, "no_evidence_steps": 7}
        }));
        assert_eq!(config.budget.max_steps, 30);
        assert_eq!(config.budget.no_evidence_limit, 7);

        // The eidos section wins over values
        config.reload_from(&json!({
            "eidos": {"max_steps": 20},
            "values": {"max_steps": 99}
        }));
        assert_eq!(config.budget.max_steps, 20);
    }

    #[test]
    fn test_out_of_range_values_are_clamped_with_warning() {
        let mut config = EidosConfig::default();
        let report = config.reload_from(&json!({
            "auto_tuner": {"min_boost": 0.1, "max_change_per_run": 5.0}
        }));
        assert!((config.auto_tuner.min_boost - 0.5).abs() < f32::EPSILON);
        assert!((config.auto_tuner.max_change_per_run - 1.0).abs() < f32::EPSILON);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let dict = json!({
            "eidos": {"max_steps": 12, "max_file_touches": 5},
            "advisor": {"max_advice_items": 7},
            "meta_ralph": {"quality_threshold": 8},
            "promotion": {"threshold": 0.9},
            "request_tracker": {"max_pending": 10}
        });
        let mut config = EidosConfig::default();
        config.reload_from(&dict);
        let snapshot = config.clone();
        config.reload_from(&dict);
        assert_eq!(config, snapshot);
    }

    #[test]
    fn test_unknown_sections_ignored() {
        let mut config = EidosConfig::default();
        let before = config.clone();
        config.reload_from(&json!({"observatory": {"theme": "dark"}}));
        assert_eq!(config, before);
    }

    #[test]
    fn test_non_object_root_warns() {
        let mut config = EidosConfig::default();
        let report = config.reload_from(&json!([1, 2, 3]));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.applied.is_empty());
    }
}
