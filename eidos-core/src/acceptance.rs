//! Acceptance compiler: the definition of done.
//!
//! Converts goal + constraints + success criteria into explicit acceptance
//! tests. If acceptance tests don't exist, the episode is not allowed to
//! enter the execute phase; it stays in explore/plan until a validation
//! plan exists. Forcing this clarity before action kills a whole class of
//! rabbit holes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::episode::Episode;
use crate::ids::{derive_id, now_micros, prefix};

/// File name for persisted acceptance plans.
pub const ACCEPTANCE_PLANS_FILE: &str = "eidos_acceptance_plans.json";

/// Kinds of acceptance tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceKind {
    /// Can be run automatically (test, lint, build)
    Automated,
    /// Requires human verification
    Manual,
    /// Check specific output/state
    Output,
    /// Check behavior in a scenario
    Behavior,
    /// Check a numeric threshold
    Metric,
}

/// Status of an acceptance test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    /// Not yet run
    Pending,
    Passed,
    Failed,
    /// Intentionally skipped
    Skipped,
    /// Cannot run (dependency)
    Blocked,
}

/// A single acceptance test for validating success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceTest {
    pub test_id: String,
    pub description: String,
    pub kind: AcceptanceKind,
    /// How to verify: command, check, observation
    pub verification_method: String,

    // For automated tests
    pub command: Option<String>,
    pub expected_output: Option<String>,
    pub expected_exit_code: i32,

    // For metric tests
    pub metric_name: Option<String>,
    pub metric_threshold: Option<f64>,
    pub metric_operator: String,

    // Status tracking
    pub status: AcceptanceStatus,
    pub actual_output: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub evidence_ref: Option<String>,

    /// 1 = must pass, 2 = should pass, 3 = nice to have
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl AcceptanceTest {
    /// Create a pending test with a derived id.
    pub fn new(description: impl Into<String>, kind: AcceptanceKind, verification_method: impl Into<String>, priority: u8) -> Self {
        let description = description.into();
        let created_at = now_micros();
        let test_id = format!(
            "acc_{}",
            &derive_id(&format!(
                "{}:{}",
                prefix(&description, 30),
                created_at.timestamp_micros()
            ))[..8]
        );
        Self {
            test_id,
            description,
            kind,
            verification_method: verification_method.into(),
            command: None,
            expected_output: None,
            expected_exit_code: 0,
            metric_name: None,
            metric_threshold: None,
            metric_operator: ">=".to_string(),
            status: AcceptanceStatus::Pending,
            actual_output: None,
            run_at: None,
            evidence_ref: None,
            priority,
            created_at,
        }
    }

    /// Is this a critical (must-pass) test?
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.priority == 1
    }
}

/// Whether an episode may enter the execute phase, and why not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteReadiness {
    pub ready: bool,
    pub reason: String,
}

/// A complete acceptance plan for an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptancePlan {
    pub plan_id: String,
    pub episode_id: String,
    pub goal: String,
    pub success_criteria: String,

    pub tests: Vec<AcceptanceTest>,

    /// All critical tests defined
    pub is_complete: bool,
    /// Ready to enter execute
    pub is_approved: bool,

    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl AcceptancePlan {
    fn new(episode: &Episode) -> Self {
        Self {
            plan_id: format!("plan_{}", prefix(&episode.episode_id, 8)),
            episode_id: episode.episode_id.clone(),
            goal: episode.goal.clone(),
            success_criteria: episode.success_criteria.clone(),
            tests: Vec::new(),
            is_complete: false,
            is_approved: false,
            created_at: now_micros(),
            approved_at: None,
        }
    }

    /// All critical (must-pass) tests.
    #[must_use]
    pub fn critical_tests(&self) -> Vec<&AcceptanceTest> {
        self.tests.iter().filter(|t| t.is_critical()).collect()
    }

    /// Have all critical tests passed? False when none exist.
    #[must_use]
    pub fn all_critical_passed(&self) -> bool {
        let critical = self.critical_tests();
        !critical.is_empty()
            && critical
                .iter()
                .all(|t| t.status == AcceptanceStatus::Passed)
    }

    /// Has any critical test failed?
    #[must_use]
    pub fn any_critical_failed(&self) -> bool {
        self.critical_tests()
            .iter()
            .any(|t| t.status == AcceptanceStatus::Failed)
    }

    /// Tests that haven't been run.
    #[must_use]
    pub fn pending_tests(&self) -> Vec<&AcceptanceTest> {
        self.tests
            .iter()
            .filter(|t| t.status == AcceptanceStatus::Pending)
            .collect()
    }

    /// Completion progress in [0, 1].
    #[must_use]
    pub fn progress(&self) -> f32 {
        if self.tests.is_empty() {
            return 0.0;
        }
        let passed = self
            .tests
            .iter()
            .filter(|t| t.status == AcceptanceStatus::Passed)
            .count();
        passed as f32 / self.tests.len() as f32
    }

    /// Check if this plan permits entering the execute phase.
    #[must_use]
    pub fn can_enter_execute(&self) -> ExecuteReadiness {
        if self.tests.is_empty() {
            return ExecuteReadiness {
                ready: false,
                reason: "No acceptance tests defined".to_string(),
            };
        }
        if self.critical_tests().is_empty() {
            return ExecuteReadiness {
                ready: false,
                reason: "No critical (must-pass) tests defined".to_string(),
            };
        }
        if !self.is_approved {
            return ExecuteReadiness {
                ready: false,
                reason: "Acceptance plan not approved".to_string(),
            };
        }
        ExecuteReadiness {
            ready: true,
            reason: "Ready for execution".to_string(),
        }
    }
}

/// Compiles goals into acceptance tests and gates the execute phase.
///
/// Plans persist to a flat JSON file with the same atomic-write discipline
/// as the other state files; decode failures read as no plans.
pub struct AcceptanceCompiler {
    plans: Mutex<HashMap<String, AcceptancePlan>>,
    path: Option<PathBuf>,
}

impl Default for AcceptanceCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceptanceCompiler {
    /// Create an in-memory compiler (plans do not survive the process).
    #[must_use]
    pub fn new() -> Self {
        Self {
            plans: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Create a compiler persisting plans at `path`.
    #[must_use]
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let plans = crate::state_files::read_json_map(&path);
        Self {
            plans: Mutex::new(plans),
            path: Some(path),
        }
    }

    /// Compile an episode's goal and success criteria into a plan.
    pub fn compile_from_episode(&self, episode: &Episode) -> AcceptancePlan {
        let mut plan = AcceptancePlan::new(episode);
        plan.tests = parse_success_criteria(&episode.success_criteria, &episode.goal);
        plan.is_complete = !plan.critical_tests().is_empty();
        debug!(
            plan_id = %plan.plan_id,
            tests = plan.tests.len(),
            "acceptance plan compiled"
        );

        let mut plans = self.plans.lock();
        plans.insert(plan.plan_id.clone(), plan.clone());
        self.save(&plans);
        plan
    }

    /// Add a test to a plan.
    pub fn add_test(&self, plan_id: &str, test: AcceptanceTest) {
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get_mut(plan_id) {
            plan.tests.push(test);
            plan.is_complete = !plan.critical_tests().is_empty();
            self.save(&plans);
        }
    }

    /// Approve a plan for execution; refuses incomplete plans.
    pub fn approve_plan(&self, plan_id: &str) -> std::result::Result<(), String> {
        let mut plans = self.plans.lock();
        let Some(plan) = plans.get_mut(plan_id) else {
            return Err("Plan not found".to_string());
        };
        if !plan.is_complete || plan.critical_tests().is_empty() {
            return Err("Plan incomplete - no critical tests".to_string());
        }
        plan.is_approved = true;
        plan.approved_at = Some(now_micros());
        self.save(&plans);
        Ok(())
    }

    /// Record a test result.
    pub fn record_test_result(
        &self,
        plan_id: &str,
        test_id: &str,
        status: AcceptanceStatus,
        actual_output: &str,
        evidence_ref: &str,
    ) {
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get_mut(plan_id) {
            if let Some(test) = plan.tests.iter_mut().find(|t| t.test_id == test_id) {
                test.status = status;
                test.actual_output = Some(actual_output.to_string());
                test.run_at = Some(now_micros());
                test.evidence_ref = Some(evidence_ref.to_string());
            }
            self.save(&plans);
        }
    }

    /// The plan for an episode, if one exists.
    #[must_use]
    pub fn get_plan(&self, episode_id: &str) -> Option<AcceptancePlan> {
        self.plans
            .lock()
            .values()
            .find(|p| p.episode_id == episode_id)
            .cloned()
    }

    /// Check if an episode can enter the execute phase.
    #[must_use]
    pub fn check_can_execute(&self, episode_id: &str) -> ExecuteReadiness {
        match self.get_plan(episode_id) {
            Some(plan) => plan.can_enter_execute(),
            None => ExecuteReadiness {
                ready: false,
                reason: "No acceptance plan exists - create plan first".to_string(),
            },
        }
    }

    fn save(&self, plans: &HashMap<String, AcceptancePlan>) {
        if let Some(path) = &self.path {
            if let Err(error) = crate::state_files::write_json_atomic(path, plans) {
                warn!(%error, "failed to persist acceptance plans");
            }
        }
    }
}

/// Parse success criteria into acceptance tests.
///
/// "X passes" shapes yield automated tests, "X works" behavior tests,
/// "produces X" output tests, threshold wording metric tests; anything else
/// falls back to one critical manual verification.
fn parse_success_criteria(criteria: &str, goal: &str) -> Vec<AcceptanceTest> {
    let criteria_lower = criteria.to_lowercase();
    let mut tests = Vec::new();

    if ["test", "pass", "build", "lint", "compile"]
        .iter()
        .any(|w| criteria_lower.contains(w))
    {
        tests.push(AcceptanceTest::new(
            format!("Automated tests pass for: {}", prefix(goal, 50)),
            AcceptanceKind::Automated,
            "Run test suite",
            1,
        ));
    }

    if ["works", "functions", "able to", "can"]
        .iter()
        .any(|w| criteria_lower.contains(w))
    {
        tests.push(AcceptanceTest::new(
            format!("Behavior verification: {}", prefix(criteria, 50)),
            AcceptanceKind::Behavior,
            "Verify stated behavior works",
            1,
        ));
    }

    if ["output", "returns", "produces", "generates"]
        .iter()
        .any(|w| criteria_lower.contains(w))
    {
        tests.push(AcceptanceTest::new(
            format!("Output verification: {}", prefix(criteria, 50)),
            AcceptanceKind::Output,
            "Check output matches expectation",
            1,
        ));
    }

    if ["<", ">", "=", "less than", "greater than", "at least"]
        .iter()
        .any(|w| criteria_lower.contains(w))
    {
        tests.push(AcceptanceTest::new(
            format!("Metric check: {}", prefix(criteria, 50)),
            AcceptanceKind::Metric,
            "Measure and compare to threshold",
            2,
        ));
    }

    if tests.is_empty() {
        tests.push(AcceptanceTest::new(
            format!("Manual verification: {}", prefix(criteria, 50)),
            AcceptanceKind::Manual,
            "Human verifies success criteria",
            1,
        ));
    }

    tests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::Budget;

    fn episode(criteria: &str) -> Episode {
        Episode::new("Fix auth timeout", criteria, Budget::default())
    }

    #[test]
    fn test_compile_from_test_criteria() {
        let compiler = AcceptanceCompiler::new();
        let plan = compiler.compile_from_episode(&episode("all auth tests pass"));
        assert!(plan.is_complete);
        assert!(plan
            .tests
            .iter()
            .any(|t| t.kind == AcceptanceKind::Automated && t.is_critical()));
    }

    #[test]
    fn test_empty_criteria_falls_back_to_manual() {
        let compiler = AcceptanceCompiler::new();
        let plan = compiler.compile_from_episode(&episode(""));
        assert_eq!(plan.tests.len(), 1);
        assert_eq!(plan.tests[0].kind, AcceptanceKind::Manual);
        assert!(plan.tests[0].is_critical());
        assert!(plan.is_complete);
    }

    #[test]
    fn test_execute_gate_requires_plan_and_approval() {
        let compiler = AcceptanceCompiler::new();
        let ep = episode("login works");

        let readiness = compiler.check_can_execute(&ep.episode_id);
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("No acceptance plan"));

        let plan = compiler.compile_from_episode(&ep);
        let readiness = compiler.check_can_execute(&ep.episode_id);
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("not approved"));

        compiler.approve_plan(&plan.plan_id).unwrap();
        let readiness = compiler.check_can_execute(&ep.episode_id);
        assert!(readiness.ready);
    }

    #[test]
    fn test_approve_refuses_plan_without_critical_tests() {
        let compiler = AcceptanceCompiler::new();
        let ep = episode("latency at least halved");
        let plan = compiler.compile_from_episode(&ep);
        // Metric-only criteria produce a priority-2 test; strip the plan
        // down to it to exercise the refusal.
        let mut plans = HashMap::new();
        let mut stripped = plan.clone();
        stripped.tests.retain(|t| !t.is_critical());
        stripped.is_complete = false;
        plans.insert(stripped.plan_id.clone(), stripped.clone());
        *compiler.plans.lock() = plans;

        assert!(compiler.approve_plan(&stripped.plan_id).is_err());
        assert!(compiler.approve_plan("missing").is_err());
    }

    #[test]
    fn test_record_result_and_progress() {
        let compiler = AcceptanceCompiler::new();
        let ep = episode("all tests pass");
        let plan = compiler.compile_from_episode(&ep);
        let test_id = plan.tests[0].test_id.clone();

        compiler.record_test_result(
            &plan.plan_id,
            &test_id,
            AcceptanceStatus::Passed,
            "42 passed",
            "ev-1",
        );
        let reloaded = compiler.get_plan(&ep.episode_id).unwrap();
        assert!(reloaded.all_critical_passed());
        assert!((reloaded.progress() - 1.0).abs() < f32::EPSILON);
        assert!(reloaded.pending_tests().is_empty());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ACCEPTANCE_PLANS_FILE);

        let plan_id = {
            let compiler = AcceptanceCompiler::with_persistence(&path);
            let plan = compiler.compile_from_episode(&episode("build passes"));
            compiler.approve_plan(&plan.plan_id).unwrap();
            plan.plan_id
        };

        let reopened = AcceptanceCompiler::with_persistence(&path);
        let plans = reopened.plans.lock();
        let plan = plans.get(&plan_id).unwrap();
        assert!(plan.is_approved);
        assert!(plan.approved_at.is_some());
    }

    #[test]
    fn test_corrupt_plan_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ACCEPTANCE_PLANS_FILE);
        std::fs::write(&path, "{broken").unwrap();
        let compiler = AcceptanceCompiler::with_persistence(&path);
        assert!(compiler.plans.lock().is_empty());
    }
}
