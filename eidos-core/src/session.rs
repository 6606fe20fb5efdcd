//! Session integration: the API external collaborators call.
//!
//! The hook shim drives this layer: a pre-tool event opens (or reuses) an
//! episode and a preliminary step, a post-tool event completes the step, and
//! session end (or the staleness sweep) closes the episode and runs
//! distillation. All components hang off an explicit [`EidosContext`]; there
//! is no process-wide state, so parallel contexts in tests are safe.
//!
//! The core never raises across this boundary: persistence is best-effort
//! but never corrupting, and every control outcome is a returned value.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::acceptance::{AcceptanceCompiler, ACCEPTANCE_PLANS_FILE};
use crate::config::EidosConfig;
use crate::control::{ControlDecision, ControlPlane, PreActionOutcome};
use crate::distillation::DistillationKind;
use crate::engine::DistillationEngine;
use crate::episode::{Episode, Outcome};
use crate::error::Result;
use crate::evidence::Evidence;
use crate::gate::MemoryGate;
use crate::guardrails::phase_allowed_tools;
use crate::phase::Phase;
use crate::retriever::{has_keyword_overlap, StructuralRetriever};
use crate::state_files::{PendingGoal, StateFiles, StepHandoff};
use crate::step::{ActionKind, BudgetSnapshot, Evaluation, Step};
use crate::storage::{EidosStorage, EvidenceStorage};

/// Verdict from the optional external quality roaster.
#[derive(Debug, Clone, PartialEq)]
pub struct RoastVerdict {
    pub verdict: String,
    pub total_score: f32,
}

/// Optional external quality gate for advisory text. When no roaster is
/// configured the core treats every text as passing.
pub trait AdvisoryRoast: Send + Sync {
    /// Judge a piece of advisory text from a given source.
    fn roast(&self, text: &str, source: &str) -> RoastVerdict;
}

/// Health snapshot for observability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EidosHealth {
    pub episodes: u64,
    pub steps: u64,
    pub distillations: u64,
    /// Fraction of distillations that have received usage feedback
    pub feedback_ratio: f32,
    /// In-progress episodes past the staleness threshold
    pub stale: u64,
    pub policies: u64,
}

/// Default number of retrieval results per step.
const RETRIEVER_MAX_RESULTS: usize = 10;

/// Goal placeholders that a real goal may replace.
fn is_generic_goal(goal: &str) -> bool {
    let lower = goal.trim().to_lowercase();
    lower.is_empty() || lower == "claude code session" || lower.starts_with("session in ")
}

/// Owns the intelligence components and exposes the collaborator API.
pub struct EidosContext {
    config: EidosConfig,
    store: Arc<dyn EidosStorage>,
    evidence: Arc<dyn EvidenceStorage>,
    control: ControlPlane,
    gate: MemoryGate,
    retriever: StructuralRetriever,
    engine: DistillationEngine,
    acceptance: Arc<AcceptanceCompiler>,
    state: StateFiles,
    roaster: Option<Arc<dyn AdvisoryRoast>>,
}

impl EidosContext {
    /// Assemble a context from its stores and a config snapshot.
    pub fn new(
        config: EidosConfig,
        store: Arc<dyn EidosStorage>,
        evidence: Arc<dyn EvidenceStorage>,
        state: StateFiles,
    ) -> Self {
        let acceptance = Arc::new(AcceptanceCompiler::with_persistence(
            state.dir().join(ACCEPTANCE_PLANS_FILE),
        ));
        let control = ControlPlane::new(Arc::clone(&store), Arc::clone(&acceptance), &config);
        let retriever = StructuralRetriever::new(Arc::clone(&store), RETRIEVER_MAX_RESULTS);
        Self {
            config,
            store,
            evidence,
            control,
            gate: MemoryGate::default(),
            retriever,
            engine: DistillationEngine::new(),
            acceptance,
            state,
            roaster: None,
        }
    }

    /// Attach the optional external quality roaster.
    #[must_use]
    pub fn with_roaster(mut self, roaster: Arc<dyn AdvisoryRoast>) -> Self {
        self.roaster = Some(roaster);
        self
    }

    /// The canonical store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EidosStorage> {
        &self.store
    }

    /// The evidence store.
    #[must_use]
    pub fn evidence(&self) -> &Arc<dyn EvidenceStorage> {
        &self.evidence
    }

    /// The structural retriever.
    #[must_use]
    pub fn retriever(&self) -> &StructuralRetriever {
        &self.retriever
    }

    /// The memory gate.
    #[must_use]
    pub fn gate(&self) -> &MemoryGate {
        &self.gate
    }

    /// The control plane.
    #[must_use]
    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    /// The distillation engine.
    #[must_use]
    pub fn engine(&self) -> &DistillationEngine {
        &self.engine
    }

    /// The acceptance compiler gating the execute phase.
    #[must_use]
    pub fn acceptance(&self) -> &Arc<AcceptanceCompiler> {
        &self.acceptance
    }

    /// The configuration snapshot.
    #[must_use]
    pub fn config(&self) -> &EidosConfig {
        &self.config
    }

    /// Judge advisory text through the external roaster; absence is
    /// pass-through.
    #[must_use]
    pub fn roast(&self, text: &str, source: &str) -> RoastVerdict {
        match &self.roaster {
            Some(roaster) => roaster.roast(text, source),
            None => RoastVerdict {
                verdict: "pass".to_string(),
                total_score: 10.0,
            },
        }
    }

    // ==================== Episode lifecycle ====================

    /// Fetch the session's active episode, or create one. A pending goal
    /// recorded for the session wins over the placeholder.
    pub async fn get_or_create_episode(
        &self,
        session_id: &str,
        goal: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<Episode> {
        let mut active = self.state.active_episodes();
        if let Some(episode_id) = active.get(session_id) {
            if let Some(episode) = self.store.get_episode(episode_id).await? {
                if !episode.is_complete() {
                    return Ok(episode);
                }
            }
        }

        let pending = self.state.pending_goals();
        let goal_text = goal
            .map(ToString::to_string)
            .or_else(|| pending.get(session_id).map(|p| p.goal.clone()))
            .unwrap_or_else(|| match cwd {
                Some(cwd) => format!("Session in {cwd}"),
                None => "Claude Code session".to_string(),
            });

        let episode = Episode::new(goal_text, "", self.config.budget());
        self.store.save_episode(&episode).await?;
        active.insert(session_id.to_string(), episode.episode_id.clone());
        if let Err(error) = self.state.save_active_episodes(&active) {
            warn!(%error, "failed to persist active episode map");
        }
        info!(episode_id = %episode.episode_id, session_id, "episode created");
        Ok(episode)
    }

    /// Record a goal for a session that has no episode yet.
    pub fn record_pending_goal(&self, session_id: &str, goal: &str) {
        let mut pending = self.state.pending_goals();
        pending.insert(
            session_id.to_string(),
            PendingGoal {
                goal: goal.to_string(),
                ts: Utc::now(),
            },
        );
        if let Err(error) = self.state.save_pending_goals(&pending) {
            warn!(%error, "failed to persist pending goals");
        }
    }

    /// Replace the episode goal, but only when the current one is a generic
    /// placeholder.
    pub async fn update_episode_goal(&self, session_id: &str, goal: &str) -> Result<bool> {
        let active = self.state.active_episodes();
        let Some(episode_id) = active.get(session_id) else {
            return Ok(false);
        };
        let Some(mut episode) = self.store.get_episode(episode_id).await? else {
            return Ok(false);
        };
        if !is_generic_goal(&episode.goal) || is_generic_goal(goal) {
            return Ok(false);
        }
        episode.goal = goal.to_string();
        self.store.save_episode(&episode).await?;
        debug!(episode_id = %episode.episode_id, "episode goal updated");
        Ok(true)
    }

    /// Close the session's episode and run distillation. The caller's
    /// claimed outcome is cross-checked against the step record: claiming
    /// success over contradicting data downgrades to the inferred outcome.
    pub async fn complete_episode(
        &self,
        session_id: &str,
        outcome: Option<Outcome>,
        final_evaluation: Option<&str>,
    ) -> Result<Episode> {
        let mut active = self.state.active_episodes();
        let episode_id = active
            .get(session_id)
            .cloned()
            .ok_or_else(|| crate::error::Error::EpisodeNotFound(session_id.to_string()))?;
        let mut episode = self
            .store
            .get_episode(&episode_id)
            .await?
            .ok_or_else(|| crate::error::Error::EpisodeNotFound(episode_id.clone()))?;

        let steps = self.store.get_episode_steps(&episode_id).await?;
        let inferred = infer_outcome(&steps);
        let resolved = match outcome {
            Some(Outcome::Success) if inferred != Outcome::Success && !steps.is_empty() => inferred,
            Some(claimed) => claimed,
            None => inferred,
        };

        let evaluation = final_evaluation
            .map(ToString::to_string)
            .unwrap_or_else(|| step_distribution_summary(&steps));
        episode.close(resolved, evaluation);
        self.store.save_episode(&episode).await?;

        if let Err(error) = self
            .engine
            .distill_episode(&self.store, &episode, &steps)
            .await
        {
            warn!(%error, "distillation pass failed");
        }

        active.remove(session_id);
        if let Err(error) = self.state.save_active_episodes(&active) {
            warn!(%error, "failed to persist active episode map");
        }
        info!(episode_id = %episode.episode_id, outcome = %episode.outcome, "episode closed");
        Ok(episode)
    }

    // ==================== Step lifecycle ====================

    /// Open a step for an imminent tool call. The preliminary row always
    /// persists so the audit trail survives a crashed action or a missed
    /// post-hook; the returned decision is advisory.
    pub async fn create_step_before_action(
        &self,
        session_id: &str,
        tool: &str,
        input: &HashMap<String, String>,
        prediction: &str,
        trace_id: Option<&str>,
    ) -> Result<(Step, ControlDecision)> {
        let mut episode = self.get_or_create_episode(session_id, None, None).await?;

        let (intent, decision) = describe_action(tool, input);
        let mut step = Step::new(&episode.episode_id, intent);
        step.decision = decision;
        step.prediction = if prediction.is_empty() {
            format!("{tool} completes without error")
        } else {
            prediction.to_string()
        };
        step.trace_id = trace_id.map(ToString::to_string);
        step.action_kind = ActionKind::ToolCall;
        step.action_details = action_details(tool, input);
        step.budget_snapshot = BudgetSnapshot::of(&episode);

        // The phase machine is rule-driven: an execution-shaped tool call
        // arriving in explore/plan advances the episode along the legal
        // path, through the acceptance gate.
        self.advance_phase_for_tool_call(&mut episode, &step);

        // Memory binding: retrieval happens here, and its outcome is
        // recorded on the envelope before the action runs.
        let retrieved = self.retriever.retrieve_for_step(&step).await?;
        step.retrieved_memories = retrieved
            .iter()
            .map(|d| d.distillation_id.clone())
            .collect();
        if step.retrieved_memories.is_empty() {
            step.memory_absent_declared = true;
        } else {
            step.memory_cited = true;
        }
        let memories_exist = !step.retrieved_memories.is_empty();

        // Persist before the control verdict: the row must exist even if
        // the action is refused or the post-hook never arrives.
        step.is_valid = step.missing_before_action().is_empty();
        self.store.save_step(&step).await?;
        episode.step_count += 1;

        let recent = self.store.get_episode_steps(&episode.episode_id).await?;
        let PreActionOutcome {
            decision: control_decision,
            ..
        } = self
            .control
            .check_before_action(&mut episode, &step, &recent, memories_exist)
            .await?;
        self.store.save_episode(&episode).await?;

        let mut handoffs = self.state.active_steps();
        handoffs.insert(
            session_id.to_string(),
            StepHandoff {
                step_id: step.step_id.clone(),
                episode_id: episode.episode_id.clone(),
                tool_name: tool.to_string(),
                prediction: step.prediction.clone(),
                trace_id: step.trace_id.clone(),
                intent: step.intent.clone(),
                decision: step.decision.clone(),
                action_details: step.action_details.clone(),
                retrieved_distillation_ids: step.retrieved_memories.clone(),
                timestamp: Utc::now(),
            },
        );
        if let Err(error) = self.state.save_active_steps(&handoffs) {
            warn!(%error, "failed to persist step handoff");
        }

        Ok((step, control_decision))
    }

    /// Complete the step once the action's outcome is known: evaluate,
    /// compute surprise, extract the lesson, persist evidence, advance the
    /// phase, and feed back onto cited distillations when the signal is
    /// meaningful.
    pub async fn complete_step_after_action(
        &self,
        session_id: &str,
        tool: &str,
        success: bool,
        result: &str,
        error: Option<&str>,
    ) -> Result<Step> {
        let mut handoffs = self.state.active_steps();
        let handoff = handoffs
            .remove(session_id)
            .ok_or_else(|| crate::error::Error::StepNotFound(session_id.to_string()))?;
        if let Err(persist_error) = self.state.save_active_steps(&handoffs) {
            warn!(%persist_error, "failed to persist step handoff removal");
        }

        let mut step = self
            .store
            .get_step(&handoff.step_id)
            .await?
            .ok_or_else(|| crate::error::Error::StepNotFound(handoff.step_id.clone()))?;

        let outcome_text = error.filter(|e| !e.is_empty()).unwrap_or(result);
        step.result = head(outcome_text, 500);
        step.evaluation = if success {
            Evaluation::Pass
        } else {
            Evaluation::Fail
        };
        step.surprise_level = step.calculate_surprise();
        step.lesson = extract_lesson(&step, success);
        step.confidence_after = if success {
            (step.confidence_before + 0.2).min(0.9)
        } else {
            (step.confidence_before - 0.2).max(0.1)
        };
        step.confidence_delta = step.confidence_after - step.confidence_before;
        step.validated = true;
        step.validation_method = if success {
            "output:expected".to_string()
        } else {
            "output:unexpected".to_string()
        };
        step.validation_evidence = head(result, 200);
        step.evidence_gathered = !outcome_text.is_empty();
        step.progress_made = success;
        step.is_valid = step.is_envelope_complete();

        self.store.save_step(&step).await?;

        // Evidence is ephemeral but mandatory for audit fidelity
        if !outcome_text.is_empty() {
            let artifact =
                Evidence::from_tool_output(&step.step_id, tool, outcome_text, None, None);
            if let Err(save_error) = self.evidence.save(&artifact, 10_000).await {
                warn!(%save_error, "failed to save evidence");
            }
        }

        if let Some(mut episode) = self.store.get_episode(&handoff.episode_id).await? {
            let (suggested, _messages) = self.control.process_after_action(&mut episode, &step);
            if let Some(phase) = suggested {
                if episode.phase.can_transition(phase) {
                    episode.phase = phase;
                }
            }
            self.store.save_episode(&episode).await?;
        }

        self.record_memory_feedback(&step, success).await?;

        Ok(step)
    }

    /// Walk an episode still in explore/plan into the execute phase when a
    /// tool call arrives that execute permits but the current phase does
    /// not. Entry into execute stays behind the acceptance gate: if no plan
    /// exists yet, one is compiled from the episode's goal and success
    /// criteria and approved when complete; an episode whose plan cannot be
    /// approved stays in explore/plan and the guardrails refuse the tool.
    fn advance_phase_for_tool_call(&self, episode: &mut Episode, step: &Step) {
        if step.action_kind != ActionKind::ToolCall {
            return;
        }
        let tool = step.tool();
        if tool.is_empty() || !matches!(episode.phase, Phase::Explore | Phase::Plan) {
            return;
        }
        let allowed_now = phase_allowed_tools(episode.phase)
            .map_or(true, |tools| tools.contains(&tool));
        if allowed_now {
            return;
        }
        let execute_allows = phase_allowed_tools(Phase::Execute)
            .map_or(true, |tools| tools.contains(&tool));
        if !execute_allows {
            return;
        }

        // Definition of done first: execute requires a validation plan
        if self.acceptance.get_plan(&episode.episode_id).is_none() {
            let plan = self.acceptance.compile_from_episode(episode);
            if let Err(reason) = self.acceptance.approve_plan(&plan.plan_id) {
                warn!(episode_id = %episode.episode_id, reason, "acceptance plan not approvable");
            }
        }

        if episode.phase == Phase::Explore {
            self.control
                .force_transition(episode, Phase::Plan, "tool call implies planning is due");
        }
        if episode.phase == Phase::Plan {
            self.control
                .force_transition(episode, Phase::Execute, "execution-shaped tool call");
        }
    }

    /// Convenience gate applying the same pre-action rules without creating
    /// a step or touching any persistent state. Returns the refusal reason,
    /// if any.
    pub async fn should_block_action(
        &self,
        session_id: &str,
        tool: &str,
        input: &HashMap<String, String>,
    ) -> Result<Option<String>> {
        let active = self.state.active_episodes();
        let Some(episode_id) = active.get(session_id) else {
            return Ok(None);
        };
        let Some(episode) = self.store.get_episode(episode_id).await? else {
            return Ok(None);
        };

        let (intent, decision) = describe_action(tool, input);
        let mut probe = Step::new(&episode.episode_id, intent);
        probe.decision = decision;
        probe.prediction = format!("{tool} completes without error");
        probe.action_kind = ActionKind::ToolCall;
        probe.action_details = action_details(tool, input);
        probe.memory_absent_declared = true;

        let recent = self.store.get_episode_steps(&episode.episode_id).await?;
        if let Some(violation) = self
            .control
            .guardrails()
            .is_blocked(&episode, &probe, &recent)
        {
            return Ok(Some(violation.message));
        }
        let alerts = self
            .control
            .watchers()
            .check_all(&episode, &probe, &recent, false);
        Ok(alerts
            .iter()
            .find(|a| a.severity.is_blocking())
            .map(|a| a.message.clone()))
    }

    // ==================== Maintenance & observability ====================

    /// Force-close episodes idle past the configured threshold with at
    /// least one step. Outcome follows the majority of step evaluations,
    /// and distillation runs for each closed episode. Returns closed ids.
    pub async fn sweep_stale_episodes(&self) -> Result<Vec<String>> {
        let threshold = self.config.stale_after_seconds as i64;
        let now = Utc::now();
        let mut closed = Vec::new();

        for mut episode in self.store.get_recent_episodes(100).await? {
            if episode.outcome != Outcome::InProgress || episode.step_count == 0 {
                continue;
            }
            if (now - episode.start_ts).num_seconds() <= threshold {
                continue;
            }

            let steps = self.store.get_episode_steps(&episode.episode_id).await?;
            let outcome = infer_outcome(&steps);
            let summary = format!("Auto-closed: {}", step_distribution_summary(&steps));
            episode.close(outcome, summary);
            self.store.save_episode(&episode).await?;

            if let Err(error) = self
                .engine
                .distill_episode(&self.store, &episode, &steps)
                .await
            {
                warn!(%error, "distillation after staleness sweep failed");
            }
            info!(episode_id = %episode.episode_id, outcome = %episode.outcome, "stale episode closed");
            closed.push(episode.episode_id);
        }

        // Sessions pointing at closed episodes lose their binding
        if !closed.is_empty() {
            let mut active = self.state.active_episodes();
            active.retain(|_, episode_id| !closed.contains(episode_id));
            if let Err(error) = self.state.save_active_episodes(&active) {
                warn!(%error, "failed to persist active episode map");
            }
        }

        Ok(closed)
    }

    /// Health snapshot for the observatory.
    pub async fn get_eidos_health(&self) -> Result<EidosHealth> {
        let stats = self.store.get_stats().await?;

        let distillations = self.store.get_all_distillations(500).await?;
        let with_feedback = distillations.iter().filter(|d| d.times_used > 0).count();
        let feedback_ratio = if distillations.is_empty() {
            0.0
        } else {
            with_feedback as f32 / distillations.len() as f32
        };

        let threshold = self.config.stale_after_seconds as i64;
        let now = Utc::now();
        let stale = self
            .store
            .get_recent_episodes(100)
            .await?
            .iter()
            .filter(|e| {
                e.outcome == Outcome::InProgress
                    && e.step_count > 0
                    && (now - e.start_ts).num_seconds() > threshold
            })
            .count() as u64;

        Ok(EidosHealth {
            episodes: stats.episodes,
            steps: stats.steps,
            distillations: stats.distillations,
            feedback_ratio,
            stale,
            policies: stats.policies,
        })
    }

    // ==================== Feedback ====================

    /// Feedback on cited distillations. Routine predicted passes carry no
    /// signal and are skipped; failures always count. Anti-patterns only
    /// receive feedback when their targeted action overlaps the step's
    /// decision (quoted-content match, else two meaningful shared words).
    async fn record_memory_feedback(&self, step: &Step, success: bool) -> Result<()> {
        let routine_pass = success && step.surprise_level < 0.5;
        if routine_pass || step.retrieved_memories.is_empty() || !step.memory_cited {
            return Ok(());
        }

        for distillation_id in &step.retrieved_memories {
            let Some(distillation) = self.store.get_distillation(distillation_id).await? else {
                continue;
            };
            if distillation.kind == DistillationKind::AntiPattern
                && !anti_pattern_targets_decision(&distillation.statement, &step.decision)
            {
                continue;
            }
            self.store
                .record_distillation_usage(distillation_id, success)
                .await?;
        }
        Ok(())
    }
}

/// Whether an anti-pattern's targeted action matches the step decision:
/// any quoted token from the statement appearing in the decision, or two
/// meaningful shared words.
#[must_use]
pub fn anti_pattern_targets_decision(statement: &str, decision: &str) -> bool {
    let decision_lower = decision.to_lowercase();
    let quoted = extract_quoted(statement);
    if !quoted.is_empty() {
        return quoted.iter().any(|q| {
            decision_lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == q.to_lowercase())
        });
    }
    has_keyword_overlap(statement, decision, 2)
}

fn extract_quoted(text: &str) -> Vec<String> {
    let mut quoted = Vec::new();
    for delimiter in ['\'', '"', '`'] {
        // Every odd-indexed fragment sits between a pair of delimiters
        for (index, part) in text.split(delimiter).enumerate() {
            if index % 2 == 1 && !part.is_empty() && part.len() < 60 {
                quoted.push(part.to_string());
            }
        }
    }
    quoted
}

/// Majority-of-evaluations outcome inference.
#[must_use]
pub fn infer_outcome(steps: &[Step]) -> Outcome {
    if steps.is_empty() {
        return Outcome::Escalated;
    }
    let passed = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Pass)
        .count();
    let failed = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Fail)
        .count();

    if passed == steps.len() {
        Outcome::Success
    } else if failed > passed {
        Outcome::Failure
    } else if passed > 0 && failed > 0 {
        Outcome::Partial
    } else if passed == 0 {
        Outcome::Escalated
    } else {
        Outcome::Partial
    }
}

fn step_distribution_summary(steps: &[Step]) -> String {
    let passed = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Pass)
        .count();
    let failed = steps
        .iter()
        .filter(|s| s.evaluation == Evaluation::Fail)
        .count();
    format!("{passed} passed, {failed} failed out of {} steps", steps.len())
}

/// Human-shaped intent and decision strings for a tool invocation.
fn describe_action(tool: &str, input: &HashMap<String, String>) -> (String, String) {
    let file_path = input.get("file_path").map(String::as_str).unwrap_or("");
    let command = input.get("command").map(String::as_str).unwrap_or("");
    let pattern = input.get("pattern").map(String::as_str).unwrap_or("");

    match tool {
        "Bash" => (
            "Execute command".to_string(),
            format!("Execute: {}", head(command, 120)),
        ),
        "Edit" | "Write" | "NotebookEdit" => (
            format!("Modify {file_path}"),
            format!("Modify {file_path}"),
        ),
        "Read" => (
            format!("Inspect {file_path}"),
            format!("Inspect {file_path}"),
        ),
        "Glob" => (
            format!("Locate files {pattern}"),
            format!("Locate files matching {pattern}"),
        ),
        "Grep" => (
            format!("Search for {pattern}"),
            format!("Search for {pattern}"),
        ),
        other => (format!("Use {other}"), format!("Use {other} tool")),
    }
}

fn action_details(tool: &str, input: &HashMap<String, String>) -> HashMap<String, String> {
    let mut details = HashMap::new();
    details.insert("tool".to_string(), tool.to_string());
    for key in ["file_path", "command", "pattern", "url"] {
        if let Some(value) = input.get(key) {
            details.insert(key.to_string(), head(value, 200));
        }
    }
    details
}

fn extract_lesson(step: &Step, success: bool) -> String {
    if !success {
        return format!(
            "Failed: {} - {}",
            step.tool(),
            head(&step.result, 80)
        );
    }
    if step.surprise_level >= 0.5 {
        return format!(
            "Expected '{}' but got '{}'",
            head(&step.prediction, 60),
            head(&step.result, 60)
        );
    }
    format!("Confirmed: {}", head(&step.prediction, 80))
}

fn head(text: &str, max_chars: usize) -> String {
    crate::ids::prefix(text, max_chars).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with(evaluation: Evaluation) -> Step {
        let mut step = Step::new("ep0123456789", "work");
        step.evaluation = evaluation;
        step
    }

    #[test]
    fn test_infer_outcome_majorities() {
        assert_eq!(infer_outcome(&[]), Outcome::Escalated);
        assert_eq!(
            infer_outcome(&[step_with(Evaluation::Pass), step_with(Evaluation::Pass)]),
            Outcome::Success
        );
        assert_eq!(
            infer_outcome(&[step_with(Evaluation::Pass), step_with(Evaluation::Fail)]),
            Outcome::Partial
        );
        assert_eq!(
            infer_outcome(&[
                step_with(Evaluation::Fail),
                step_with(Evaluation::Fail),
                step_with(Evaluation::Pass)
            ]),
            Outcome::Failure
        );
        assert_eq!(
            infer_outcome(&[step_with(Evaluation::Unknown)]),
            Outcome::Escalated
        );
    }

    #[test]
    fn test_generic_goal_detection() {
        assert!(is_generic_goal(""));
        assert!(is_generic_goal("Claude Code session"));
        assert!(is_generic_goal("Session in /home/user/project"));
        assert!(!is_generic_goal("Fix auth timeout"));
    }

    #[test]
    fn test_anti_pattern_relevance_by_quoted_content() {
        let statement = "When repeated 'find' commands fail, try a different approach";
        assert!(!anti_pattern_targets_decision(
            statement,
            "Execute: git push origin main"
        ));
        assert!(anti_pattern_targets_decision(
            statement,
            "Execute: find . -name '*.py'"
        ));
    }

    #[test]
    fn test_anti_pattern_relevance_by_word_overlap() {
        let statement = "Stop rewriting the database migration wholesale";
        assert!(anti_pattern_targets_decision(
            statement,
            "Execute: run the database migration script"
        ));
        assert!(!anti_pattern_targets_decision(
            statement,
            "Inspect src/ui/render.rs"
        ));
    }

    #[test]
    fn test_describe_action_shapes() {
        let mut input = HashMap::new();
        input.insert("command".to_string(), "pytest -k auth".to_string());
        let (intent, decision) = describe_action("Bash", &input);
        assert_eq!(intent, "Execute command");
        assert_eq!(decision, "Execute: pytest -k auth");

        let mut input = HashMap::new();
        input.insert("file_path".to_string(), "src/auth.rs".to_string());
        let (_, decision) = describe_action("Edit", &input);
        assert_eq!(decision, "Modify src/auth.rs");
    }

    #[test]
    fn test_lesson_extraction() {
        let mut step = Step::new("ep0123456789", "run");
        step.action_details
            .insert("tool".to_string(), "Bash".to_string());
        step.prediction = "tests pass".to_string();
        step.result = "ImportError".to_string();
        assert!(extract_lesson(&step, false).starts_with("Failed: Bash"));

        step.result = "tests pass".to_string();
        step.surprise_level = 0.0;
        assert!(extract_lesson(&step, true).starts_with("Confirmed"));

        step.surprise_level = 0.7;
        assert!(extract_lesson(&step, true).starts_with("Expected"));
    }

    #[test]
    fn test_step_distribution_summary() {
        let steps = vec![step_with(Evaluation::Pass), step_with(Evaluation::Fail)];
        assert_eq!(
            step_distribution_summary(&steps),
            "1 passed, 1 failed out of 2 steps"
        );
    }
}
