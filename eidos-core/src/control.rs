//! Control plane: deterministic enforcement around every step.
//!
//! The pipeline per pre-action check: validate the step envelope, run the
//! guardrails (safety, evidence-before-modification, per-phase tool
//! allowlist), run the watchers, fire the escape protocol when the watchers
//! say the episode is stuck, and refuse the action on any blocking alert.
//! Post-action, it updates the episode counters and suggests the next
//! phase. Entering the execute phase additionally requires an approved
//! acceptance plan. The control plane never raises across the API boundary;
//! every outcome is a value.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::acceptance::AcceptanceCompiler;
use crate::config::EidosConfig;
use crate::episode::Episode;
use crate::error::Result;
use crate::escape::{EscapeProtocol, EscapeProtocolResult};
use crate::guardrails::{GuardrailCheck, GuardrailEngine};
use crate::phase::Phase;
use crate::step::{Evaluation, Step};
use crate::storage::EidosStorage;
use crate::watchers::{WatcherAlert, WatcherEngine};

/// Advisory decision returned to the caller before an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDecision {
    pub allowed: bool,
    pub message: String,
    /// What the caller must do before the action can proceed
    pub required_action: Option<String>,
}

impl ControlDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            message: String::new(),
            required_action: None,
        }
    }

    fn refuse(message: String, required_action: Option<String>) -> Self {
        Self {
            allowed: false,
            message,
            required_action,
        }
    }
}

/// Result of the envelope check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeCheck {
    pub can_act: bool,
    pub missing: Vec<&'static str>,
    pub memory_violation: bool,
}

/// Validate the before-action envelope and the memory-binding rule.
///
/// `can_act` is false iff a before-action field is missing, or memories
/// exist and the step neither cites them nor declares none apply.
#[must_use]
pub fn validate_step_envelope(step: &Step, memories_exist: bool) -> EnvelopeCheck {
    let missing = step.missing_before_action();
    let memory_violation = memories_exist && !step.memory_cited && !step.memory_absent_declared;
    EnvelopeCheck {
        can_act: missing.is_empty() && !memory_violation,
        missing,
        memory_violation,
    }
}

/// Outcome of a forced phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: Phase,
    pub to: Phase,
    /// True when the transition violated the table and was applied anyway
    pub forced: bool,
    /// False when the acceptance gate refused entry into execute
    pub applied: bool,
}

/// Outcome of the pre-action pipeline.
#[derive(Debug, Clone)]
pub struct PreActionOutcome {
    pub decision: ControlDecision,
    pub alerts: Vec<WatcherAlert>,
    pub escape: Option<EscapeProtocolResult>,
    /// The guardrail violation that refused the action, when one did
    pub guardrail: Option<GuardrailCheck>,
}

/// Orchestrates guardrails, watchers, escape, and phase control for one
/// installation.
pub struct ControlPlane {
    store: Arc<dyn EidosStorage>,
    watchers: WatcherEngine,
    guardrails: GuardrailEngine,
    acceptance: Arc<AcceptanceCompiler>,
}

impl ControlPlane {
    /// Create a control plane over the canonical store.
    pub fn new(
        store: Arc<dyn EidosStorage>,
        acceptance: Arc<AcceptanceCompiler>,
        config: &EidosConfig,
    ) -> Self {
        Self {
            store,
            watchers: WatcherEngine::new(config.trace_strict),
            guardrails: GuardrailEngine::new(
                config.safety_guardrails,
                config.allow_secret_access,
            ),
            acceptance,
        }
    }

    /// The watcher engine, for trigger counts and history inspection.
    #[must_use]
    pub fn watchers(&self) -> &WatcherEngine {
        &self.watchers
    }

    /// The guardrail engine, for standalone checks.
    #[must_use]
    pub fn guardrails(&self) -> &GuardrailEngine {
        &self.guardrails
    }

    /// The acceptance compiler gating the execute phase.
    #[must_use]
    pub fn acceptance(&self) -> &Arc<AcceptanceCompiler> {
        &self.acceptance
    }

    /// Pre-action pipeline: envelope, watchers, escape, blocking alerts.
    ///
    /// On escape, the learning artifact is saved immediately (best-effort),
    /// the episode is flipped to the protocol's phase, and the action is
    /// refused.
    pub async fn check_before_action(
        &self,
        episode: &mut Episode,
        step: &Step,
        recent_steps: &[Step],
        memories_exist: bool,
    ) -> Result<PreActionOutcome> {
        let envelope = validate_step_envelope(step, memories_exist);
        if !envelope.can_act {
            let required = if envelope.memory_violation {
                "cite retrieved memory or declare none applies".to_string()
            } else {
                format!("complete envelope fields: {}", envelope.missing.join(", "))
            };
            debug!(step_id = %step.step_id, required = %required, "envelope incomplete");
            return Ok(PreActionOutcome {
                decision: ControlDecision::refuse(
                    "Step envelope incomplete".to_string(),
                    Some(required),
                ),
                alerts: Vec::new(),
                escape: None,
                guardrail: None,
            });
        }

        // Hard gates come before the loop watchers: a destructive command
        // or an evidence-starved edit is refused outright.
        if let Some(violation) = self.guardrails.is_blocked(episode, step, recent_steps) {
            info!(
                step_id = %step.step_id,
                violation = %violation.violation.map(|v| v.to_string()).unwrap_or_default(),
                "guardrail refused action"
            );
            let required = if violation.required_actions.is_empty() {
                violation.suggestions.first().cloned()
            } else {
                Some(violation.required_actions.join(", "))
            };
            return Ok(PreActionOutcome {
                decision: ControlDecision::refuse(violation.message.clone(), required),
                alerts: Vec::new(),
                escape: None,
                guardrail: Some(violation),
            });
        }

        let alerts = self
            .watchers
            .check_all(episode, step, recent_steps, memories_exist);

        if EscapeProtocol::should_trigger(&self.watchers, episode, &alerts) {
            let result = EscapeProtocol::execute(episode, recent_steps);
            episode.escape_protocol_triggered = true;
            self.apply_transition(episode, result.new_phase, "escape protocol");

            // The learning artifact persists even if nothing else does.
            if let Err(error) = self.store.save_distillation(&result.learning_artifact).await {
                warn!(%error, "failed to save escape learning artifact");
            }
            info!(episode_id = %episode.episode_id, phase = %result.new_phase, "escape protocol fired");

            return Ok(PreActionOutcome {
                decision: ControlDecision::refuse(
                    format!("Escape protocol engaged: {}", result.flipped_question),
                    Some(result.discriminating_test.clone()),
                ),
                alerts,
                escape: Some(result),
                guardrail: None,
            });
        }

        if let Some(blocking) = alerts.iter().find(|a| a.severity.is_blocking()) {
            if let Some(phase) = blocking.forced_phase {
                self.apply_transition(episode, phase, &blocking.tag.to_string());
            }
            return Ok(PreActionOutcome {
                decision: ControlDecision::refuse(
                    blocking.message.clone(),
                    Some(blocking.required_action.clone()),
                ),
                alerts,
                escape: None,
                guardrail: None,
            });
        }

        Ok(PreActionOutcome {
            decision: ControlDecision::allow(),
            alerts,
            escape: None,
            guardrail: None,
        })
    }

    /// Post-action bookkeeping: update per-episode counters and suggest the
    /// next phase. The suggestion is advisory; callers may force instead.
    pub fn process_after_action(
        &self,
        episode: &mut Episode,
        step: &Step,
    ) -> (Option<Phase>, Vec<String>) {
        let mut messages = Vec::new();

        if step.evaluation == Evaluation::Fail {
            let signature = error_signature(step);
            episode.record_error(&signature);
            messages.push(format!("recorded error '{signature}'"));
        }

        let tool = step.tool();
        if (tool == "Edit" || tool == "Write") && !step.file_path().is_empty() {
            episode.record_file_touch(step.file_path());
            if episode.is_file_frozen(step.file_path()) {
                messages.push(format!("file '{}' is now frozen", step.file_path()));
            }
        }

        episode.record_evidence(step.evidence_gathered);
        episode.record_confidence(step.confidence_after);

        let suggested = self.suggest_phase(episode, step);
        if let Some(phase) = suggested {
            messages.push(format!("suggest phase {phase}"));
        }
        (suggested, messages)
    }

    /// Force a phase transition. Halt and escalate are always permitted;
    /// anything else is checked against the table, and a violating request
    /// is logged and applied with a FORCED marker rather than refused.
    pub fn force_transition(
        &self,
        episode: &mut Episode,
        to: Phase,
        reason: &str,
    ) -> TransitionOutcome {
        self.apply_transition(episode, to, reason)
    }

    fn apply_transition(&self, episode: &mut Episode, to: Phase, reason: &str) -> TransitionOutcome {
        let from = episode.phase;
        // Entering execute requires a validation plan: without acceptance
        // tests the episode stays in explore/plan.
        if to == Phase::Execute && from != Phase::Execute {
            let readiness = self.acceptance.check_can_execute(&episode.episode_id);
            if !readiness.ready {
                warn!(%from, reason = %readiness.reason, "execute entry refused by acceptance gate");
                return TransitionOutcome {
                    from,
                    to,
                    forced: false,
                    applied: false,
                };
            }
        }

        let always_allowed = matches!(to, Phase::Halt | Phase::Escalate);
        let forced = !always_allowed && !from.can_transition(to);
        if forced {
            warn!(%from, %to, reason, "FORCED phase transition outside the table");
        } else {
            debug!(%from, %to, reason, "phase transition");
        }
        if matches!(to, Phase::Diagnose | Phase::Simplify) && from != to {
            episode.stuck_count += 1;
        }
        episode.phase = to;
        TransitionOutcome {
            from,
            to,
            forced,
            applied: true,
        }
    }

    fn suggest_phase(&self, episode: &Episode, step: &Step) -> Option<Phase> {
        if episode.is_budget_exceeded() {
            return Some(Phase::Halt);
        }
        match (episode.phase, step.evaluation) {
            (Phase::Execute, Evaluation::Pass) => Some(Phase::Validate),
            (Phase::Validate, Evaluation::Pass) => Some(Phase::Consolidate),
            (Phase::Execute, Evaluation::Fail) => {
                let signature = error_signature(step);
                if episode.is_error_limit_exceeded(&signature) {
                    Some(Phase::Diagnose)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Error signature: tool name plus the head of the result text.
#[must_use]
pub fn error_signature(step: &Step) -> String {
    let tool = step.tool();
    let tool = if tool.is_empty() { "unknown" } else { tool };
    let head: String = step.result.chars().take(40).collect();
    format!("{tool}:{head}")
}
