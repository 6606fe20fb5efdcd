use serde::{Deserialize, Serialize};

/// Episode phases. Transitions are rule-driven, not LLM-decided: the control
/// plane enforces the transition table, and the reasoning engine cannot skip
/// states on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Gather context, clarify, retrieve memory
    Explore,
    /// Generate hypotheses and tests (bounded)
    Plan,
    /// One action per step, with a prediction
    Execute,
    /// Prove the outcome, record evidence
    Validate,
    /// Distill learnings into reusable rules
    Consolidate,
    /// Debugging mode, evidence-only
    Diagnose,
    /// Reduce scope / minimal reproduction
    Simplify,
    /// Ask the user / stop and request info
    Escalate,
    /// Budget exceeded or unsafe; terminal
    Halt,
}

impl Phase {
    /// Phases reachable from this phase without a forced transition.
    ///
    /// `Halt` is terminal; `Escalate` can only halt. The table answers
    /// adjacency only: entering `Execute` additionally requires an approved
    /// acceptance plan, which the control plane enforces
    /// ([`crate::control::ControlPlane::force_transition`]) because the
    /// plan lives outside the phase machine. Without acceptance tests the
    /// episode stays in explore/plan.
    pub fn allowed_transitions(self) -> &'static [Phase] {
        match self {
            Phase::Explore => &[Phase::Plan, Phase::Escalate, Phase::Halt],
            Phase::Plan => &[Phase::Execute, Phase::Escalate, Phase::Halt],
            Phase::Execute => &[Phase::Validate, Phase::Escalate, Phase::Halt],
            Phase::Validate => &[
                Phase::Execute,
                Phase::Consolidate,
                Phase::Diagnose,
                Phase::Escalate,
                Phase::Halt,
            ],
            // Consolidate starts a new cycle or ends
            Phase::Consolidate => &[Phase::Explore, Phase::Halt],
            Phase::Diagnose => &[Phase::Simplify, Phase::Plan, Phase::Escalate, Phase::Halt],
            Phase::Simplify => &[Phase::Diagnose, Phase::Plan, Phase::Escalate, Phase::Halt],
            Phase::Escalate => &[Phase::Halt],
            Phase::Halt => &[],
        }
    }

    /// Check whether a transition to `to` is permitted by the table.
    #[must_use]
    pub fn can_transition(self, to: Phase) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// True for the terminal phase.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Halt)
    }

    /// All phases, in declaration order.
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Explore,
            Phase::Plan,
            Phase::Execute,
            Phase::Validate,
            Phase::Consolidate,
            Phase::Diagnose,
            Phase::Simplify,
            Phase::Escalate,
            Phase::Halt,
        ]
    }

    /// Parse the snake_case wire value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Phase> {
        match value {
            "explore" => Some(Phase::Explore),
            "plan" => Some(Phase::Plan),
            "execute" => Some(Phase::Execute),
            "validate" => Some(Phase::Validate),
            "consolidate" => Some(Phase::Consolidate),
            "diagnose" => Some(Phase::Diagnose),
            "simplify" => Some(Phase::Simplify),
            "escalate" => Some(Phase::Escalate),
            "halt" => Some(Phase::Halt),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Phase::Explore => "explore",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Validate => "validate",
            Phase::Consolidate => "consolidate",
            Phase::Diagnose => "diagnose",
            Phase::Simplify => "simplify",
            Phase::Escalate => "escalate",
            Phase::Halt => "halt",
        };
        write!(f, "{value}")
    }
}
