//! Guardrails: hard gates for quality and safety enforcement.
//!
//! These are not suggestions; they refuse actions that violate intelligence
//! principles. The watchers cover the loop/progress contracts; the gates
//! here are the remaining hard stops: evidence before modification (no
//! re-editing a file after repeated failed edits until diagnostic evidence
//! exists), high-risk tool use (obviously destructive commands and
//! secret-store reads), and the per-phase tool allowlist.
//!
//! The tool allowlist is a separate control surface from the phase
//! transition table: [`crate::phase::Phase::allowed_transitions`] governs
//! which phase may follow which, while [`phase_allowed_tools`] governs what
//! a step may DO while inside a phase.

use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::phase::Phase;
use crate::step::{ActionKind, Evaluation, Step};

/// Tools that modify files.
pub const EDIT_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit"];

/// Failed edits on one file tolerated before evidence is demanded.
pub const EDIT_FAILURE_THRESHOLD: usize = 2;

/// Intent keywords that mark a diagnostic step.
const DIAGNOSTIC_INTENTS: &[&str] = &[
    "diagnose",
    "reproduce",
    "isolate",
    "narrow",
    "investigate",
    "understand",
    "analyze",
    "debug",
    "trace",
    "examine",
];

/// Lesson phrases that indicate real understanding was reached.
const UNDERSTANDING_MARKERS: &[&str] = &["root cause", "because", "the issue is", "found that"];

/// Kinds of guardrail violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailViolation {
    EvidenceBeforeModification,
    PhaseViolation,
    HighRiskToolUse,
}

impl std::fmt::Display for GuardrailViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            GuardrailViolation::EvidenceBeforeModification => "evidence_before_modification",
            GuardrailViolation::PhaseViolation => "phase_violation",
            GuardrailViolation::HighRiskToolUse => "high_risk_tool_use",
        };
        write!(f, "{value}")
    }
}

/// Result of one guardrail check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailCheck {
    pub passed: bool,
    pub violation: Option<GuardrailViolation>,
    pub message: String,
    pub required_actions: Vec<String>,
    pub suggestions: Vec<String>,
}

impl GuardrailCheck {
    fn pass() -> Self {
        Self {
            passed: true,
            violation: None,
            message: String::new(),
            required_actions: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    fn fail(
        violation: GuardrailViolation,
        message: String,
        required_actions: &[&str],
        suggestions: &[&str],
    ) -> Self {
        Self {
            passed: false,
            violation: Some(violation),
            message,
            required_actions: required_actions.iter().map(ToString::to_string).collect(),
            suggestions: suggestions.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Tools permitted inside a phase, where the phase restricts them.
///
/// Phases without an entry (plan, validate, simplify, halt) carry no tool
/// restriction here; the transition table and budgets still bind.
#[must_use]
pub fn phase_allowed_tools(phase: Phase) -> Option<&'static [&'static str]> {
    match phase {
        Phase::Explore => Some(&[
            "Read",
            "Glob",
            "Grep",
            "WebSearch",
            "WebFetch",
            "AskUser",
            "Task",
        ]),
        Phase::Diagnose => Some(&["Read", "Glob", "Grep", "Bash", "Test", "AskUser"]),
        Phase::Execute => Some(&["Read", "Edit", "Write", "Bash", "Test", "NotebookEdit"]),
        Phase::Consolidate => Some(&["Read", "Reflect", "Distill"]),
        Phase::Escalate => Some(&["Summarize", "AskUser", "AskUserQuestion"]),
        _ => None,
    }
}

/// Defensive gate against obviously dangerous actions.
///
/// Not a general harm-prevention solution, but it removes accidental
/// foot-guns and makes risky automation explicit.
#[derive(Debug, Clone)]
pub struct HighRiskToolGuard {
    /// Master switch for this guard
    pub enabled: bool,
    /// Permit reads of likely-secret files
    pub allow_secrets: bool,
}

impl HighRiskToolGuard {
    /// Check a step against the destructive-command, pipe-to-shell, and
    /// secret-path rules.
    #[must_use]
    pub fn check(&self, step: &Step) -> GuardrailCheck {
        if !self.enabled || step.action_kind != ActionKind::ToolCall {
            return GuardrailCheck::pass();
        }

        let tool = step.tool();
        if tool == "Bash" {
            let command_lower = step.command().to_lowercase();
            let command_lower = command_lower.trim();
            if is_obviously_destructive(command_lower) {
                return GuardrailCheck::fail(
                    GuardrailViolation::HighRiskToolUse,
                    "Blocked high-risk shell command (obviously destructive).".to_string(),
                    &["remove_or_sandbox_command", "require_human_confirmation"],
                    &[
                        "If you truly need deletion, scope it to a project subfolder and show the exact paths.",
                        "Prefer a dry-run first (e.g., list targets) before any deletion.",
                    ],
                );
            }
            if is_pipe_to_shell(command_lower) {
                return GuardrailCheck::fail(
                    GuardrailViolation::HighRiskToolUse,
                    "Blocked high-risk shell command (download and execute via pipe).".to_string(),
                    &["download_then_review", "pin_hash_or_signature"],
                    &[
                        "Download the script to a file, review it, and pin a commit/hash before running.",
                        "Prefer package-manager installs with checksums/signatures when available.",
                    ],
                );
            }
        }

        if matches!(tool, "Read" | "Glob" | "Grep") && !self.allow_secrets {
            let path = extract_path(step);
            if !path.is_empty() && looks_like_secret_path(&path) {
                return GuardrailCheck::fail(
                    GuardrailViolation::HighRiskToolUse,
                    "Blocked likely-secret file access (enable allow_secret_access to override)."
                        .to_string(),
                    &["avoid_secret_access", "use_redacted_sample_or_env_var"],
                    &[
                        "Do not read private keys or credential stores into the agent context.",
                        "Use redacted examples or least-privilege tokens stored outside the workspace.",
                    ],
                );
            }
        }

        GuardrailCheck::pass()
    }
}

/// After repeated failed edit attempts on the same file, editing is
/// forbidden until diagnostic evidence is gathered: reproduce reliably,
/// narrow scope, identify the discriminating signal.
#[derive(Debug, Clone)]
pub struct EvidenceBeforeModificationGuard {
    pub failure_threshold: usize,
}

impl Default for EvidenceBeforeModificationGuard {
    fn default() -> Self {
        Self {
            failure_threshold: EDIT_FAILURE_THRESHOLD,
        }
    }
}

impl EvidenceBeforeModificationGuard {
    /// Check whether an edit is allowed given the recent step history.
    #[must_use]
    pub fn check(&self, step: &Step, recent_steps: &[Step]) -> GuardrailCheck {
        if step.action_kind != ActionKind::ToolCall || !EDIT_TOOLS.contains(&step.tool()) {
            return GuardrailCheck::pass();
        }

        let file_path = step.file_path();
        let failed_edits = recent_steps
            .iter()
            .filter(|s| {
                s.action_kind == ActionKind::ToolCall
                    && EDIT_TOOLS.contains(&s.tool())
                    && s.file_path() == file_path
                    && s.evaluation == Evaluation::Fail
            })
            .count();

        if failed_edits >= self.failure_threshold && !has_diagnostic_evidence(recent_steps) {
            return GuardrailCheck::fail(
                GuardrailViolation::EvidenceBeforeModification,
                format!(
                    "{failed_edits} failed edits on {file_path}. Must gather evidence before modifying."
                ),
                &[
                    "reproduce_reliably",
                    "narrow_scope",
                    "identify_discriminating_signal",
                    "create_minimal_reproduction",
                ],
                &[
                    "Add logging to understand the flow",
                    "Write a minimal test that fails",
                    "Isolate the specific line/function causing the issue",
                    "Document what you've tried and why it failed",
                ],
            );
        }

        GuardrailCheck::pass()
    }
}

/// Checks tool calls against the current phase's allowlist.
#[derive(Debug, Clone, Default)]
pub struct PhaseToolGuard;

impl PhaseToolGuard {
    /// Check whether the step's tool is permitted in the episode's phase.
    #[must_use]
    pub fn check(&self, episode: &Episode, step: &Step) -> GuardrailCheck {
        if step.action_kind != ActionKind::ToolCall {
            return GuardrailCheck::pass();
        }
        let tool = step.tool();
        if tool.is_empty() {
            return GuardrailCheck::pass();
        }
        if let Some(allowed) = phase_allowed_tools(episode.phase) {
            if !allowed.contains(&tool) {
                return GuardrailCheck {
                    passed: false,
                    violation: Some(GuardrailViolation::PhaseViolation),
                    message: format!(
                        "Action '{tool}' not allowed in phase '{}'.",
                        episode.phase
                    ),
                    required_actions: Vec::new(),
                    suggestions: vec![format!(
                        "Allowed actions in {}: {}",
                        episode.phase,
                        allowed.join(", ")
                    )],
                };
            }
        }
        GuardrailCheck::pass()
    }
}

/// Unified guardrail engine running all checks.
pub struct GuardrailEngine {
    risk: HighRiskToolGuard,
    evidence: EvidenceBeforeModificationGuard,
    phase: PhaseToolGuard,
}

impl GuardrailEngine {
    /// Create an engine; `safety_enabled` and `allow_secrets` come from the
    /// configuration snapshot.
    #[must_use]
    pub fn new(safety_enabled: bool, allow_secrets: bool) -> Self {
        Self {
            risk: HighRiskToolGuard {
                enabled: safety_enabled,
                allow_secrets,
            },
            evidence: EvidenceBeforeModificationGuard::default(),
            phase: PhaseToolGuard,
        }
    }

    /// Run all guardrail checks; returns the violations.
    #[must_use]
    pub fn check_all(
        &self,
        episode: &Episode,
        step: &Step,
        recent_steps: &[Step],
    ) -> Vec<GuardrailCheck> {
        let mut violations = Vec::new();
        for check in [
            self.risk.check(step),
            self.evidence.check(step, recent_steps),
            self.phase.check(episode, step),
        ] {
            if !check.passed {
                violations.push(check);
            }
        }
        violations
    }

    /// First violation, if any guardrail refuses the action.
    #[must_use]
    pub fn is_blocked(
        &self,
        episode: &Episode,
        step: &Step,
        recent_steps: &[Step],
    ) -> Option<GuardrailCheck> {
        self.check_all(episode, step, recent_steps).into_iter().next()
    }
}

fn extract_path(step: &Step) -> String {
    for key in ["file_path", "path"] {
        if let Some(value) = step.action_details.get(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn looks_like_secret_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/").to_lowercase();
    // Conservative: only the most common private-key / credential stores
    const NEEDLES: &[&str] = &[
        "/.ssh/id_rsa",
        "/.ssh/id_ed25519",
        "/.ssh/known_hosts",
        "/.aws/credentials",
        "/.aws/config",
        "/.gnupg/",
        "/.netrc",
    ];
    if NEEDLES.iter().any(|n| normalized.contains(n)) {
        return true;
    }
    [".pem", ".p12", ".pfx", ".key"]
        .iter()
        .any(|ext| normalized.ends_with(ext))
}

fn is_pipe_to_shell(command_lower: &str) -> bool {
    if !command_lower.contains('|') {
        return false;
    }
    const PIPE_TARGETS: &[&str] = &[" sh", " bash", " zsh", " powershell", " pwsh"];
    if ["curl ", "wget "].iter().any(|c| command_lower.contains(c)) {
        return PIPE_TARGETS.iter().any(|t| command_lower.contains(t));
    }
    // PowerShell IEX-style remote execution
    if command_lower.contains("powershell") || command_lower.contains("pwsh") {
        if command_lower.contains("invoke-expression") || command_lower.contains(" iex ") {
            return true;
        }
    }
    false
}

fn is_obviously_destructive(command_lower: &str) -> bool {
    // Linux/macOS nukes
    if command_lower.contains("rm -rf /") || command_lower.contains("rm -rf /*") {
        return true;
    }
    if command_lower.contains("rm -rf ~")
        || command_lower.contains("rm -rf $home")
        || command_lower.contains("rm -rf \"$home\"")
    {
        return true;
    }
    if command_lower.contains("mkfs")
        || (command_lower.contains("dd if=") && command_lower.contains("/dev/"))
    {
        return true;
    }
    if command_lower.contains(":(){ :|:& };:") {
        return true;
    }
    // Windows nukes
    if command_lower.contains("del /s /q c:\\") || command_lower.contains("del /s /q c:/") {
        return true;
    }
    if command_lower.starts_with("format ") || command_lower.contains(" format ") {
        return true;
    }
    if command_lower.contains("cipher /w") {
        return true;
    }
    false
}

fn has_diagnostic_evidence(recent_steps: &[Step]) -> bool {
    for step in recent_steps {
        if step.action_kind == ActionKind::Reasoning {
            let intent_lower = step.intent.to_lowercase();
            if DIAGNOSTIC_INTENTS.iter().any(|k| intent_lower.contains(k)) {
                return true;
            }
        }
        if step.lesson.len() > 50 {
            let lesson_lower = step.lesson.to_lowercase();
            if UNDERSTANDING_MARKERS.iter().any(|m| lesson_lower.contains(m)) {
                return true;
            }
        }
    }
    false
}
