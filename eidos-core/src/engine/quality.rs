//! Quality gate for candidate distillations.
//!
//! A rule that restates its own trigger, echoes a tool name, or encodes
//! telemetry is worse than no rule: it pollutes retrieval. Every candidate
//! must clear these checks before finalization.

use crate::distillation::DistillationKind;

/// Phrases that add no information beyond "something went wrong".
const TAUTOLOGY_PHRASES: &[&str] = &[
    "try a different approach",
    "step back and reconsider",
    "try something else",
    "try another approach",
    "consider alternatives",
    "without progress",
    "when repeated",
    "always validate assumptions",
    "always verify",
    "be careful when",
];

/// Telemetry shapes that leak counters into rule text.
const PRIMITIVE_PATTERNS: &[&str] = &[
    "success rate",
    "use approach:",
    "for similar requests",
    "session in unknown",
];

/// Filler words removed before counting meaningful tokens.
const FILLER_WORDS: &[&str] = &[
    "when", "try", "use", "tool", "execute", "run", "command", "the", "a", "an", "to", "for",
    "with", "then", "and", "or", "on", "in", "of", "playbook",
];

/// Host-agent tool names; a statement made only of these teaches nothing.
const TOOL_NAMES: &[&str] = &[
    "read",
    "write",
    "edit",
    "bash",
    "glob",
    "grep",
    "task",
    "notebookedit",
    "websearch",
    "webfetch",
    "askuser",
];

/// Decide whether a candidate statement is worth keeping.
#[must_use]
pub fn is_quality_distillation(statement: &str, kind: DistillationKind) -> bool {
    let trimmed = statement.trim();
    if trimmed.len() < 20 {
        return false;
    }
    let lower = trimmed.to_lowercase();

    if TAUTOLOGY_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if PRIMITIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if has_over_n_uses(&lower) || has_n_successes(&lower) {
        return false;
    }
    if lower.contains("sequence") && trimmed.contains("->") {
        return false;
    }

    // "When X, try: Y" where X ≈ Y teaches nothing
    if let Some((condition, action)) = split_condition_action(&lower) {
        if word_overlap_ratio(&condition, &action) > 0.6 {
            return false;
        }
        if is_command_echo(&condition, &action) {
            return false;
        }
    }

    // Statements that are mostly paths are provenance, not rules
    let path_chars = trimmed
        .chars()
        .filter(|c| matches!(c, '\\' | '/' | ':' | '.'))
        .count();
    if path_chars * 10 > trimmed.len() * 3 {
        return false;
    }

    // Tool-name echo and mechanical playbooks
    let meaningful = meaningful_token_count(&lower);
    if meaningful == 0 {
        return false;
    }
    if kind == DistillationKind::Playbook && meaningful < 3 {
        return false;
    }

    true
}

fn split_condition_action(lower: &str) -> Option<(String, String)> {
    let when_idx = lower.find("when ")?;
    let try_idx = lower.find("try:")?;
    if try_idx <= when_idx {
        return None;
    }
    let condition = lower[when_idx + 5..try_idx]
        .trim_end_matches([',', ' '])
        .to_string();
    let action = lower[try_idx + 4..].trim().to_string();
    Some((condition, action))
}

fn word_overlap_ratio(a: &str, b: &str) -> f32 {
    let words_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let words_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let overlap = words_a.intersection(&words_b).count() as f32;
    overlap / words_a.len().max(words_b.len()) as f32
}

/// Condition/action pairs that carry the same command payload under
/// different prefixes ("Run command: x" vs "Execute: x") are echoes.
fn is_command_echo(condition: &str, action: &str) -> bool {
    let payload_condition = strip_action_prefix(condition);
    let payload_action = strip_action_prefix(action);

    let flat_condition = alnum_only(&payload_condition);
    let flat_action = alnum_only(&payload_action);
    if flat_condition.is_empty() || flat_action.is_empty() {
        return false;
    }
    if flat_condition == flat_action
        || flat_condition.contains(&flat_action)
        || flat_action.contains(&flat_condition)
    {
        return true;
    }

    // Token-level comparison on substantial tokens only
    let tokens = |text: &str| -> std::collections::HashSet<String> {
        text.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() >= 3)
            .map(ToString::to_string)
            .collect()
    };
    let t_condition = tokens(&payload_condition);
    let t_action = tokens(&payload_action);
    if t_condition.is_empty() || t_action.is_empty() {
        return false;
    }
    let overlap = t_condition.intersection(&t_action).count() as f32;
    overlap / t_condition.len().max(t_action.len()) as f32 > 0.6
}

fn strip_action_prefix(text: &str) -> String {
    let mut result = text.trim();
    for prefix in [
        "run command:",
        "run command",
        "execute:",
        "execute",
        "modify",
        "inspect",
        "use",
        "run:",
        "run",
    ] {
        if let Some(stripped) = result.strip_prefix(prefix) {
            result = stripped.trim_start();
            break;
        }
    }
    result.to_string()
}

fn alnum_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_alphanumeric).collect()
}

fn meaningful_token_count(lower: &str) -> usize {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| t.chars().any(|c| c.is_ascii_alphabetic()))
        .filter(|t| !FILLER_WORDS.contains(t))
        .filter(|t| !TOOL_NAMES.contains(t))
        .count()
}

/// Matches "over N uses" for any digit run.
fn has_over_n_uses(lower: &str) -> bool {
    let mut rest = lower;
    while let Some(idx) = rest.find("over ") {
        let tail = &rest[idx + 5..];
        let digits = tail.chars().take_while(char::is_ascii_digit).count();
        if digits > 0 && tail[digits..].trim_start().starts_with("uses") {
            return true;
        }
        rest = &rest[idx + 5..];
    }
    false
}

/// Matches "(N successes)" counters.
fn has_n_successes(lower: &str) -> bool {
    let mut rest = lower;
    while let Some(idx) = rest.find('(') {
        let tail = &rest[idx + 1..];
        let digits = tail.chars().take_while(char::is_ascii_digit).count();
        if digits > 0 && tail[digits..].trim_start().starts_with("successes)") {
            return true;
        }
        rest = tail;
    }
    false
}
