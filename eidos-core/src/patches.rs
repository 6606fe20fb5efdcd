//! Policy-patch vocabulary.
//!
//! Patch evaluation is an external hook; the core only defines the
//! triggers, conditions, and actions it understands, plus the result record
//! the hook returns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Events a policy patch can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTrigger {
    /// An error signature crossed a count
    ErrorCount,
    /// The episode entered a phase
    PhaseEntry,
    /// A specific tool was used
    ToolUse,
    /// A file was touched
    FileTouch,
    /// Confidence dropped across steps
    ConfidenceDrop,
    /// A text pattern appeared in the step
    PatternMatch,
    /// The step count crossed a threshold
    StepCount,
}

/// Actions a policy patch can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchAction {
    /// Add advisory context to the next step
    InjectContext,
    /// Force a phase transition
    ForcePhase,
    /// Refuse a tool
    BlockTool,
    /// Demand a validation-only step
    RequireValidation,
    /// Append an episode constraint
    AddConstraint,
    /// Suggest an alternative approach
    SuggestApproach,
}

/// Result of one patch firing, returned by the external engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchResult {
    pub patch_id: String,
    pub trigger: PatchTrigger,
    pub action: PatchAction,
    /// Action parameters: phase name, tool name, injected text, ...
    pub params: HashMap<String, String>,
    pub message: String,
}
