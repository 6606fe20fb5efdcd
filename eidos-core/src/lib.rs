#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::float_cmp)]

//! # EIDOS Core
//!
//! Core intelligence layers for EIDOS ("Explicit Intelligence with Durable
//! Outcomes & Semantics"), a meta-learning substrate that sits beside an
//! LLM-driven coding agent. The substrate forces a disciplined
//! predict → act → evaluate → distill loop, detects loss of progress, and
//! crystallizes reusable rules from episodic experience.
//!
//! ## Core Concepts
//!
//! - **Episodes**: Bounded learning units with goals, budgets, and phases
//! - **Steps**: Decision packets carrying prediction → outcome → evaluation
//! - **Distillations**: Reusable rules extracted from experience
//! - **Policies**: Operating constraints with scope and priority
//! - **Evidence**: Ephemeral proof artifacts with kind-based retention
//!
//! ## The Vertical Loop
//!
//! Action → Prediction → Outcome → Evaluation → Policy Update →
//! Distillation → Mandatory Reuse
//!
//! ## Module Organization
//!
//! ### Primary APIs
//! - [`session`]: [`session::EidosContext`] and the collaborator API the
//!   hook shim calls
//! - [`control`]: the control plane enforcing envelopes, watchers, and
//!   phase transitions
//! - [`retriever`]: type-prioritized structural retrieval of distillations
//! - [`engine`]: post-episode reflection and rule extraction
//!
//! ### Support Modules
//! - [`episode`], [`step`], [`distillation`], [`evidence`], [`phase`]:
//!   the typed entities
//! - [`gate`]: the memory gate deciding what earns persistence
//! - [`watchers`]: the nine loss-of-progress detectors
//! - [`guardrails`]: hard gates — safety, evidence before modification,
//!   and the per-phase tool allowlist
//! - [`acceptance`]: the definition-of-done compiler gating the execute
//!   phase
//! - [`escape`]: the deterministic recovery routine
//! - [`escalation`]: structured documents for asking the user for help
//! - [`storage`]: async traits the storage crates implement
//! - [`config`]: the externally-managed tuneables snapshot
//! - [`state_files`]: atomic flat-file session state
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use eidos_core::config::EidosConfig;
//! use eidos_core::session::EidosContext;
//! use eidos_core::state_files::StateFiles;
//! # use eidos_core::storage::{EidosStorage, EvidenceStorage};
//!
//! # async fn example(store: Arc<dyn EidosStorage>, evidence: Arc<dyn EvidenceStorage>) -> eidos_core::Result<()> {
//! let state = StateFiles::new("/tmp/eidos-state")?;
//! let ctx = EidosContext::new(EidosConfig::default(), store, evidence, state);
//!
//! // Pre-action: open an episode and a step envelope
//! let mut input = HashMap::new();
//! input.insert("command".to_string(), "cargo test".to_string());
//! let (step, decision) = ctx
//!     .create_step_before_action("session-1", "Bash", &input, "tests pass", None)
//!     .await?;
//! assert!(decision.allowed);
//!
//! // Post-action: complete the envelope with the observed outcome
//! ctx.complete_step_after_action("session-1", "Bash", true, "ok: 42 passed", None)
//!     .await?;
//!
//! // Session end: close and distill
//! ctx.complete_episode("session-1", None, None).await?;
//! # let _ = step;
//! # Ok(())
//! # }
//! ```

pub mod acceptance;
pub mod config;
pub mod control;
pub mod distillation;
pub mod engine;
pub mod episode;
pub mod error;
pub mod escalation;
pub mod escape;
pub mod evidence;
pub mod gate;
pub mod guardrails;
pub mod ids;
pub mod patches;
pub mod phase;
pub mod retriever;
pub mod session;
pub mod state_files;
pub mod step;
pub mod storage;
pub mod validation;
pub mod watchers;

// Re-export commonly used types
pub use acceptance::{
    AcceptanceCompiler, AcceptanceKind, AcceptancePlan, AcceptanceStatus, AcceptanceTest,
    ExecuteReadiness,
};
pub use config::{EidosConfig, ReloadReport};
pub use control::{
    error_signature, validate_step_envelope, ControlDecision, ControlPlane, EnvelopeCheck,
};
pub use guardrails::{
    phase_allowed_tools, GuardrailCheck, GuardrailEngine, GuardrailViolation,
};
pub use distillation::{
    normalize_statement, AdvisoryQuality, Distillation, DistillationKind, Policy, PolicyScope,
    PolicySource,
};
pub use engine::{
    is_quality_distillation, DistillationCandidate, DistillationEngine, ReflectionResult,
};
pub use episode::{Budget, Episode, Outcome};
pub use error::{Error, Result};
pub use escalation::{build_escalation, Escalation, EscalationKind, RequestKind};
pub use escape::{generalize_failed_decision, EscapeProtocol, EscapeProtocolResult};
pub use evidence::{Evidence, EvidenceKind};
pub use gate::{score_step_importance, GateScore, GateWeights, MemoryGate};
pub use patches::{PatchAction, PatchResult, PatchTrigger};
pub use phase::Phase;
pub use retriever::StructuralRetriever;
pub use session::{AdvisoryRoast, EidosContext, EidosHealth, RoastVerdict};
pub use state_files::{StateFiles, StepHandoff};
pub use step::{ActionKind, BudgetSnapshot, Evaluation, Step};
pub use storage::{
    ArchiveReport, EidosStorage, EvidenceStats, EvidenceStorage, PurgeReport, StoreStats,
};
pub use validation::{validate_step, ValidationOutcome};
pub use watchers::{Severity, WatcherAlert, WatcherEngine, WatcherTag};
