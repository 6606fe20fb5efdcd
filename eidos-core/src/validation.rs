//! Step validation: every step must be verifiable.
//!
//! A step without validation is not a learning unit. Validation methods are
//! coded strings ("test:passed", "build:failed", ...) so that external
//! tooling can classify them; a validation may also be deferred with a
//! reason, each reason carrying a maximum wait.

use crate::step::Step;

/// Maximum deferral in seconds per reason.
pub const DEFERRAL_LIMITS: &[(&str, u64)] = &[
    ("needs_deploy", 24 * 3600),
    ("needs_data", 48 * 3600),
    ("needs_human", 72 * 3600),
    ("async_process", 4 * 3600),
];

/// Default maximum deferral when the reason is unrecognized.
pub const DEFAULT_MAX_DEFERRAL: u64 = 24 * 3600;

/// Result of validating a step's validation contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub method: String,
    pub deferred: bool,
    pub deferral_reason: String,
    pub max_wait_seconds: u64,
    pub error: String,
}

/// Validate that a step carries validation, explicit or deferred-with-reason.
#[must_use]
pub fn validate_step(step: &Step) -> ValidationOutcome {
    // Case 1: explicit validation
    if step.validated && !step.validation_method.is_empty() {
        return ValidationOutcome {
            valid: true,
            method: step.validation_method.clone(),
            ..ValidationOutcome::default()
        };
    }

    // Case 2: deferred with a reason
    if let Some(reason) = step.validation_method.strip_prefix("deferred:") {
        let reason = reason.trim();
        if reason.is_empty() {
            return ValidationOutcome {
                valid: false,
                error: "Deferred validation requires reason".to_string(),
                ..ValidationOutcome::default()
            };
        }
        return ValidationOutcome {
            valid: true,
            method: step.validation_method.clone(),
            deferred: true,
            deferral_reason: reason.to_string(),
            max_wait_seconds: max_deferral(reason),
            error: String::new(),
        };
    }

    // Case 3: no validation
    ValidationOutcome {
        valid: false,
        error: "Step must be validated or explicitly deferred with reason".to_string(),
        ..ValidationOutcome::default()
    }
}

/// Split a validation method into (code, detail).
#[must_use]
pub fn parse_validation_method(method: &str) -> (&str, &str) {
    method.split_once(':').unwrap_or((method, ""))
}

/// Whether a validation method indicates success.
#[must_use]
pub fn is_positive_validation(method: &str) -> bool {
    matches!(
        method.to_lowercase().as_str(),
        "test:passed"
            | "build:success"
            | "lint:clean"
            | "output:expected"
            | "error:resolved"
            | "manual:checked"
            | "manual:approved"
    )
}

/// Whether a validation method indicates failure.
#[must_use]
pub fn is_negative_validation(method: &str) -> bool {
    matches!(
        method.to_lowercase().as_str(),
        "test:failed" | "build:failed" | "lint:errors" | "output:unexpected" | "error:persists"
    )
}

/// Maximum wait for a deferral reason.
#[must_use]
pub fn max_deferral(reason: &str) -> u64 {
    DEFERRAL_LIMITS
        .iter()
        .find(|(r, _)| *r == reason)
        .map_or(DEFAULT_MAX_DEFERRAL, |(_, limit)| *limit)
}
