//! Ephemeral evidence artifacts bound to steps.
//!
//! Tool logs are not memory. They are temporary proof artifacts with
//! kind-based retention, kept only long enough to audit and validate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{derive_id, now_micros};

/// Kinds of evidence that can be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// stdout/stderr from a tool (72h)
    ToolOutput,
    /// File changes made (7d)
    Diff,
    /// Test pass/fail details (7d)
    TestResult,
    /// Compile/build output (7d)
    BuildLog,
    /// Stack traces, errors (7d)
    ErrorTrace,
    /// Deployment logs (30d)
    DeployArtifact,
    /// Auth, access, secrets (90d)
    SecurityEvent,
    /// Explicitly flagged important (permanent)
    UserFlagged,
}

impl EvidenceKind {
    /// Default retention; `None` means permanent.
    #[must_use]
    pub fn retention(self) -> Option<Duration> {
        match self {
            EvidenceKind::ToolOutput => Some(Duration::hours(72)),
            EvidenceKind::Diff
            | EvidenceKind::TestResult
            | EvidenceKind::BuildLog
            | EvidenceKind::ErrorTrace => Some(Duration::days(7)),
            EvidenceKind::DeployArtifact => Some(Duration::days(30)),
            EvidenceKind::SecurityEvent => Some(Duration::days(90)),
            EvidenceKind::UserFlagged => None,
        }
    }

    /// Parse the snake_case wire value, falling back to `ToolOutput`.
    #[must_use]
    pub fn parse(value: &str) -> EvidenceKind {
        match value {
            "diff" => EvidenceKind::Diff,
            "test_result" => EvidenceKind::TestResult,
            "build_log" => EvidenceKind::BuildLog,
            "error_trace" => EvidenceKind::ErrorTrace,
            "deploy_artifact" => EvidenceKind::DeployArtifact,
            "security_event" => EvidenceKind::SecurityEvent,
            "user_flagged" => EvidenceKind::UserFlagged,
            _ => EvidenceKind::ToolOutput,
        }
    }

    /// Detect the evidence kind from tool name and output content.
    #[must_use]
    pub fn detect(tool_name: &str, content: &str) -> EvidenceKind {
        let tool_lower = tool_name.to_lowercase();
        if tool_lower.contains("test") {
            EvidenceKind::TestResult
        } else if tool_lower.contains("build") || tool_lower.contains("compile") {
            EvidenceKind::BuildLog
        } else if tool_lower.contains("deploy") {
            EvidenceKind::DeployArtifact
        } else if tool_lower.contains("security") || tool_lower.contains("auth") {
            EvidenceKind::SecurityEvent
        } else if tool_name == "Edit" || tool_name == "Write" {
            EvidenceKind::Diff
        } else {
            let content_lower = content.to_lowercase();
            if content_lower.contains("error") || content_lower.contains("traceback") {
                EvidenceKind::ErrorTrace
            } else {
                EvidenceKind::ToolOutput
            }
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            EvidenceKind::ToolOutput => "tool_output",
            EvidenceKind::Diff => "diff",
            EvidenceKind::TestResult => "test_result",
            EvidenceKind::BuildLog => "build_log",
            EvidenceKind::ErrorTrace => "error_trace",
            EvidenceKind::DeployArtifact => "deploy_artifact",
            EvidenceKind::SecurityEvent => "security_event",
            EvidenceKind::UserFlagged => "user_flagged",
        };
        write!(f, "{value}")
    }
}

/// Evidence artifact linked to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Opaque 12-hex id
    pub evidence_id: String,
    /// The step this artifact proves something about
    pub step_id: String,
    pub kind: EvidenceKind,
    pub tool_name: String,

    /// Raw content (decompressed view)
    pub content: String,
    /// Content digest for dedup/audit
    pub content_hash: String,
    /// Stored byte size (post-compression when compressed)
    pub byte_size: usize,
    pub compressed: bool,

    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    /// Expiry; `None` means pinned/permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub retention_reason: String,
}

impl Evidence {
    /// Create evidence for a step with the kind's default retention.
    pub fn new(step_id: impl Into<String>, kind: EvidenceKind, content: impl Into<String>) -> Self {
        let step_id = step_id.into();
        let content = content.into();
        let created_at = now_micros();
        let evidence_id = derive_id(&format!(
            "{}:{}:{}",
            step_id,
            kind,
            created_at.timestamp_micros()
        ));
        let content_hash = {
            let digest = Sha256::digest(content.as_bytes());
            let mut hex = String::with_capacity(16);
            for byte in digest.iter().take(8) {
                use std::fmt::Write;
                let _ = write!(hex, "{byte:02x}");
            }
            hex
        };
        let byte_size = content.len();
        Self {
            evidence_id,
            step_id,
            kind,
            tool_name: String::new(),
            content,
            content_hash,
            byte_size,
            compressed: false,
            exit_code: None,
            duration_ms: None,
            created_at,
            expires_at: kind.retention().map(|r| created_at + r),
            retention_reason: String::new(),
        }
    }

    /// Create evidence from tool output, auto-detecting the kind.
    pub fn from_tool_output(
        step_id: impl Into<String>,
        tool_name: &str,
        output: impl Into<String>,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
    ) -> Self {
        let output = output.into();
        let kind = EvidenceKind::detect(tool_name, &output);
        let mut evidence = Evidence::new(step_id, kind, output);
        evidence.tool_name = tool_name.to_string();
        evidence.exit_code = exit_code;
        evidence.duration_ms = duration_ms;
        evidence
    }

    /// Whether this evidence has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_policy_by_kind() {
        assert_eq!(
            EvidenceKind::ToolOutput.retention(),
            Some(Duration::hours(72))
        );
        assert_eq!(EvidenceKind::Diff.retention(), Some(Duration::days(7)));
        assert_eq!(
            EvidenceKind::DeployArtifact.retention(),
            Some(Duration::days(30))
        );
        assert_eq!(
            EvidenceKind::SecurityEvent.retention(),
            Some(Duration::days(90))
        );
        assert_eq!(EvidenceKind::UserFlagged.retention(), None);
    }

    #[test]
    fn test_kind_detection() {
        assert_eq!(
            EvidenceKind::detect("RunTests", "3 passed"),
            EvidenceKind::TestResult
        );
        assert_eq!(
            EvidenceKind::detect("cargo-build", "Compiling"),
            EvidenceKind::BuildLog
        );
        assert_eq!(
            EvidenceKind::detect("deploy_service", "rolled out"),
            EvidenceKind::DeployArtifact
        );
        assert_eq!(
            EvidenceKind::detect("auth_check", "ok"),
            EvidenceKind::SecurityEvent
        );
        assert_eq!(EvidenceKind::detect("Edit", "patched"), EvidenceKind::Diff);
        assert_eq!(
            EvidenceKind::detect("Bash", "Traceback (most recent call last)"),
            EvidenceKind::ErrorTrace
        );
        assert_eq!(
            EvidenceKind::detect("Bash", "listing complete"),
            EvidenceKind::ToolOutput
        );
    }

    #[test]
    fn test_user_flagged_never_expires() {
        let evidence = Evidence::new("step000000001", EvidenceKind::UserFlagged, "important");
        assert!(evidence.expires_at.is_none());
        assert!(!evidence.is_expired(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_expiry_set_from_retention() {
        let evidence = Evidence::new("step000000001", EvidenceKind::ToolOutput, "ls output");
        let expires = evidence.expires_at.unwrap();
        assert_eq!((expires - evidence.created_at).num_hours(), 72);
        assert!(!evidence.is_expired(Utc::now()));
        assert!(evidence.is_expired(Utc::now() + Duration::hours(73)));
    }

    #[test]
    fn test_content_hash_stability() {
        let a = Evidence::new("step000000001", EvidenceKind::ToolOutput, "same");
        let b = Evidence::new("step000000002", EvidenceKind::ToolOutput, "same");
        assert_eq!(a.content_hash, b.content_hash);
    }
}
