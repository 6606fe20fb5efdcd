//! Storage abstraction for the canonical store and the evidence store.
//!
//! The core layers (retriever, control plane, distillation engine, session
//! API) depend only on these traits; the libSQL implementation lives in its
//! own crate. All operations are async and open short-lived connections per
//! call, so readers never observe partial upserts.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::distillation::{Distillation, DistillationKind, Policy};
use crate::episode::Episode;
use crate::error::Result;
use crate::evidence::{Evidence, EvidenceKind};
use crate::step::Step;

/// Counts and ratios reported by the canonical store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub episodes: u64,
    pub steps: u64,
    pub distillations: u64,
    pub policies: u64,
    pub success_rate: f32,
    pub high_confidence_distillations: u64,
}

/// Result of an archive-and-purge pass over low-quality distillations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveReport {
    pub scanned: u64,
    pub archived: u64,
    pub kept: u64,
    pub dry_run: bool,
    /// archive_reason strings for the archived rows
    pub reasons: Vec<String>,
}

/// Result of a telemetry purge pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    pub scanned: u64,
    pub removed: u64,
    pub preview: Vec<String>,
    pub dry_run: bool,
}

/// Canonical relational persistence for EIDOS intelligence primitives.
#[async_trait]
pub trait EidosStorage: Send + Sync {
    // Episodes
    /// Upsert an episode by id.
    async fn save_episode(&self, episode: &Episode) -> Result<String>;
    /// Fetch an episode by id.
    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>>;
    /// Most recent episodes by start time.
    async fn get_recent_episodes(&self, limit: usize) -> Result<Vec<Episode>>;

    // Steps
    /// Upsert a step by id; tolerant of the pre/post two-phase write.
    async fn save_step(&self, step: &Step) -> Result<String>;
    /// Fetch a step by id.
    async fn get_step(&self, step_id: &str) -> Result<Option<Step>>;
    /// All steps of an episode, ordered by creation time.
    async fn get_episode_steps(&self, episode_id: &str) -> Result<Vec<Step>>;
    /// Most recent steps across all episodes.
    async fn get_recent_steps(&self, limit: usize) -> Result<Vec<Step>>;

    // Distillations
    /// Save a distillation with statement-normalized deduplication.
    ///
    /// If a row with the same normalized statement exists, its counters are
    /// summed, its domains/triggers/source steps unioned, the higher
    /// confidence kept, and the existing id returned.
    async fn save_distillation(&self, distillation: &Distillation) -> Result<String>;
    /// Fetch a distillation by id.
    async fn get_distillation(&self, distillation_id: &str) -> Result<Option<Distillation>>;
    /// Distillations of one kind, ordered by (confidence desc, helped desc).
    async fn get_distillations_by_kind(
        &self,
        kind: DistillationKind,
        limit: usize,
    ) -> Result<Vec<Distillation>>;
    /// Distillations whose domains mention `domain`.
    async fn get_distillations_by_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<Distillation>>;
    /// Distillations whose triggers mention `trigger`.
    async fn get_distillations_by_trigger(
        &self,
        trigger: &str,
        limit: usize,
    ) -> Result<Vec<Distillation>>;
    /// Distillations at or above a confidence floor.
    async fn get_high_confidence_distillations(
        &self,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Distillation>>;
    /// Distillations whose revalidate_by deadline has passed.
    async fn get_distillations_for_revalidation(&self) -> Result<Vec<Distillation>>;
    /// All distillations, ordered by (confidence desc, helped desc).
    async fn get_all_distillations(&self, limit: usize) -> Result<Vec<Distillation>>;
    /// Atomic times_retrieved increment.
    async fn record_distillation_retrieval(&self, distillation_id: &str) -> Result<()>;
    /// Atomic usage feedback: helped raises confidence (+0.05) and
    /// validation counters; unhelped lowers it (−0.1) and contradiction
    /// counters; high-contradiction rules decay an extra −0.15.
    async fn record_distillation_usage(&self, distillation_id: &str, helped: bool) -> Result<()>;
    /// Archive rows whose stored advisory score is below `floor` or whose
    /// suppressed flag is set, then delete them from the active table.
    async fn archive_and_purge_low_quality_distillations(
        &self,
        floor: f32,
        dry_run: bool,
    ) -> Result<ArchiveReport>;
    /// Delete telemetry-shaped statements (success-rate strings, sequence
    /// arrows, per-uses counters).
    async fn purge_telemetry_distillations(&self, dry_run: bool) -> Result<PurgeReport>;

    // Policies
    /// Upsert a policy by id.
    async fn save_policy(&self, policy: &Policy) -> Result<String>;
    /// Policies of one scope, ordered by priority desc.
    async fn get_policies_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Policy>>;
    /// All policies, ordered by priority desc.
    async fn get_all_policies(&self) -> Result<Vec<Policy>>;

    /// Store statistics for observability.
    async fn get_stats(&self) -> Result<StoreStats>;
}

/// Per-kind evidence statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceStats {
    pub total_items: u64,
    pub total_bytes: u64,
    pub by_kind: HashMap<String, (u64, u64)>,
    pub expiring_in_24h: u64,
    pub permanent: u64,
}

/// Ephemeral audit persistence for evidence artifacts.
#[async_trait]
pub trait EvidenceStorage: Send + Sync {
    /// Save evidence; content at or above `compress_threshold` bytes is
    /// stored compressed.
    async fn save(&self, evidence: &Evidence, compress_threshold: usize) -> Result<String>;
    /// Fetch (and transparently decompress) evidence by id.
    async fn get(&self, evidence_id: &str) -> Result<Option<Evidence>>;
    /// All evidence for a step, ordered by creation time.
    async fn get_for_step(&self, step_id: &str) -> Result<Vec<Evidence>>;
    /// Recent evidence of one kind.
    async fn get_by_kind(&self, kind: EvidenceKind, limit: usize) -> Result<Vec<Evidence>>;
    /// Pin evidence: removes the expiry.
    async fn flag_permanent(&self, evidence_id: &str, reason: &str) -> Result<()>;
    /// Push the expiry out by `additional_seconds`.
    async fn extend_retention(
        &self,
        evidence_id: &str,
        additional_seconds: u64,
        reason: &str,
    ) -> Result<()>;
    /// Delete expired evidence; returns the number of rows removed.
    async fn cleanup_expired(&self) -> Result<u64>;
    /// Storage statistics.
    async fn get_stats(&self) -> Result<EvidenceStats>;
}
