//! [`EidosStorage`] trait wiring for the libSQL store.

use async_trait::async_trait;
use eidos_core::distillation::{Distillation, DistillationKind, Policy};
use eidos_core::episode::Episode;
use eidos_core::step::Step;
use eidos_core::storage::{ArchiveReport, EidosStorage, PurgeReport, StoreStats};
use eidos_core::Result;

use crate::EidosStore;

#[async_trait]
impl EidosStorage for EidosStore {
    async fn save_episode(&self, episode: &Episode) -> Result<String> {
        self.store_episode(episode).await
    }

    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>> {
        self.fetch_episode(episode_id).await
    }

    async fn get_recent_episodes(&self, limit: usize) -> Result<Vec<Episode>> {
        self.fetch_recent_episodes(limit).await
    }

    async fn save_step(&self, step: &Step) -> Result<String> {
        self.store_step(step).await
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>> {
        self.fetch_step(step_id).await
    }

    async fn get_episode_steps(&self, episode_id: &str) -> Result<Vec<Step>> {
        self.fetch_episode_steps(episode_id).await
    }

    async fn get_recent_steps(&self, limit: usize) -> Result<Vec<Step>> {
        self.fetch_recent_steps(limit).await
    }

    async fn save_distillation(&self, distillation: &Distillation) -> Result<String> {
        self.store_distillation(distillation).await
    }

    async fn get_distillation(&self, distillation_id: &str) -> Result<Option<Distillation>> {
        self.fetch_distillation(distillation_id).await
    }

    async fn get_distillations_by_kind(
        &self,
        kind: DistillationKind,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        self.fetch_distillations_by_kind(kind, limit).await
    }

    async fn get_distillations_by_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        self.fetch_distillations_by_domain(domain, limit).await
    }

    async fn get_distillations_by_trigger(
        &self,
        trigger: &str,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        self.fetch_distillations_by_trigger(trigger, limit).await
    }

    async fn get_high_confidence_distillations(
        &self,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        self.fetch_high_confidence(min_confidence, limit).await
    }

    async fn get_distillations_for_revalidation(&self) -> Result<Vec<Distillation>> {
        self.fetch_due_for_revalidation().await
    }

    async fn get_all_distillations(&self, limit: usize) -> Result<Vec<Distillation>> {
        self.fetch_all_distillations(limit).await
    }

    async fn record_distillation_retrieval(&self, distillation_id: &str) -> Result<()> {
        self.bump_retrieval(distillation_id).await
    }

    async fn record_distillation_usage(&self, distillation_id: &str, helped: bool) -> Result<()> {
        self.bump_usage(distillation_id, helped).await
    }

    async fn archive_and_purge_low_quality_distillations(
        &self,
        floor: f32,
        dry_run: bool,
    ) -> Result<ArchiveReport> {
        self.archive_and_purge_low_quality(floor, dry_run).await
    }

    async fn purge_telemetry_distillations(&self, dry_run: bool) -> Result<PurgeReport> {
        self.purge_telemetry(dry_run).await
    }

    async fn save_policy(&self, policy: &Policy) -> Result<String> {
        self.store_policy(policy).await
    }

    async fn get_policies_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Policy>> {
        self.fetch_policies_by_scope(scope, limit).await
    }

    async fn get_all_policies(&self) -> Result<Vec<Policy>> {
        self.fetch_all_policies().await
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        self.stats().await
    }
}
