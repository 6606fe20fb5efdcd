//! Step persistence: the decision-packet audit trail.

use eidos_core::step::{ActionKind, Evaluation, Step};
use eidos_core::{Error, Result};
use libsql::{params, Row};
use tracing::debug;

use crate::{from_json, from_unix, to_json, to_unix, EidosStore};

const STEP_COLUMNS: &str = "step_id, episode_id, trace_id, intent, decision, hypothesis, \
    alternatives, assumptions, prediction, stop_condition, confidence_before, \
    budget_snapshot, action_kind, action_details, result, validation_evidence, \
    evaluation, surprise_level, lesson, confidence_after, confidence_delta, \
    retrieved_memories, memory_cited, memory_useful, memory_absent_declared, \
    validated, validation_method, is_valid, evidence_gathered, progress_made, created_at";

impl EidosStore {
    /// Upsert a step by id. The same row is written twice per action: a
    /// preliminary pre-action version and the completed envelope.
    pub async fn store_step(&self, step: &Step) -> Result<String> {
        debug!(step_id = %step.step_id, "storing step");
        let conn = self.connect()?;
        let sql = format!(
            "INSERT OR REPLACE INTO steps ({STEP_COLUMNS}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        conn.execute(
            &sql,
            params![
                step.step_id.clone(),
                step.episode_id.clone(),
                step.trace_id.clone(),
                step.intent.clone(),
                step.decision.clone(),
                step.hypothesis.clone(),
                to_json(&step.alternatives)?,
                to_json(&step.assumptions)?,
                step.prediction.clone(),
                step.stop_condition.clone(),
                f64::from(step.confidence_before),
                to_json(&step.budget_snapshot)?,
                step.action_kind.to_string(),
                to_json(&step.action_details)?,
                step.result.clone(),
                step.validation_evidence.clone(),
                step.evaluation.to_string(),
                f64::from(step.surprise_level),
                step.lesson.clone(),
                f64::from(step.confidence_after),
                f64::from(step.confidence_delta),
                to_json(&step.retrieved_memories)?,
                i64::from(step.memory_cited),
                step.memory_useful.map(i64::from),
                i64::from(step.memory_absent_declared),
                i64::from(step.validated),
                step.validation_method.clone(),
                i64::from(step.is_valid),
                i64::from(step.evidence_gathered),
                i64::from(step.progress_made),
                to_unix(step.created_at),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to store step: {e}")))?;
        Ok(step.step_id.clone())
    }

    /// Fetch a step by id.
    pub async fn fetch_step(&self, step_id: &str) -> Result<Option<Step>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE step_id = ?");
        let mut rows = conn
            .query(&sql, params![step_id])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query step: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch step row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    /// All steps of an episode, ordered by creation time.
    pub async fn fetch_episode_steps(&self, episode_id: &str) -> Result<Vec<Step>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE episode_id = ? ORDER BY created_at"
        );
        self.collect_steps(conn.query(&sql, params![episode_id]).await)
            .await
    }

    /// Most recent steps across all episodes.
    pub async fn fetch_recent_steps(&self, limit: usize) -> Result<Vec<Step>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps ORDER BY created_at DESC LIMIT ?"
        );
        self.collect_steps(conn.query(&sql, params![limit as i64]).await)
            .await
    }

    async fn collect_steps(
        &self,
        rows: std::result::Result<libsql::Rows, libsql::Error>,
    ) -> Result<Vec<Step>> {
        let mut rows = rows.map_err(|e| Error::Storage(format!("Failed to query steps: {e}")))?;
        let mut steps = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch step row: {e}")))?
        {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }
}

fn row_to_step(row: &Row) -> Result<Step> {
    let get_text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read step column {idx}: {e}")))
    };
    let get_f64 = |idx: i32| -> Result<f64> {
        row.get::<f64>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read step column {idx}: {e}")))
    };
    let get_bool = |idx: i32| -> Result<bool> {
        row.get::<i64>(idx)
            .map(|v| v != 0)
            .map_err(|e| Error::Storage(format!("Failed to read step column {idx}: {e}")))
    };

    Ok(Step {
        step_id: get_text(0)?,
        episode_id: get_text(1)?,
        trace_id: row
            .get::<Option<String>>(2)
            .map_err(|e| Error::Storage(format!("Failed to read trace_id: {e}")))?,
        intent: get_text(3)?,
        decision: get_text(4)?,
        hypothesis: get_text(5)?,
        alternatives: from_json(&get_text(6)?),
        assumptions: from_json(&get_text(7)?),
        prediction: get_text(8)?,
        stop_condition: get_text(9)?,
        confidence_before: get_f64(10)? as f32,
        budget_snapshot: from_json(&get_text(11)?),
        action_kind: ActionKind::parse(&get_text(12)?),
        action_details: from_json(&get_text(13)?),
        result: get_text(14)?,
        validation_evidence: get_text(15)?,
        evaluation: Evaluation::parse(&get_text(16)?),
        surprise_level: get_f64(17)? as f32,
        lesson: get_text(18)?,
        confidence_after: get_f64(19)? as f32,
        confidence_delta: get_f64(20)? as f32,
        retrieved_memories: from_json(&get_text(21)?),
        memory_cited: get_bool(22)?,
        memory_useful: row
            .get::<Option<i64>>(23)
            .map_err(|e| Error::Storage(format!("Failed to read memory_useful: {e}")))?
            .map(|v| v != 0),
        memory_absent_declared: get_bool(24)?,
        validated: get_bool(25)?,
        validation_method: get_text(26)?,
        is_valid: get_bool(27)?,
        evidence_gathered: get_bool(28)?,
        progress_made: get_bool(29)?,
        created_at: from_unix(get_f64(30)?),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::test_support::store;
    use eidos_core::episode::{Budget, Episode};

    async fn seeded_episode(store: &EidosStore) -> Episode {
        let episode = Episode::new("Fix auth timeout", "", Budget::default());
        store.store_episode(&episode).await.unwrap();
        episode
    }

    fn full_step(episode_id: &str) -> Step {
        let mut step = Step::new(episode_id, "Run tests");
        step.decision = "pytest tests/test_auth.py".to_string();
        step.hypothesis = "expiry comparison is wrong".to_string();
        step.prediction = "tests pass".to_string();
        step.alternatives = vec!["skip the suite".to_string()];
        step.assumptions = vec!["venv is active".to_string()];
        step.trace_id = Some("trace-1".to_string());
        step.action_details
            .insert("tool".to_string(), "Bash".to_string());
        step.result = "3 passed".to_string();
        step.evaluation = Evaluation::Pass;
        step.validated = true;
        step.validation_method = "test:passed".to_string();
        step.memory_useful = Some(true);
        step
    }

    #[tokio::test]
    async fn test_step_round_trip_is_byte_equal() {
        let (_dir, store) = store().await;
        let episode = seeded_episode(&store).await;
        let step = full_step(&episode.episode_id);

        store.store_step(&step).await.unwrap();
        let first = store.fetch_step(&step.step_id).await.unwrap().unwrap();
        store.store_step(&first).await.unwrap();
        let second = store.fetch_step(&step.step_id).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(second, step);
    }

    #[tokio::test]
    async fn test_two_phase_write_upserts() {
        let (_dir, store) = store().await;
        let episode = seeded_episode(&store).await;

        // Preliminary row, pre-action
        let mut step = Step::new(&episode.episode_id, "Run tests");
        step.decision = "pytest".to_string();
        step.prediction = "pass".to_string();
        store.store_step(&step).await.unwrap();

        // Completed row, post-action
        step.result = "3 passed".to_string();
        step.evaluation = Evaluation::Pass;
        step.validated = true;
        store.store_step(&step).await.unwrap();

        let steps = store.fetch_episode_steps(&episode.episode_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].evaluation, Evaluation::Pass);
    }

    #[tokio::test]
    async fn test_episode_steps_ordered_by_creation() {
        let (_dir, store) = store().await;
        let episode = seeded_episode(&store).await;
        for i in 0..3 {
            let mut step = Step::new(&episode.episode_id, format!("step {i}"));
            step.decision = "d".to_string();
            step.prediction = "p".to_string();
            store.store_step(&step).await.unwrap();
        }
        let steps = store.fetch_episode_steps(&episode.episode_id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(steps[0].intent, "step 0");
    }
}
