//! Episode persistence for the canonical store.

use eidos_core::episode::{Budget, Episode, Outcome};
use eidos_core::phase::Phase;
use eidos_core::{Error, Result};
use libsql::{params, Row};
use tracing::debug;

use crate::{from_json, from_unix, to_json, to_unix, EidosStore};

const EPISODE_COLUMNS: &str = "episode_id, goal, success_criteria, constraints, \
    budget_max_steps, budget_max_time_seconds, budget_max_retries, \
    budget_max_file_touches, budget_no_evidence_limit, \
    phase, outcome, final_evaluation, start_ts, end_ts, step_count, \
    error_counts, file_touch_counts, no_evidence_streak, confidence_history, \
    stuck_count, escape_protocol_triggered";

impl EidosStore {
    /// Upsert an episode by id.
    pub async fn store_episode(&self, episode: &Episode) -> Result<String> {
        debug!(episode_id = %episode.episode_id, "storing episode");
        let conn = self.connect()?;
        let sql = format!(
            "INSERT OR REPLACE INTO episodes ({EPISODE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        conn.execute(
            &sql,
            params![
                episode.episode_id.clone(),
                episode.goal.clone(),
                episode.success_criteria.clone(),
                to_json(&episode.constraints)?,
                i64::from(episode.budget.max_steps),
                episode.budget.max_time_seconds as i64,
                i64::from(episode.budget.max_retries_per_error),
                i64::from(episode.budget.max_file_touches),
                i64::from(episode.budget.no_evidence_limit),
                episode.phase.to_string(),
                episode.outcome.to_string(),
                episode.final_evaluation.clone(),
                to_unix(episode.start_ts),
                episode.end_ts.map(to_unix),
                i64::from(episode.step_count),
                to_json(&episode.error_counts)?,
                to_json(&episode.file_touch_counts)?,
                i64::from(episode.no_evidence_streak),
                to_json(&episode.confidence_history)?,
                i64::from(episode.stuck_count),
                i64::from(episode.escape_protocol_triggered),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to store episode: {e}")))?;
        Ok(episode.episode_id.clone())
    }

    /// Fetch an episode by id.
    pub async fn fetch_episode(&self, episode_id: &str) -> Result<Option<Episode>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE episode_id = ?");
        let mut rows = conn
            .query(&sql, params![episode_id])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query episode: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch episode row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_episode(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent episodes by start time.
    pub async fn fetch_recent_episodes(&self, limit: usize) -> Result<Vec<Episode>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes ORDER BY start_ts DESC LIMIT ?"
        );
        let mut rows = conn
            .query(&sql, params![limit as i64])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query episodes: {e}")))?;
        let mut episodes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch episode row: {e}")))?
        {
            episodes.push(row_to_episode(&row)?);
        }
        Ok(episodes)
    }
}

fn row_to_episode(row: &Row) -> Result<Episode> {
    let get_text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read episode column {idx}: {e}")))
    };
    let get_i64 = |idx: i32| -> Result<i64> {
        row.get::<i64>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read episode column {idx}: {e}")))
    };
    let get_f64 = |idx: i32| -> Result<f64> {
        row.get::<f64>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read episode column {idx}: {e}")))
    };

    let phase_raw = get_text(9)?;
    Ok(Episode {
        episode_id: get_text(0)?,
        goal: get_text(1)?,
        success_criteria: get_text(2)?,
        constraints: from_json(&get_text(3)?),
        budget: Budget {
            max_steps: get_i64(4)? as u32,
            max_time_seconds: get_i64(5)? as u64,
            max_retries_per_error: get_i64(6)? as u32,
            max_file_touches: get_i64(7)? as u32,
            no_evidence_limit: get_i64(8)? as u32,
        },
        phase: Phase::parse(&phase_raw).unwrap_or(Phase::Explore),
        outcome: Outcome::parse(&get_text(10)?),
        final_evaluation: get_text(11)?,
        start_ts: from_unix(get_f64(12)?),
        end_ts: row
            .get::<Option<f64>>(13)
            .map_err(|e| Error::Storage(format!("Failed to read end_ts: {e}")))?
            .map(from_unix),
        step_count: get_i64(14)? as u32,
        error_counts: from_json(&get_text(15)?),
        file_touch_counts: from_json(&get_text(16)?),
        no_evidence_streak: get_i64(17)? as u32,
        confidence_history: from_json(&get_text(18)?),
        stuck_count: get_i64(19)? as u32,
        escape_protocol_triggered: get_i64(20)? != 0,
    })
}
