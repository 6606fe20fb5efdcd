//! Policy persistence and store statistics.

use eidos_core::distillation::{Policy, PolicyScope, PolicySource};
use eidos_core::storage::StoreStats;
use eidos_core::{Error, Result};
use libsql::{params, Row};

use crate::{from_unix, to_unix, EidosStore};

const POLICY_COLUMNS: &str = "policy_id, statement, scope, priority, source, created_at";

impl EidosStore {
    /// Upsert a policy by id.
    pub async fn store_policy(&self, policy: &Policy) -> Result<String> {
        let conn = self.connect()?;
        let sql = format!(
            "INSERT OR REPLACE INTO policies ({POLICY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        );
        conn.execute(
            &sql,
            params![
                policy.policy_id.clone(),
                policy.statement.clone(),
                policy.scope.to_string(),
                i64::from(policy.priority),
                policy.source.to_string(),
                to_unix(policy.created_at),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to store policy: {e}")))?;
        Ok(policy.policy_id.clone())
    }

    /// Policies of one scope, ordered by priority desc.
    pub async fn fetch_policies_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Policy>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM policies WHERE scope = ? \
             ORDER BY priority DESC LIMIT ?"
        );
        let mut rows = conn
            .query(&sql, params![scope, limit as i64])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query policies: {e}")))?;
        let mut policies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch policy row: {e}")))?
        {
            policies.push(row_to_policy(&row)?);
        }
        Ok(policies)
    }

    /// All policies, ordered by priority desc.
    pub async fn fetch_all_policies(&self) -> Result<Vec<Policy>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {POLICY_COLUMNS} FROM policies ORDER BY priority DESC");
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| Error::Storage(format!("Failed to query policies: {e}")))?;
        let mut policies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch policy row: {e}")))?
        {
            policies.push(row_to_policy(&row)?);
        }
        Ok(policies)
    }

    /// Store statistics for observability.
    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.connect()?;
        let episodes = count(&conn, "SELECT COUNT(*) FROM episodes").await?;
        let steps = count(&conn, "SELECT COUNT(*) FROM steps").await?;
        let distillations = count(&conn, "SELECT COUNT(*) FROM distillations").await?;
        let policies = count(&conn, "SELECT COUNT(*) FROM policies").await?;
        let successes = count(
            &conn,
            "SELECT COUNT(*) FROM episodes WHERE outcome = 'success'",
        )
        .await?;
        let high_confidence = count(
            &conn,
            "SELECT COUNT(*) FROM distillations WHERE confidence >= 0.7",
        )
        .await?;

        Ok(StoreStats {
            episodes,
            steps,
            distillations,
            policies,
            success_rate: if episodes > 0 {
                successes as f32 / episodes as f32
            } else {
                0.0
            },
            high_confidence_distillations: high_confidence,
        })
    }
}

async fn count(conn: &libsql::Connection, sql: &str) -> Result<u64> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| Error::Storage(format!("Failed to count: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch count: {e}")))?
        .ok_or_else(|| Error::Storage("count query returned no row".to_string()))?;
    let value = row
        .get::<i64>(0)
        .map_err(|e| Error::Storage(format!("Failed to read count: {e}")))?;
    Ok(value as u64)
}

fn row_to_policy(row: &Row) -> Result<Policy> {
    let get_text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read policy column {idx}: {e}")))
    };
    Ok(Policy {
        policy_id: get_text(0)?,
        statement: get_text(1)?,
        scope: PolicyScope::parse(&get_text(2)?),
        priority: row
            .get::<i64>(3)
            .map_err(|e| Error::Storage(format!("Failed to read priority: {e}")))?
            .clamp(0, 100) as u8,
        source: PolicySource::parse(&get_text(4)?),
        created_at: from_unix(
            row.get::<f64>(5)
                .map_err(|e| Error::Storage(format!("Failed to read created_at: {e}")))?,
        ),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::test_support::store;
    use eidos_core::distillation::{Distillation, DistillationKind};
    use eidos_core::episode::{Budget, Episode, Outcome};

    #[tokio::test]
    async fn test_policy_round_trip_and_ordering() {
        let (_dir, store) = store().await;
        let urgent = Policy::new(
            "Never force-push to main",
            PolicyScope::Global,
            PolicySource::User,
        );
        let routine = Policy::new(
            "Prefer small diffs",
            PolicyScope::Global,
            PolicySource::Inferred,
        );
        store.store_policy(&urgent).await.unwrap();
        store.store_policy(&routine).await.unwrap();

        let all = store.fetch_all_policies().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].priority, 60);
        assert_eq!(all[0].statement, "Never force-push to main");

        let global = store
            .fetch_policies_by_scope("GLOBAL", 10)
            .await
            .unwrap();
        assert_eq!(global.len(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, store) = store().await;
        let mut episode = Episode::new("goal one", "", Budget::default());
        episode.close(Outcome::Success, "done");
        store.store_episode(&episode).await.unwrap();
        store
            .store_episode(&Episode::new("goal two", "", Budget::default()))
            .await
            .unwrap();

        let mut confident = Distillation::new(
            DistillationKind::Policy,
            "Always run the formatter before committing changes",
            0.7,
        );
        confident.confidence = 0.7;
        store.store_distillation(&confident).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.episodes, 2);
        assert!((stats.success_rate - 0.5).abs() < f32::EPSILON);
        assert_eq!(stats.high_confidence_distillations, 1);
    }
}
