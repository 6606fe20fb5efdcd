//! Distillation persistence: dedupe on save, atomic feedback counters,
//! archive-and-purge hygiene.

use eidos_core::distillation::{
    normalize_statement, AdvisoryQuality, Distillation, DistillationKind,
};
use eidos_core::storage::{ArchiveReport, PurgeReport};
use eidos_core::{Error, Result};
use libsql::{params, Row};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::{from_json, from_unix, to_json, to_unix, EidosStore};

const DISTILLATION_COLUMNS: &str = "distillation_id, kind, statement, normalized_statement, \
    refined_statement, domains, triggers, anti_triggers, source_steps, \
    validation_count, contradiction_count, confidence, \
    times_retrieved, times_used, times_helped, created_at, revalidate_by, advisory_quality";

/// Extra confidence decay once a rule is contradicted in 80% of ten or more
/// uses.
const HIGH_CONTRADICTION_DECAY: f64 = 0.15;

impl EidosStore {
    /// Save a distillation, deduplicating by normalized statement.
    ///
    /// When a row with the same normalized key exists, its counters are
    /// summed with the incoming ones, its domains/triggers/source steps
    /// unioned, the higher confidence kept, and the existing id returned.
    pub async fn store_distillation(&self, distillation: &Distillation) -> Result<String> {
        let conn = self.connect()?;
        let normalized = normalize_statement(&distillation.statement);

        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations WHERE normalized_statement = ?"
        );
        let mut rows = conn
            .query(&sql, params![normalized.clone()])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query distillation: {e}")))?;
        let existing = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch distillation row: {e}")))?
            .map(|row| row_to_distillation(&row))
            .transpose()?;

        let merged = match existing {
            // Re-saving the same row is a plain upsert, not a merge
            Some(current) if current.distillation_id == distillation.distillation_id => {
                distillation.clone()
            }
            Some(mut current) => {
                debug!(
                    distillation_id = %current.distillation_id,
                    "deduplicating distillation by normalized statement"
                );
                current.validation_count += distillation.validation_count;
                current.contradiction_count += distillation.contradiction_count;
                current.times_retrieved += distillation.times_retrieved;
                current.times_used += distillation.times_used;
                current.times_helped += distillation.times_helped;
                current.confidence = current.confidence.max(distillation.confidence);
                current.domains = union(&current.domains, &distillation.domains);
                current.triggers = union(&current.triggers, &distillation.triggers);
                current.anti_triggers = union(&current.anti_triggers, &distillation.anti_triggers);
                current.source_steps = union(&current.source_steps, &distillation.source_steps);
                if current.refined_statement.is_empty() {
                    current.refined_statement = distillation.refined_statement.clone();
                }
                current
            }
            None => distillation.clone(),
        };

        let sql = format!(
            "INSERT OR REPLACE INTO distillations ({DISTILLATION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        conn.execute(
            &sql,
            params![
                merged.distillation_id.clone(),
                merged.kind.to_string(),
                merged.statement.clone(),
                normalized,
                merged.refined_statement.clone(),
                to_json(&merged.domains)?,
                to_json(&merged.triggers)?,
                to_json(&merged.anti_triggers)?,
                to_json(&merged.source_steps)?,
                i64::from(merged.validation_count),
                i64::from(merged.contradiction_count),
                f64::from(merged.confidence.clamp(0.0, 1.0)),
                i64::from(merged.times_retrieved),
                i64::from(merged.times_used),
                i64::from(merged.times_helped),
                to_unix(merged.created_at),
                merged.revalidate_by.map(to_unix),
                to_json(&merged.advisory_quality)?,
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to store distillation: {e}")))?;

        Ok(merged.distillation_id)
    }

    /// Fetch a distillation by id.
    pub async fn fetch_distillation(&self, distillation_id: &str) -> Result<Option<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations WHERE distillation_id = ?"
        );
        let mut rows = conn
            .query(&sql, params![distillation_id])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query distillation: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch distillation row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_distillation(&row)?)),
            None => Ok(None),
        }
    }

    /// Distillations of one kind, ordered by (confidence desc, helped desc).
    pub async fn fetch_distillations_by_kind(
        &self,
        kind: DistillationKind,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations WHERE kind = ? \
             ORDER BY confidence DESC, times_helped DESC LIMIT ?"
        );
        self.collect(conn.query(&sql, params![kind.to_string(), limit as i64]).await)
            .await
    }

    /// Distillations whose domains mention `domain`.
    pub async fn fetch_distillations_by_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations WHERE domains LIKE ? \
             ORDER BY confidence DESC, times_helped DESC LIMIT ?"
        );
        self.collect(
            conn.query(&sql, params![format!("%{domain}%"), limit as i64])
                .await,
        )
        .await
    }

    /// Distillations whose triggers mention `trigger`.
    pub async fn fetch_distillations_by_trigger(
        &self,
        trigger: &str,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations WHERE triggers LIKE ? \
             ORDER BY confidence DESC, times_helped DESC LIMIT ?"
        );
        self.collect(
            conn.query(&sql, params![format!("%{trigger}%"), limit as i64])
                .await,
        )
        .await
    }

    /// Distillations at or above a confidence floor.
    pub async fn fetch_high_confidence(
        &self,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations WHERE confidence >= ? \
             ORDER BY confidence DESC, times_helped DESC LIMIT ?"
        );
        self.collect(
            conn.query(&sql, params![f64::from(min_confidence), limit as i64])
                .await,
        )
        .await
    }

    /// Distillations past their revalidation deadline.
    pub async fn fetch_due_for_revalidation(&self) -> Result<Vec<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations \
             WHERE revalidate_by IS NOT NULL AND revalidate_by <= ?"
        );
        self.collect(
            conn.query(&sql, params![to_unix(chrono::Utc::now())])
                .await,
        )
        .await
    }

    /// All distillations, ordered by (confidence desc, helped desc).
    pub async fn fetch_all_distillations(&self, limit: usize) -> Result<Vec<Distillation>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {DISTILLATION_COLUMNS} FROM distillations \
             ORDER BY confidence DESC, times_helped DESC LIMIT ?"
        );
        self.collect(conn.query(&sql, params![limit as i64]).await).await
    }

    /// Atomic times_retrieved increment.
    pub async fn bump_retrieval(&self, distillation_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE distillations SET times_retrieved = times_retrieved + 1 \
             WHERE distillation_id = ?",
            params![distillation_id],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to record retrieval: {e}")))?;
        Ok(())
    }

    /// Atomic usage feedback with the high-contradiction decay applied in
    /// the same statement batch.
    pub async fn bump_usage(&self, distillation_id: &str, helped: bool) -> Result<()> {
        let conn = self.connect()?;
        if helped {
            conn.execute(
                "UPDATE distillations SET \
                     times_used = times_used + 1, \
                     times_helped = times_helped + 1, \
                     validation_count = validation_count + 1, \
                     confidence = MIN(1.0, confidence + 0.05) \
                 WHERE distillation_id = ?",
                params![distillation_id],
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to record usage: {e}")))?;
        } else {
            conn.execute(
                "UPDATE distillations SET \
                     times_used = times_used + 1, \
                     contradiction_count = contradiction_count + 1, \
                     confidence = MAX(0.1, confidence - 0.1) \
                 WHERE distillation_id = ?",
                params![distillation_id],
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to record usage: {e}")))?;
        }

        // Rules that are mostly contradicted decay faster
        conn.execute(
            &format!(
                "UPDATE distillations SET confidence = MAX(0.1, confidence - {HIGH_CONTRADICTION_DECAY}) \
                 WHERE distillation_id = ? \
                   AND times_used >= 10 \
                   AND CAST(contradiction_count AS REAL) / times_used >= 0.8"
            ),
            params![distillation_id],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to apply contradiction decay: {e}")))?;
        Ok(())
    }

    /// Archive low-quality rows, then delete them from the active table.
    ///
    /// A row is archived when its stored advisory score is below `floor` or
    /// its suppressed flag is set; rows with a non-empty refined statement
    /// or a score at/above the floor are kept. Idempotent: a second pass
    /// over unchanged data archives nothing.
    pub async fn archive_and_purge_low_quality(
        &self,
        floor: f32,
        dry_run: bool,
    ) -> Result<ArchiveReport> {
        let all = self.fetch_all_distillations(100_000).await?;
        let mut report = ArchiveReport {
            scanned: all.len() as u64,
            dry_run,
            ..ArchiveReport::default()
        };

        let conn = self.connect()?;
        for distillation in &all {
            let quality = &distillation.advisory_quality;
            let score_below = quality.unified_score.is_some_and(|score| score < floor);
            let keep = !distillation.refined_statement.is_empty()
                || quality.unified_score.is_some_and(|score| score >= floor);

            if keep || (!score_below && !quality.suppressed) {
                report.kept += 1;
                continue;
            }

            let reason = if quality.suppressed {
                let tag = if quality.suppressed_tag.is_empty() {
                    "unspecified"
                } else {
                    quality.suppressed_tag.as_str()
                };
                format!("suppressed:{tag}")
            } else {
                format!("unified_score_below_floor:{floor}")
            };
            report.reasons.push(reason.clone());
            report.archived += 1;

            if dry_run {
                continue;
            }

            conn.execute(
                "INSERT OR REPLACE INTO distillations_archive \
                 SELECT *, ?, ? FROM distillations WHERE distillation_id = ?",
                params![
                    reason,
                    to_unix(chrono::Utc::now()),
                    distillation.distillation_id.clone()
                ],
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to archive distillation: {e}")))?;
            conn.execute(
                "DELETE FROM distillations WHERE distillation_id = ?",
                params![distillation.distillation_id.clone()],
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to purge distillation: {e}")))?;
        }

        info!(
            scanned = report.scanned,
            archived = report.archived,
            dry_run,
            "archive-and-purge pass complete"
        );
        Ok(report)
    }

    /// Delete telemetry-shaped statements: success-rate strings, per-uses
    /// counters, and tool-sequence arrows.
    pub async fn purge_telemetry(&self, dry_run: bool) -> Result<PurgeReport> {
        let all = self.fetch_all_distillations(100_000).await?;
        let mut report = PurgeReport {
            scanned: all.len() as u64,
            dry_run,
            ..PurgeReport::default()
        };

        let conn = self.connect()?;
        for distillation in &all {
            if !is_telemetry_statement(&distillation.statement) {
                continue;
            }
            report.removed += 1;
            if report.preview.len() < 20 {
                report
                    .preview
                    .push(distillation.statement.chars().take(200).collect());
            }
            if !dry_run {
                conn.execute(
                    "DELETE FROM distillations WHERE distillation_id = ?",
                    params![distillation.distillation_id.clone()],
                )
                .await
                .map_err(|e| Error::Storage(format!("Failed to purge distillation: {e}")))?;
            }
        }
        Ok(report)
    }

    async fn collect(
        &self,
        rows: std::result::Result<libsql::Rows, libsql::Error>,
    ) -> Result<Vec<Distillation>> {
        let mut rows =
            rows.map_err(|e| Error::Storage(format!("Failed to query distillations: {e}")))?;
        let mut distillations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch distillation row: {e}")))?
        {
            distillations.push(row_to_distillation(&row)?);
        }
        Ok(distillations)
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = a.iter().chain(b.iter()).cloned().collect();
    set.into_iter().collect()
}

fn is_telemetry_statement(statement: &str) -> bool {
    let lower = statement.to_lowercase();
    if lower.contains("success rate") {
        return true;
    }
    if lower.contains("sequence") && statement.contains("->") {
        return true;
    }
    // "over N uses"
    let mut rest = lower.as_str();
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

fn row_to_distillation(row: &Row) -> Result<Distillation> {
    let get_text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read distillation column {idx}: {e}")))
    };
    let get_i64 = |idx: i32| -> Result<i64> {
        row.get::<i64>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read distillation column {idx}: {e}")))
    };
    let get_f64 = |idx: i32| -> Result<f64> {
        row.get::<f64>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read distillation column {idx}: {e}")))
    };

    let kind_raw = get_text(1)?;
    let kind = DistillationKind::parse(&kind_raw)
        .ok_or_else(|| Error::InvalidState(format!("unknown distillation kind '{kind_raw}'")))?;
    let advisory: AdvisoryQuality = from_json(&get_text(17)?);

    Ok(Distillation {
        distillation_id: get_text(0)?,
        kind,
        statement: get_text(2)?,
        // column 3 is the normalized key, derived on write
        refined_statement: get_text(4)?,
        domains: from_json(&get_text(5)?),
        triggers: from_json(&get_text(6)?),
        anti_triggers: from_json(&get_text(7)?),
        source_steps: from_json(&get_text(8)?),
        validation_count: get_i64(9)? as u32,
        contradiction_count: get_i64(10)? as u32,
        confidence: get_f64(11)? as f32,
        times_retrieved: get_i64(12)? as u32,
        times_used: get_i64(13)? as u32,
        times_helped: get_i64(14)? as u32,
        created_at: from_unix(get_f64(15)?),
        revalidate_by: row
            .get::<Option<f64>>(16)
            .map_err(|e| Error::Storage(format!("Failed to read revalidate_by: {e}")))?
            .map(from_unix),
        advisory_quality: advisory,
    })
}
