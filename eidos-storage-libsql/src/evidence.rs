//! Ephemeral evidence persistence with transparent compression.
//!
//! Evidence lives in its own database file so the canonical store stays
//! lean while the audit trail remains complete. Content at or above the
//! compression threshold is gzip-compressed and base64-encoded into the
//! TEXT column; reads decompress transparently.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use eidos_core::evidence::{Evidence, EvidenceKind};
use eidos_core::storage::{EvidenceStats, EvidenceStorage};
use eidos_core::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use libsql::{params, Builder, Connection, Database, Row};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{from_unix, schema, to_unix};

const EVIDENCE_COLUMNS: &str = "evidence_id, step_id, kind, tool_name, content, content_hash, \
    byte_size, compressed, exit_code, duration_ms, created_at, expires_at, retention_reason";

/// Evidence store on a local libSQL file.
pub struct EvidenceStore {
    db: Arc<Database>,
}

impl EvidenceStore {
    /// Open (or create) the evidence store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| Error::Storage(format!("Failed to open evidence database: {e}")))?;
        let store = Self { db: Arc::new(db) };
        store.initialize_schema().await?;
        info!(path = %path.display(), "evidence store opened");
        Ok(store)
    }

    /// Create the evidence table and indexes if they do not exist.
    pub async fn initialize_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(schema::CREATE_EVIDENCE_TABLE, ())
            .await
            .map_err(|e| Error::Storage(format!("Failed to create evidence table: {e}")))?;
        for sql in schema::CREATE_EVIDENCE_INDEXES {
            conn.execute(sql, ())
                .await
                .map_err(|e| Error::Storage(format!("Failed to create evidence index: {e}")))?;
        }
        Ok(())
    }

    fn connect(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| Error::Storage(format!("Failed to connect: {e}")))
    }
}

#[async_trait]
impl EvidenceStorage for EvidenceStore {
    async fn save(&self, evidence: &Evidence, compress_threshold: usize) -> Result<String> {
        let raw_bytes = evidence.content.as_bytes();
        let (content, compressed, byte_size) = if raw_bytes.len() >= compress_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(raw_bytes)
                .map_err(|e| Error::Storage(format!("Failed to compress evidence: {e}")))?;
            let compressed_bytes = encoder
                .finish()
                .map_err(|e| Error::Storage(format!("Failed to compress evidence: {e}")))?;
            let size = compressed_bytes.len();
            (
                base64::engine::general_purpose::STANDARD.encode(compressed_bytes),
                true,
                size,
            )
        } else {
            (evidence.content.clone(), false, raw_bytes.len())
        };
        debug!(
            evidence_id = %evidence.evidence_id,
            compressed,
            byte_size,
            "saving evidence"
        );

        let conn = self.connect()?;
        let sql = format!(
            "INSERT OR REPLACE INTO evidence ({EVIDENCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        conn.execute(
            &sql,
            params![
                evidence.evidence_id.clone(),
                evidence.step_id.clone(),
                evidence.kind.to_string(),
                evidence.tool_name.clone(),
                content,
                evidence.content_hash.clone(),
                byte_size as i64,
                i64::from(compressed),
                evidence.exit_code.map(i64::from),
                evidence.duration_ms.map(|d| d as i64),
                to_unix(evidence.created_at),
                evidence.expires_at.map(to_unix),
                evidence.retention_reason.clone(),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to store evidence: {e}")))?;
        Ok(evidence.evidence_id.clone())
    }

    async fn get(&self, evidence_id: &str) -> Result<Option<Evidence>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE evidence_id = ?");
        let mut rows = conn
            .query(&sql, params![evidence_id])
            .await
            .map_err(|e| Error::Storage(format!("Failed to query evidence: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch evidence row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_evidence(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_for_step(&self, step_id: &str) -> Result<Vec<Evidence>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE step_id = ? ORDER BY created_at"
        );
        collect(conn.query(&sql, params![step_id]).await).await
    }

    async fn get_by_kind(&self, kind: EvidenceKind, limit: usize) -> Result<Vec<Evidence>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE kind = ? \
             ORDER BY created_at DESC LIMIT ?"
        );
        collect(conn.query(&sql, params![kind.to_string(), limit as i64]).await).await
    }

    async fn flag_permanent(&self, evidence_id: &str, reason: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE evidence SET expires_at = NULL, retention_reason = ? WHERE evidence_id = ?",
            params![reason, evidence_id],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to pin evidence: {e}")))?;
        Ok(())
    }

    async fn extend_retention(
        &self,
        evidence_id: &str,
        additional_seconds: u64,
        reason: &str,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE evidence SET \
                 expires_at = COALESCE(expires_at, ?) + ?, \
                 retention_reason = CASE WHEN retention_reason = '' THEN ? \
                     ELSE retention_reason || '; ' || ? END \
             WHERE evidence_id = ?",
            params![
                to_unix(Utc::now()),
                additional_seconds as i64,
                reason,
                reason,
                evidence_id
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("Failed to extend retention: {e}")))?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let conn = self.connect()?;
        let deleted = conn
            .execute(
                "DELETE FROM evidence WHERE expires_at IS NOT NULL AND expires_at < ?",
                params![to_unix(Utc::now())],
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to clean up evidence: {e}")))?;
        debug!(deleted, "expired evidence removed");
        Ok(deleted)
    }

    async fn get_stats(&self) -> Result<EvidenceStats> {
        let conn = self.connect()?;
        let mut stats = EvidenceStats::default();

        let mut rows = conn
            .query(
                "SELECT COUNT(*), COALESCE(SUM(byte_size), 0) FROM evidence",
                (),
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to query totals: {e}")))?;
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch totals: {e}")))?
        {
            stats.total_items = read_i64(&row, 0)? as u64;
            stats.total_bytes = read_i64(&row, 1)? as u64;
        }

        let mut by_kind: HashMap<String, (u64, u64)> = HashMap::new();
        let mut rows = conn
            .query(
                "SELECT kind, COUNT(*), COALESCE(SUM(byte_size), 0) FROM evidence GROUP BY kind",
                (),
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to query kind breakdown: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch kind row: {e}")))?
        {
            let kind = row
                .get::<String>(0)
                .map_err(|e| Error::Storage(format!("Failed to read kind: {e}")))?;
            by_kind.insert(kind, (read_i64(&row, 1)? as u64, read_i64(&row, 2)? as u64));
        }
        stats.by_kind = by_kind;

        let soon = to_unix(Utc::now() + chrono::Duration::hours(24));
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM evidence WHERE expires_at IS NOT NULL AND expires_at < ?",
                params![soon],
            )
            .await
            .map_err(|e| Error::Storage(format!("Failed to query expiring: {e}")))?;
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch expiring: {e}")))?
        {
            stats.expiring_in_24h = read_i64(&row, 0)? as u64;
        }

        let mut rows = conn
            .query("SELECT COUNT(*) FROM evidence WHERE expires_at IS NULL", ())
            .await
            .map_err(|e| Error::Storage(format!("Failed to query permanent: {e}")))?;
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("Failed to fetch permanent: {e}")))?
        {
            stats.permanent = read_i64(&row, 0)? as u64;
        }

        Ok(stats)
    }
}

async fn collect(
    rows: std::result::Result<libsql::Rows, libsql::Error>,
) -> Result<Vec<Evidence>> {
    let mut rows = rows.map_err(|e| Error::Storage(format!("Failed to query evidence: {e}")))?;
    let mut items = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch evidence row: {e}")))?
    {
        items.push(row_to_evidence(&row)?);
    }
    Ok(items)
}

fn read_i64(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx)
        .map_err(|e| Error::Storage(format!("Failed to read evidence column {idx}: {e}")))
}

fn row_to_evidence(row: &Row) -> Result<Evidence> {
    let get_text = |idx: i32| -> Result<String> {
        row.get::<String>(idx)
            .map_err(|e| Error::Storage(format!("Failed to read evidence column {idx}: {e}")))
    };

    let compressed = read_i64(row, 7)? != 0;
    let stored_content = get_text(4)?;
    let content = if compressed && !stored_content.is_empty() {
        decompress(&stored_content).unwrap_or(stored_content)
    } else {
        stored_content
    };

    Ok(Evidence {
        evidence_id: get_text(0)?,
        step_id: get_text(1)?,
        kind: EvidenceKind::parse(&get_text(2)?),
        tool_name: get_text(3)?,
        content,
        content_hash: get_text(5)?,
        byte_size: read_i64(row, 6)? as usize,
        compressed,
        exit_code: row
            .get::<Option<i64>>(8)
            .map_err(|e| Error::Storage(format!("Failed to read exit_code: {e}")))?
            .map(|v| v as i32),
        duration_ms: row
            .get::<Option<i64>>(9)
            .map_err(|e| Error::Storage(format!("Failed to read duration_ms: {e}")))?
            .map(|v| v as u64),
        created_at: from_unix(
            row.get::<f64>(10)
                .map_err(|e| Error::Storage(format!("Failed to read created_at: {e}")))?,
        ),
        expires_at: row
            .get::<Option<f64>>(11)
            .map_err(|e| Error::Storage(format!("Failed to read expires_at: {e}")))?
            .map(from_unix),
        retention_reason: get_text(12)?,
    })
}

/// Decompress a base64-encoded gzip payload; failure keeps the stored form.
fn decompress(encoded: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut content = String::new();
    decoder.read_to_string(&mut content).ok()?;
    Some(content)
}
