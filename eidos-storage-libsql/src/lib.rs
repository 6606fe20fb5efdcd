#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]

//! # EIDOS Storage - libSQL
//!
//! libSQL storage backend for the EIDOS meta-learning substrate.
//!
//! Two single-file databases live side by side:
//! - `eidos.db` — the canonical store: episodes, steps, distillations, the
//!   distillation archive, and policies ([`EidosStore`])
//! - `evidence.db` — the ephemeral audit trail with per-kind retention and
//!   transparent compression ([`EvidenceStore`])
//!
//! Every operation opens a connection, runs a short transaction, and
//! returns; readers never observe partial upserts, and concurrent writers
//! issuing the same upsert land on a single row.
//!
//! ## Example
//!
//! ```no_run
//! use eidos_storage_libsql::EidosStore;
//!
//! # async fn example() -> eidos_core::Result<()> {
//! let store = EidosStore::open("/tmp/eidos/eidos.db").await?;
//! let stats = store.stats().await?;
//! println!("{} episodes", stats.episodes);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use eidos_core::{Error, Result};
use libsql::{Builder, Connection, Database};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

mod distillations;
mod episodes;
mod evidence;
mod policies;
mod schema;
mod steps;
mod trait_impl;

pub use evidence::EvidenceStore;

/// Canonical relational store on a local libSQL file.
pub struct EidosStore {
    db: Arc<Database>,
}

impl EidosStore {
    /// Open (or create) the store at `path` and initialize the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| Error::Storage(format!("Failed to open database: {e}")))?;
        let store = Self { db: Arc::new(db) };
        store.initialize_schema().await?;
        info!(path = %path.display(), "eidos store opened");
        Ok(store)
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn initialize_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        for sql in [
            schema::CREATE_EPISODES_TABLE,
            schema::CREATE_STEPS_TABLE,
            schema::CREATE_DISTILLATIONS_TABLE,
            schema::CREATE_DISTILLATIONS_ARCHIVE_TABLE,
            schema::CREATE_POLICIES_TABLE,
        ] {
            conn.execute(sql, ())
                .await
                .map_err(|e| Error::Storage(format!("Failed to create table: {e}")))?;
        }
        for sql in schema::CREATE_INDEXES {
            conn.execute(sql, ())
                .await
                .map_err(|e| Error::Storage(format!("Failed to create index: {e}")))?;
        }
        Ok(())
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| Error::Storage(format!("Failed to connect: {e}")))
    }
}

/// Encode a timestamp as fractional unix seconds for a REAL column.
pub(crate) fn to_unix(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Decode fractional unix seconds back into a timestamp. Rounding (not
/// truncation) makes the encode/decode pair exact at microsecond precision.
pub(crate) fn from_unix(seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
        .unwrap_or_else(Utc::now)
}

/// Serialize a value into a JSON TEXT column.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON TEXT column; malformed values decode as the default.
pub(crate) fn from_json<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::unwrap_used)]

    use super::EidosStore;

    pub async fn store() -> (tempfile::TempDir, EidosStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EidosStore::open(dir.path().join("eidos.db")).await.unwrap();
        (dir, store)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_unix_round_trip_preserves_micros() {
        let now = Utc::now();
        let back = from_unix(to_unix(now));
        assert_eq!(now.timestamp_micros(), back.timestamp_micros());
    }

    #[test]
    fn test_from_json_tolerates_garbage() {
        let decoded: Vec<String> = from_json("{not json");
        assert!(decoded.is_empty());
        let decoded: std::collections::HashMap<String, u32> = from_json("");
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let (_dir, store) = test_support::store().await;
        store.initialize_schema().await.unwrap();
        store.initialize_schema().await.unwrap();
    }
}
