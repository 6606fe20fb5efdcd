//! Shared fixtures for the end-to-end test suite.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use std::sync::Arc;

use eidos_core::config::EidosConfig;
use eidos_core::session::EidosContext;
use eidos_core::state_files::StateFiles;
use eidos_core::storage::{EidosStorage, EvidenceStorage};
use eidos_storage_libsql::{EidosStore, EvidenceStore};

/// A fully wired context over fresh libSQL files in a tempdir.
pub struct TestHarness {
    pub ctx: EidosContext,
    pub store: Arc<dyn EidosStorage>,
    pub evidence: Arc<dyn EvidenceStorage>,
    _dir: tempfile::TempDir,
}

/// Build a harness with default configuration.
pub async fn harness() -> TestHarness {
    harness_with(EidosConfig::default()).await
}

/// Build a harness with a custom configuration snapshot.
pub async fn harness_with(config: EidosConfig) -> TestHarness {
    // First caller wins; later harnesses reuse the subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn EidosStorage> = Arc::new(
        EidosStore::open(dir.path().join("eidos.db"))
            .await
            .unwrap(),
    );
    let evidence: Arc<dyn EvidenceStorage> = Arc::new(
        EvidenceStore::open(dir.path().join("evidence.db"))
            .await
            .unwrap(),
    );
    let state = StateFiles::new(dir.path().join("state")).unwrap();
    let ctx = EidosContext::new(config, Arc::clone(&store), Arc::clone(&evidence), state);
    TestHarness {
        ctx,
        store,
        evidence,
        _dir: dir,
    }
}
