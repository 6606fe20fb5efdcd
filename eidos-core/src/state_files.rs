//! Flat JSON state files shared with the hook shim.
//!
//! Three small maps live beside the databases: the session → episode map,
//! the session → in-flight step handoff, and the session → pending goal map.
//! Writes go through a temp file and an atomic rename; readers treat decode
//! failures as empty maps so a partial write that escapes the atomic policy
//! self-heals on the next save.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// File name for the session → episode map.
pub const ACTIVE_EPISODES_FILE: &str = "eidos_active_episodes.json";
/// File name for the session → step handoff map.
pub const ACTIVE_STEPS_FILE: &str = "eidos_active_steps.json";
/// File name for the session → pending goal map.
pub const PENDING_GOALS_FILE: &str = "eidos_pending_goals.json";

/// Pending goals older than this are pruned on access.
pub const PENDING_GOAL_MAX_AGE: Duration = Duration::minutes(10);

/// Handoff record bridging the pre-action and post-action hook calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepHandoff {
    pub step_id: String,
    pub episode_id: String,
    pub tool_name: String,
    pub prediction: String,
    pub trace_id: Option<String>,
    pub intent: String,
    pub decision: String,
    pub action_details: HashMap<String, String>,
    pub retrieved_distillation_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A goal waiting for its first tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGoal {
    pub goal: String,
    pub ts: DateTime<Utc>,
}

/// State-file accessor rooted at an installation-local state directory.
#[derive(Debug, Clone)]
pub struct StateFiles {
    dir: PathBuf,
}

impl StateFiles {
    /// Create an accessor, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The state directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the session → episode map.
    #[must_use]
    pub fn active_episodes(&self) -> HashMap<String, String> {
        read_json_map(&self.dir.join(ACTIVE_EPISODES_FILE))
    }

    /// Replace the session → episode map.
    pub fn save_active_episodes(&self, map: &HashMap<String, String>) -> Result<()> {
        write_json_atomic(&self.dir.join(ACTIVE_EPISODES_FILE), map)
    }

    /// Read the session → step handoff map.
    #[must_use]
    pub fn active_steps(&self) -> HashMap<String, StepHandoff> {
        read_json_map(&self.dir.join(ACTIVE_STEPS_FILE))
    }

    /// Replace the session → step handoff map.
    pub fn save_active_steps(&self, map: &HashMap<String, StepHandoff>) -> Result<()> {
        write_json_atomic(&self.dir.join(ACTIVE_STEPS_FILE), map)
    }

    /// Read the pending-goal map, pruning entries older than
    /// [`PENDING_GOAL_MAX_AGE`]. A prune rewrites the file.
    pub fn pending_goals(&self) -> HashMap<String, PendingGoal> {
        let path = self.dir.join(PENDING_GOALS_FILE);
        let mut map: HashMap<String, PendingGoal> = read_json_map(&path);
        let cutoff = Utc::now() - PENDING_GOAL_MAX_AGE;
        let before = map.len();
        map.retain(|_, pending| pending.ts >= cutoff);
        if map.len() != before {
            debug!(pruned = before - map.len(), "pruned stale pending goals");
            if let Err(error) = write_json_atomic(&path, &map) {
                warn!(%error, "failed to rewrite pending goals after prune");
            }
        }
        map
    }

    /// Replace the pending-goal map.
    pub fn save_pending_goals(&self, map: &HashMap<String, PendingGoal>) -> Result<()> {
        write_json_atomic(&self.dir.join(PENDING_GOALS_FILE), map)
    }
}

/// Read a JSON map, returning empty on a missing file or decode error.
pub(crate) fn read_json_map<V: DeserializeOwned>(path: &Path) -> HashMap<String, V> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(error) => {
                warn!(path = %path.display(), %error, "state file unreadable; treating as empty");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

/// Write JSON through a temp file and atomic rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
