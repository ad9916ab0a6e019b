//! Snapshot persistence for crash recovery.
//!
//! The orchestrator hands a full snapshot to its hook after every state
//! change. Persistence is best-effort: a failed write is logged by the
//! orchestrator and never fails the operation that triggered it.

use chrono::{DateTime, Utc};
use intercom_core::{Result, Task};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to rebuild the orchestrator's task tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Pending and assigned tasks, ordered by task id.
    pub active: Vec<Task>,
    /// Ids of pending tasks in dispatch order.
    pub pending: Vec<String>,
    /// Completed and failed tasks, oldest first.
    pub history: Vec<Task>,
}

pub trait PersistenceHook: Send + Sync {
    fn persist(&self, snapshot: &OrchestratorSnapshot) -> Result<()>;
}

/// Writes snapshots as pretty JSON. Each write goes to a temp file that is
/// renamed over the target, so readers never see a torn file.
#[derive(Debug, Clone)]
pub struct JsonFileHook {
    path: PathBuf,
}

impl JsonFileHook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last snapshot. `Ok(None)` if none was ever written.
    pub fn load(&self) -> Result<Option<OrchestratorSnapshot>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PersistenceHook for JsonFileHook {
    fn persist(&self, snapshot: &OrchestratorSnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
