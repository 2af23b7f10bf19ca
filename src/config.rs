//! Core configuration
//!
//! Paths and knobs for the coordination core. Everything is derived from a
//! single root directory so tests can point the whole system at a tempdir.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by the coordination subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root of the blackboard tree (mailboxes, tasks, feedback, scores).
    pub blackboard_root: PathBuf,
    /// Root of the memory tree (l2 database, l3 experiences, l4 snapshot).
    pub memory_root: PathBuf,
    /// Directory holding agent card JSON files.
    pub cards_dir: PathBuf,
    /// Seconds between evolution scheduler cycles.
    pub check_interval_secs: u64,
    /// Seconds of inactivity before the system counts as idle.
    pub idle_threshold_secs: u64,
    /// Wall-clock timeout for a single external executor invocation.
    pub exec_timeout_secs: u64,
}

impl CoreConfig {
    /// Build a config with the standard layout under `root`.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            blackboard_root: root.join("blackboard"),
            memory_root: root.join("memory"),
            cards_dir: root.join("a2a-cards"),
            check_interval_secs: 900,
            idle_threshold_secs: 900,
            exec_timeout_secs: 300,
        }
    }

    /// Resolve the root from `AGENCY_ROOT`, falling back to `~/.agency`.
    pub fn from_env() -> Self {
        let root = std::env::var("AGENCY_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".agency"))
                    .unwrap_or_else(|_| PathBuf::from(".agency"))
            });
        Self::from_root(root)
    }

    pub fn with_check_interval(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    pub fn with_idle_threshold(mut self, secs: u64) -> Self {
        self.idle_threshold_secs = secs;
        self
    }

    pub fn with_exec_timeout(mut self, secs: u64) -> Self {
        self.exec_timeout_secs = secs;
        self
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// L2 history database path.
    pub fn history_db_path(&self) -> PathBuf {
        self.memory_root.join("l2").join("history.db")
    }

    /// L3 experience store directory.
    pub fn experience_dir(&self) -> PathBuf {
        self.memory_root.join("l3").join("experiences")
    }

    /// L4 snapshot repository path.
    pub fn snapshot_repo(&self) -> PathBuf {
        self.memory_root.join("github")
    }

    /// Evolution queue directory.
    pub fn evolution_queue_dir(&self) -> PathBuf {
        self.blackboard_root.join("federation").join("evolution-queue")
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.blackboard_root.join("feedback")
    }

    pub fn scores_dir(&self) -> PathBuf {
        self.blackboard_root.join("utility-scores")
    }

    pub fn nominations_dir(&self) -> PathBuf {
        self.blackboard_root.join("nominations")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.blackboard_root.join("tasks")
    }

    pub fn node_status_file(&self) -> PathBuf {
        self.blackboard_root.join("shared").join("node-status.json")
    }

    pub fn risk_limits_file(&self) -> PathBuf {
        self.blackboard_root.join("shared").join("risk-limits.json")
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
