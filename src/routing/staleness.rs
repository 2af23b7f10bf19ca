//! Task timeout sweeper
//!
//! Scans persisted task state under the blackboard and flags tasks stuck in
//! a non-terminal status or past their priority deadline. Reporting only:
//! the controlling pm decides what to do with a stale task.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::memory::TaskStatus;

lazy_static! {
    static ref STATUS_RE: Regex =
        Regex::new(r"(?i)\*\*Status\*\*:\s*(\w+)").expect("static regex");
    static ref UPDATED_RE: Regex =
        Regex::new(r"(?i)\*\*Last Updated\*\*:\s*(.+)").expect("static regex");
}

/// Stuck-state thresholds, in hours.
fn stuck_threshold_hours(status: TaskStatus) -> Option<i64> {
    match status {
        TaskStatus::Pending => Some(4),
        TaskStatus::Planning => Some(2),
        TaskStatus::Executing => Some(24),
        TaskStatus::Validating => Some(4),
        _ => None,
    }
}

/// Priority deadlines, in hours.
fn priority_timeout_hours(priority: &str) -> i64 {
    match priority {
        "P0" => 1,
        "P1" => 4,
        "P2" => 24,
        "P3" => 72,
        _ => 24,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    StuckStatus,
    PriorityTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleTask {
    pub task_id: String,
    pub status: Option<TaskStatus>,
    pub priority: Option<String>,
    pub reason: StaleReason,
    pub age_hours: f64,
    pub threshold_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub stale: Vec<StaleTask>,
    pub generated_at: DateTime<Utc>,
}

/// Sweeper over `<tasks_dir>/<task-id>/{task.json,status.md}`.
pub struct TimeoutSweeper {
    tasks_dir: PathBuf,
}

impl TimeoutSweeper {
    pub fn new(tasks_dir: impl AsRef<Path>) -> Self {
        Self {
            tasks_dir: tasks_dir.as_ref().to_path_buf(),
        }
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Sweep against an explicit clock so tests are deterministic.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut checked = 0;
        let mut stale = Vec::new();

        if self.tasks_dir.exists() {
            for entry in std::fs::read_dir(&self.tasks_dir)? {
                let entry = entry?;
                let task_dir = entry.path();
                if !task_dir.is_dir() {
                    continue;
                }
                checked += 1;
                if let Some(flag) = self.check_task(&task_dir, now) {
                    stale.push(flag);
                }
            }
        }

        stale.sort_by(|a, b| {
            b.age_hours
                .partial_cmp(&a.age_hours)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(SweepReport {
            checked,
            stale,
            generated_at: now,
        })
    }

    fn check_task(&self, task_dir: &Path, now: DateTime<Utc>) -> Option<StaleTask> {
        let task_id = task_dir.file_name()?.to_string_lossy().into_owned();

        let task: Value = std::fs::read_to_string(task_dir.join("task.json"))
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())?;

        let mut status = task
            .get("status")
            .and_then(Value::as_str)
            .and_then(TaskStatus::parse);
        let priority = task
            .get("priority")
            .and_then(Value::as_str)
            .map(String::from);
        let created = task
            .get("createdAt")
            .and_then(Value::as_str)
            .and_then(parse_datetime);
        let mut updated = task
            .get("updatedAt")
            .and_then(Value::as_str)
            .and_then(parse_datetime);

        // status.md, when present, carries the freshest state.
        if let Ok(body) = std::fs::read_to_string(task_dir.join("status.md")) {
            if let Some(s) = STATUS_RE
                .captures(&body)
                .and_then(|c| c.get(1))
                .and_then(|m| TaskStatus::parse(&m.as_str().to_lowercase()))
            {
                status = Some(s);
            }
            if let Some(t) = UPDATED_RE
                .captures(&body)
                .and_then(|c| c.get(1))
                .and_then(|m| parse_datetime(m.as_str().trim()))
            {
                updated = Some(t);
            }
        }

        let status = status?;
        if status.is_terminal() {
            return None;
        }

        // Stuck in one non-terminal status too long?
        if let Some(threshold) = stuck_threshold_hours(status) {
            let reference = updated.or(created)?;
            let age = now - reference;
            if age > Duration::hours(threshold) {
                return Some(StaleTask {
                    task_id,
                    status: Some(status),
                    priority,
                    reason: StaleReason::StuckStatus,
                    age_hours: age.num_minutes() as f64 / 60.0,
                    threshold_hours: threshold,
                });
            }
        }

        // Past the priority deadline since creation?
        if let (Some(priority), Some(created)) = (priority.as_deref(), created) {
            let threshold = priority_timeout_hours(priority);
            let age = now - created;
            if age > Duration::hours(threshold) {
                return Some(StaleTask {
                    task_id,
                    status: Some(status),
                    priority: Some(priority.to_string()),
                    reason: StaleReason::PriorityTimeout,
                    age_hours: age.num_minutes() as f64 / 60.0,
                    threshold_hours: threshold,
                });
            }
        }

        None
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_task(
        dir: &TempDir,
        id: &str,
        status: &str,
        priority: &str,
        created_hours_ago: i64,
        updated_hours_ago: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let task_dir = dir.path().join("tasks").join(id);
        std::fs::create_dir_all(&task_dir)?;
        std::fs::write(
            task_dir.join("task.json"),
            serde_json::to_string(&json!({
                "id": id,
                "status": status,
                "priority": priority,
                "createdAt": (now - Duration::hours(created_hours_ago)).to_rfc3339(),
                "updatedAt": (now - Duration::hours(updated_hours_ago)).to_rfc3339(),
            }))?,
        )?;
        Ok(())
    }

    #[test]
    fn test_fresh_task_not_flagged() -> Result<()> {
        let dir = TempDir::new()?;
        write_task(&dir, "t1", "executing", "P2", 1, 0)?;

        let report = TimeoutSweeper::new(dir.path().join("tasks")).sweep()?;
        assert_eq!(report.checked, 1);
        assert!(report.stale.is_empty());
        Ok(())
    }

    #[test]
    fn test_stuck_pending_flagged() -> Result<()> {
        let dir = TempDir::new()?;
        write_task(&dir, "t1", "pending", "P3", 6, 6)?;

        let report = TimeoutSweeper::new(dir.path().join("tasks")).sweep()?;
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.stale[0].reason, StaleReason::StuckStatus);
        assert_eq!(report.stale[0].threshold_hours, 4);
        Ok(())
    }

    #[test]
    fn test_priority_timeout_flagged() -> Result<()> {
        let dir = TempDir::new()?;
        // P0 deadline is 1h; executing threshold (24h) not yet hit.
        write_task(&dir, "t1", "executing", "P0", 2, 0)?;

        let report = TimeoutSweeper::new(dir.path().join("tasks")).sweep()?;
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.stale[0].reason, StaleReason::PriorityTimeout);
        assert_eq!(report.stale[0].threshold_hours, 1);
        Ok(())
    }

    #[test]
    fn test_terminal_tasks_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        write_task(&dir, "t1", "completed", "P0", 100, 100)?;
        write_task(&dir, "t2", "failed", "P0", 100, 100)?;

        let report = TimeoutSweeper::new(dir.path().join("tasks")).sweep()?;
        assert_eq!(report.checked, 2);
        assert!(report.stale.is_empty());
        Ok(())
    }

    #[test]
    fn test_status_md_overrides_task_json() -> Result<()> {
        let dir = TempDir::new()?;
        write_task(&dir, "t1", "pending", "P3", 6, 6)?;
        // status.md says the task actually finished.
        std::fs::write(
            dir.path().join("tasks/t1/status.md"),
            "# Task\n**Status**: Completed\n",
        )?;

        let report = TimeoutSweeper::new(dir.path().join("tasks")).sweep()?;
        assert!(report.stale.is_empty());
        Ok(())
    }
}
