//! Evolution task queues
//!
//! Four persistent JSON queues, one per priority tier. Each queue holds
//! three buckets (pending tasks, processing, completed); a task moves
//! between buckets but is never lost, so the bucket total is conserved
//! across a cycle.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Evolution priority tiers, highest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub const ORDER: [Priority; 4] = [Priority::P1, Priority::P2, Priority::P3, Priority::P4];

    pub fn file_name(&self) -> &'static str {
        match self {
            Priority::P1 => "p1-knowledge.json",
            Priority::P2 => "p2-training.json",
            Priority::P3 => "p3-exploration.json",
            Priority::P4 => "p4-soul-drafts.json",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::P4 => "P4",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Payload describing what an evolution task should do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionPayload {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: EvolutionTaskStatus,
    #[serde(default)]
    pub payload: EvolutionPayload,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl EvolutionTask {
    pub fn new(task_type: impl Into<String>, payload: EvolutionPayload) -> Self {
        Self {
            id: format!("evo-{}", Uuid::new_v4()),
            task_type: task_type.into(),
            status: EvolutionTaskStatus::Pending,
            payload,
            created_at: Utc::now(),
            assigned_to: None,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}

/// One persisted queue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFile {
    pub priority: Priority,
    #[serde(default)]
    pub tasks: Vec<EvolutionTask>,
    #[serde(default)]
    pub processing: Vec<EvolutionTask>,
    #[serde(default)]
    pub completed: Vec<EvolutionTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl QueueFile {
    fn empty(priority: Priority) -> Self {
        Self {
            priority,
            tasks: Vec::new(),
            processing: Vec::new(),
            completed: Vec::new(),
            last_updated: None,
        }
    }

    pub fn total(&self) -> usize {
        self.tasks.len() + self.processing.len() + self.completed.len()
    }
}

/// Per-priority bucket counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
}

/// Persistent evolution queues under one directory.
#[derive(Clone)]
pub struct EvolutionQueue {
    queue_dir: PathBuf,
}

impl EvolutionQueue {
    pub fn new(queue_dir: impl AsRef<Path>) -> Result<Self> {
        let queue_dir = queue_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&queue_dir)?;
        Ok(Self { queue_dir })
    }

    fn path(&self, priority: Priority) -> PathBuf {
        self.queue_dir.join(priority.file_name())
    }

    pub fn load(&self, priority: Priority) -> QueueFile {
        std::fs::read_to_string(self.path(priority))
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
            .unwrap_or_else(|| QueueFile::empty(priority))
    }

    pub fn save(&self, priority: Priority, mut queue: QueueFile) -> Result<()> {
        queue.last_updated = Some(Utc::now());
        std::fs::write(self.path(priority), serde_json::to_string_pretty(&queue)?)?;
        Ok(())
    }

    /// Append a pending task to a queue.
    pub fn enqueue(&self, priority: Priority, task: EvolutionTask) -> Result<String> {
        let id = task.id.clone();
        let mut queue = self.load(priority);
        queue.tasks.push(task);
        self.save(priority, queue)?;
        Ok(id)
    }

    /// First pending task in a queue, if any.
    pub fn next_pending(&self, priority: Priority) -> Option<EvolutionTask> {
        self.load(priority)
            .tasks
            .iter()
            .find(|t| t.status == EvolutionTaskStatus::Pending)
            .cloned()
    }

    /// Move a task from pending to processing, stamping assignment.
    pub fn move_to_processing(&self, priority: Priority, task_id: &str) -> Result<bool> {
        let mut queue = self.load(priority);
        let Some(pos) = queue.tasks.iter().position(|t| t.id == task_id) else {
            return Ok(false);
        };

        let mut task = queue.tasks.remove(pos);
        task.status = EvolutionTaskStatus::Processing;
        task.assigned_to = Some("evolution-scheduler".to_string());
        task.started_at = Some(Utc::now());
        queue.processing.push(task);

        self.save(priority, queue)?;
        Ok(true)
    }

    /// Move a task from processing to completed with its result.
    pub fn complete(&self, priority: Priority, task_id: &str, result: Value) -> Result<bool> {
        let mut queue = self.load(priority);
        let Some(pos) = queue.processing.iter().position(|t| t.id == task_id) else {
            return Ok(false);
        };

        let mut task = queue.processing.remove(pos);
        let success = result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        task.status = if success {
            EvolutionTaskStatus::Completed
        } else {
            EvolutionTaskStatus::Failed
        };
        task.completed_at = Some(Utc::now());
        task.result = Some(result);
        queue.completed.push(task);

        self.save(priority, queue)?;
        Ok(true)
    }

    /// Bucket counts for every priority.
    pub fn stats(&self) -> Vec<(Priority, QueueStats)> {
        Priority::ORDER
            .iter()
            .map(|&p| {
                let queue = self.load(p);
                (
                    p,
                    QueueStats {
                        pending: queue.tasks.len(),
                        processing: queue.processing.len(),
                        completed: queue.completed.len(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn task(action: &str) -> EvolutionTask {
        EvolutionTask::new(
            "knowledge-update",
            EvolutionPayload {
                action: action.to_string(),
                target: "docs".to_string(),
                source: String::new(),
            },
        )
    }

    #[test]
    fn test_enqueue_and_next_pending() -> Result<()> {
        let dir = TempDir::new()?;
        let queues = EvolutionQueue::new(dir.path())?;

        let id = queues.enqueue(Priority::P1, task("refresh"))?;
        let next = queues.next_pending(Priority::P1).expect("pending");
        assert_eq!(next.id, id);
        assert!(queues.next_pending(Priority::P2).is_none());
        Ok(())
    }

    #[test]
    fn test_task_conservation_across_cycle() -> Result<()> {
        let dir = TempDir::new()?;
        let queues = EvolutionQueue::new(dir.path())?;

        let id = queues.enqueue(Priority::P2, task("train"))?;
        let before = queues.load(Priority::P2).total();

        assert!(queues.move_to_processing(Priority::P2, &id)?);
        assert_eq!(queues.load(Priority::P2).total(), before);

        assert!(queues.complete(Priority::P2, &id, json!({"success": true}))?);
        let after = queues.load(Priority::P2);
        assert_eq!(after.total(), before);
        assert_eq!(after.completed.len(), 1);
        assert_eq!(after.completed[0].status, EvolutionTaskStatus::Completed);
        assert!(after.completed[0].completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_processing_stamps_assignment() -> Result<()> {
        let dir = TempDir::new()?;
        let queues = EvolutionQueue::new(dir.path())?;

        let id = queues.enqueue(Priority::P3, task("explore"))?;
        queues.move_to_processing(Priority::P3, &id)?;

        let queue = queues.load(Priority::P3);
        assert_eq!(queue.processing.len(), 1);
        assert_eq!(
            queue.processing[0].assigned_to.as_deref(),
            Some("evolution-scheduler")
        );
        assert!(queue.processing[0].started_at.is_some());
        Ok(())
    }

    #[test]
    fn test_failed_result_marks_failed() -> Result<()> {
        let dir = TempDir::new()?;
        let queues = EvolutionQueue::new(dir.path())?;

        let id = queues.enqueue(Priority::P4, task("draft"))?;
        queues.move_to_processing(Priority::P4, &id)?;
        queues.complete(Priority::P4, &id, json!({"success": false, "error": "timeout"}))?;

        let queue = queues.load(Priority::P4);
        assert_eq!(queue.completed[0].status, EvolutionTaskStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_unknown_ids_are_noops() -> Result<()> {
        let dir = TempDir::new()?;
        let queues = EvolutionQueue::new(dir.path())?;
        assert!(!queues.move_to_processing(Priority::P1, "ghost")?);
        assert!(!queues.complete(Priority::P1, "ghost", json!({}))?);
        Ok(())
    }
}
