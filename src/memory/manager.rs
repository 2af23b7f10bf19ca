//! Memory Manager - façade over the four memory tiers
//!
//! Encodes the write-through policy: task results fan out to L1 (session),
//! L2 (history), and L3 (experience); L4 archiving is explicit.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use super::experience::{Experience, ExperienceStore};
use super::history::{AgentStats, TaskHistory, TaskRecord, TaskStatus};
use super::session::{SessionExport, SessionMemory};
use super::snapshot::SnapshotRepo;
use crate::config::CoreConfig;

/// Per-layer success flags for a write-through store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReceipt {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub l1: bool,
    pub l2: bool,
    /// Experience id when the L3 write succeeded.
    pub l3: Option<String>,
}

/// Aggregated context for one agent from L2 + L3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub session_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<TaskRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<AgentStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiences: Option<Vec<Experience>>,
}

/// Result of archiving the session to L4.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReceipt {
    pub file_path: std::path::PathBuf,
    pub task_count: usize,
    pub context_keys: usize,
}

/// Unified memory manager coordinating all four tiers.
pub struct MemoryManager {
    session_id: String,
    session: Mutex<SessionMemory>,
    history: TaskHistory,
    experiences: Arc<ExperienceStore>,
    snapshot: SnapshotRepo,
}

impl MemoryManager {
    pub async fn new(session_id: impl Into<String>, config: &CoreConfig) -> Result<Self> {
        Self::with_paths(
            session_id,
            config.history_db_path(),
            config.experience_dir(),
            config.snapshot_repo(),
        )
        .await
    }

    pub async fn with_paths(
        session_id: impl Into<String>,
        history_db: impl AsRef<Path>,
        experience_dir: impl AsRef<Path>,
        snapshot_repo: impl AsRef<Path>,
    ) -> Result<Self> {
        let session_id = session_id.into();
        Ok(Self {
            session: Mutex::new(SessionMemory::new(session_id.clone())),
            history: TaskHistory::new(history_db).await?,
            experiences: Arc::new(ExperienceStore::new(experience_dir)?),
            snapshot: SnapshotRepo::new(snapshot_repo)?,
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &TaskHistory {
        &self.history
    }

    pub fn experiences(&self) -> Arc<ExperienceStore> {
        Arc::clone(&self.experiences)
    }

    pub fn snapshot(&self) -> &SnapshotRepo {
        &self.snapshot
    }

    // === L1 session operations ===

    pub async fn set_context(&self, key: &str, value: Value, metadata: Option<Value>) -> bool {
        self.session.lock().await.store(key, value, metadata)
    }

    pub async fn get_context(&self, key: &str) -> Option<Value> {
        self.session.lock().await.retrieve(key).cloned()
    }

    pub async fn clear_session(&self) {
        self.session.lock().await.clear();
    }

    pub async fn export_session(&self) -> SessionExport {
        self.session.lock().await.export()
    }

    // === L2 history operations ===

    pub async fn record_task(&self, record: TaskRecord) -> Result<()> {
        self.history.record_task(record).await
    }

    pub async fn record_decision(
        &self,
        task_id: Option<&str>,
        agent_id: &str,
        decision: &str,
        reasoning: Option<&str>,
        outcome: Option<&str>,
    ) -> Result<String> {
        self.history
            .record_decision_for(task_id, agent_id, decision, reasoning, outcome)
            .await
    }

    pub async fn get_task_history(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.history.get_task(task_id).await
    }

    pub async fn get_agent_history(&self, agent_id: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        self.history.get_agent_history(agent_id, limit).await
    }

    pub async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        self.history.get_agent_stats(agent_id).await
    }

    // === L3 experience operations ===

    pub fn store_experience(
        &self,
        agent_id: &str,
        experience: &str,
        experience_type: &str,
        metadata: Option<Value>,
        score: Option<f64>,
    ) -> Result<String> {
        self.experiences
            .store_experience(agent_id, experience, experience_type, metadata, score)
    }

    /// Keyword search when keywords are given, recency otherwise.
    pub fn retrieve_experiences(
        &self,
        agent_id: &str,
        keywords: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Experience>> {
        match keywords {
            Some(keywords) if !keywords.is_empty() => Ok(self
                .experiences
                .search_by_keywords(keywords, limit, Some(agent_id))?
                .into_iter()
                .map(|m| m.experience)
                .collect()),
            _ => self.experiences.retrieve_recent(agent_id, limit, None),
        }
    }

    // === L4 snapshot operations ===

    /// Route an export to the right snapshot partition by kind:
    /// experiences, session, lessons, or agent.
    pub fn export_to_snapshot(&self, kind: &str, data: &Value) -> Result<std::path::PathBuf> {
        match kind {
            "experiences" => {
                let items = data.as_array().cloned().unwrap_or_default();
                self.snapshot.export_experiences(&items)
            }
            "session" => {
                let session_id = data
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.session_id)
                    .to_string();
                self.snapshot.export_session_archive(&session_id, data)
            }
            "lessons" => {
                let items = data.as_array().cloned().unwrap_or_default();
                self.snapshot.export_lessons_learned(&items)
            }
            "agent" => {
                let agent_id = data
                    .get("agentId")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                self.snapshot.export_agent_summary(&agent_id, data)
            }
            other => Err(anyhow::anyhow!("unknown export kind: {}", other)),
        }
    }

    pub async fn sync_snapshot(&self, message: Option<&str>) -> Result<super::snapshot::SyncOutcome> {
        self.snapshot.sync(message).await
    }

    // === Unified operations ===

    /// Main write-through entry point: L1 under the task id, L2 record with
    /// completion, L3 as a formatted experience. Failures in one layer do
    /// not block the others; the receipt carries per-layer outcomes.
    pub async fn store_task_result(
        &self,
        task: &TaskRecord,
        result: &Value,
        experience_type: &str,
    ) -> StoreReceipt {
        let l1 = self
            .session
            .lock()
            .await
            .store(task.id.clone(), result.clone(), None);

        let status = result
            .get("status")
            .and_then(Value::as_str)
            .and_then(TaskStatus::parse)
            .or(task.status);
        let score = result.get("score").and_then(Value::as_f64).or(task.score);

        let mut record = task.clone();
        record.status = status;
        record.score = score;
        record.result = Some(result.clone());
        record.updated = Utc::now();
        record.completed = Some(Utc::now());

        let l2 = match self.history.record_task(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "L2 record failed");
                false
            }
        };

        let experience = format_experience(task, result);
        let l3 = match self
            .experiences
            .store_experience(&task.agent_id, &experience, experience_type, None, score)
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "L3 store failed");
                None
            }
        };

        StoreReceipt {
            task_id: task.id.clone(),
            timestamp: Utc::now(),
            l1,
            l2,
            l3,
        }
    }

    /// Aggregate L2 history + stats and L3 recent experiences for an agent.
    pub async fn get_full_context(
        &self,
        agent_id: &str,
        include_history: bool,
        include_experiences: bool,
        history_limit: usize,
        experience_limit: usize,
    ) -> Result<AgentContext> {
        let (history, stats) = if include_history {
            (
                Some(self.history.get_agent_history(agent_id, history_limit).await?),
                self.history.get_agent_stats(agent_id).await?,
            )
        } else {
            (None, None)
        };

        let experiences = if include_experiences {
            Some(
                self.experiences
                    .retrieve_recent(agent_id, experience_limit, None)?,
            )
        } else {
            None
        };

        Ok(AgentContext {
            session_id: self.session_id.clone(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            history,
            stats,
            experiences,
        })
    }

    /// Archive the current session (L1 export + recent L2 tasks) to L4.
    pub async fn archive_session(&self) -> Result<ArchiveReceipt> {
        let export = self.session.lock().await.export();
        let context_keys = export.context.len();

        let recent = self.history.get_recent_tasks(100, None).await?;
        let task_count = recent.len();

        let archive = json!({
            "session": export,
            "recentTasks": recent,
        });
        let file_path = self
            .snapshot
            .export_session_archive(&self.session_id, &archive)?;

        Ok(ArchiveReceipt {
            file_path,
            task_count,
            context_keys,
        })
    }

    /// Combined statistics from every tier.
    pub async fn memory_stats(&self) -> Value {
        let (l1_keys, l1_size) = {
            let session = self.session.lock().await;
            (session.len(), session.size_estimate())
        };
        json!({
            "sessionId": self.session_id,
            "l1": {"keys": l1_keys, "sizeEstimate": l1_size},
            "l2": {"dbSize": self.history.db_size().await},
            "l3": self.experiences.stats(),
            "l4": self.snapshot.get_status().await,
        })
    }
}

fn format_experience(task: &TaskRecord, result: &Value) -> String {
    let mut parts = vec![
        format!(
            "Task: {}",
            task.description.as_deref().unwrap_or(task.id.as_str())
        ),
        format!("Agent: {}", task.agent_id),
        format!(
            "Status: {}",
            result
                .get("status")
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| task.status.map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown".to_string())
        ),
    ];

    if let Some(output) = result.get("output").and_then(Value::as_str) {
        let truncated: String = output.chars().take(200).collect();
        parts.push(format!("Result: {}", truncated));
    }
    if let Some(summary) = result.get("summary").and_then(Value::as_str) {
        parts.push(format!("Summary: {}", summary));
    }

    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> Result<MemoryManager> {
        MemoryManager::with_paths(
            "session-test",
            dir.path().join("l2/history.db"),
            dir.path().join("l3/experiences"),
            dir.path().join("github"),
        )
        .await
    }

    #[tokio::test]
    async fn test_store_task_result_fans_out() -> Result<()> {
        let dir = TempDir::new()?;
        let mgr = manager(&dir).await?;

        let task = TaskRecord::new("task-1", "gm").with_description("Test task");
        let result = json!({"status": "completed", "output": "Done", "score": 9.0});
        let receipt = mgr.store_task_result(&task, &result, "task").await;

        assert!(receipt.l1);
        assert!(receipt.l2);
        assert!(receipt.l3.is_some());

        // L1 holds the raw result under the task id.
        assert_eq!(mgr.get_context("task-1").await, Some(result.clone()));

        // L2 recorded completion.
        let stored = mgr.get_task_history("task-1").await?.expect("task in L2");
        assert_eq!(stored.status, Some(TaskStatus::Completed));
        assert!(stored.completed.is_some());
        assert_eq!(stored.score, Some(9.0));

        // L3 holds the formatted experience.
        let experiences = mgr.retrieve_experiences("gm", None, 10)?;
        assert_eq!(experiences.len(), 1);
        assert!(experiences[0].experience.contains("Task: Test task"));
        assert!(experiences[0].experience.contains("Status: completed"));
        Ok(())
    }

    #[tokio::test]
    async fn test_full_context_aggregates_layers() -> Result<()> {
        let dir = TempDir::new()?;
        let mgr = manager(&dir).await?;

        let task = TaskRecord::new("task-1", "gm").with_description("Ship feature");
        mgr.store_task_result(&task, &json!({"status": "completed"}), "task")
            .await;

        let ctx = mgr.get_full_context("gm", true, true, 20, 10).await?;
        assert_eq!(ctx.agent_id, "gm");
        assert_eq!(ctx.history.as_ref().map(|h| h.len()), Some(1));
        assert!(ctx.stats.is_some());
        assert_eq!(ctx.experiences.as_ref().map(|e| e.len()), Some(1));

        let bare = mgr.get_full_context("gm", false, false, 20, 10).await?;
        assert!(bare.history.is_none());
        assert!(bare.experiences.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_export_to_snapshot_dispatch() -> Result<()> {
        let dir = TempDir::new()?;
        let mgr = manager(&dir).await?;

        let path = mgr.export_to_snapshot("agent", &json!({"agentId": "gm", "utilityScore": 0.7}))?;
        assert!(path.to_string_lossy().contains("agents"));

        let path = mgr.export_to_snapshot("lessons", &json!([{"lesson": "x"}]))?;
        assert!(path.to_string_lossy().contains("lessons"));

        assert!(mgr.export_to_snapshot("bogus", &json!({})).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_session() -> Result<()> {
        let dir = TempDir::new()?;
        let mgr = manager(&dir).await?;

        mgr.set_context("key", json!("value"), None).await;
        mgr.record_task(TaskRecord::new("t1", "gm")).await?;

        let receipt = mgr.archive_session().await?;
        assert_eq!(receipt.context_keys, 1);
        assert_eq!(receipt.task_count, 1);
        assert!(receipt.file_path.exists());
        Ok(())
    }
}
