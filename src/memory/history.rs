//! L2 Task History - SQLite-backed task and decision records
//!
//! Persistent history with derived per-agent statistics. The stats row is
//! recomputed inside the same transaction as the task insert so readers
//! never observe a task without its stats update.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::task;
use uuid::Uuid;

/// Lifecycle states for a coordinated task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Validating,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Archived
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "planning" => Some(TaskStatus::Planning),
            "executing" => Some(TaskStatus::Executing),
            "validating" => Some(TaskStatus::Validating),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "archived" => Some(TaskStatus::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Validating => "validating",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// One task as recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub score: Option<f64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            task_type: None,
            description: None,
            status: Some(TaskStatus::Pending),
            score: None,
            created: now,
            updated: now,
            completed: None,
            result: None,
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// One recorded decision, linked to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub id: String,
    pub task_id: Option<String>,
    pub agent_id: String,
    pub decision: String,
    pub reasoning: Option<String>,
    pub outcome: Option<String>,
    pub created: DateTime<Utc>,
}

/// Derived per-agent statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub agent_id: String,
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub avg_score: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// SQLite task history store.
#[derive(Clone)]
pub struct TaskHistory {
    db_path: PathBuf,
}

impl TaskHistory {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    type TEXT,
                    description TEXT,
                    status TEXT,
                    score REAL,
                    created TEXT NOT NULL,
                    updated TEXT NOT NULL,
                    completed TEXT,
                    result TEXT,
                    metadata TEXT
                );

                CREATE TABLE IF NOT EXISTS decisions (
                    id TEXT PRIMARY KEY,
                    task_id TEXT,
                    agent_id TEXT NOT NULL,
                    decision TEXT NOT NULL,
                    reasoning TEXT,
                    outcome TEXT,
                    created TEXT NOT NULL,
                    FOREIGN KEY (task_id) REFERENCES tasks(id)
                );

                CREATE TABLE IF NOT EXISTS agent_stats (
                    agent_id TEXT PRIMARY KEY,
                    total_tasks INTEGER DEFAULT 0,
                    successful_tasks INTEGER DEFAULT 0,
                    avg_score REAL DEFAULT 0,
                    last_activity TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(type);
                CREATE INDEX IF NOT EXISTS idx_decisions_agent ON decisions(agent_id);
                CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions(task_id);
                "#,
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    /// Record (or replace) a task and recompute the agent's stats row in the
    /// same transaction.
    pub async fn record_task(&self, record: TaskRecord) -> Result<()> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR REPLACE INTO tasks
                 (id, agent_id, type, description, status, score, created, updated, completed, result, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    &record.id,
                    &record.agent_id,
                    &record.task_type,
                    &record.description,
                    record.status.map(|s| s.to_string()),
                    record.score,
                    record.created.to_rfc3339(),
                    record.updated.to_rfc3339(),
                    record.completed.map(|t| t.to_rfc3339()),
                    record
                        .result
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    record
                        .metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )?;

            // Recompute stats for this agent from the tasks table.
            let (total, successful): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END)
                 FROM tasks WHERE agent_id = ?1",
                params![&record.agent_id],
                |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0))),
            )?;
            let avg_score: f64 = tx
                .query_row(
                    "SELECT AVG(score) FROM tasks WHERE agent_id = ?1 AND score IS NOT NULL",
                    params![&record.agent_id],
                    |row| row.get::<_, Option<f64>>(0),
                )?
                .unwrap_or(0.0);

            tx.execute(
                "INSERT INTO agent_stats (agent_id, total_tasks, successful_tasks, avg_score, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     total_tasks = excluded.total_tasks,
                     successful_tasks = excluded.successful_tasks,
                     avg_score = excluded.avg_score,
                     last_activity = excluded.last_activity",
                params![
                    &record.agent_id,
                    total,
                    successful,
                    avg_score,
                    Utc::now().to_rfc3339()
                ],
            )?;

            tx.commit()?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn record_decision(&self, decision: DecisionRecord) -> Result<()> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT OR REPLACE INTO decisions
                 (id, task_id, agent_id, decision, reasoning, outcome, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &decision.id,
                    &decision.task_id,
                    &decision.agent_id,
                    &decision.decision,
                    &decision.reasoning,
                    &decision.outcome,
                    decision.created.to_rfc3339(),
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// Convenience wrapper allocating the decision id.
    pub async fn record_decision_for(
        &self,
        task_id: Option<&str>,
        agent_id: &str,
        decision: &str,
        reasoning: Option<&str>,
        outcome: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.record_decision(DecisionRecord {
            id: id.clone(),
            task_id: task_id.map(String::from),
            agent_id: agent_id.to_string(),
            decision: decision.to_string(),
            reasoning: reasoning.map(String::from),
            outcome: outcome.map(String::from),
            created: Utc::now(),
        })
        .await?;
        Ok(id)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let path = self.db_path.clone();
        let id = task_id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let row = conn
                .query_row(
                    "SELECT id, agent_id, type, description, status, score, created, updated, completed, result, metadata
                     FROM tasks WHERE id = ?1",
                    params![&id],
                    row_to_task,
                )
                .optional()?;
            Ok::<_, anyhow::Error>(row)
        })
        .await?
    }

    pub async fn get_agent_history(&self, agent_id: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let path = self.db_path.clone();
        let agent = agent_id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, type, description, status, score, created, updated, completed, result, metadata
                 FROM tasks WHERE agent_id = ?1 ORDER BY created DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![&agent, limit as i64], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }

    pub async fn get_recent_tasks(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let rows = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, agent_id, type, description, status, score, created, updated, completed, result, metadata
                         FROM tasks WHERE status = ?1 ORDER BY created DESC LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![status.to_string(), limit as i64], row_to_task)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, agent_id, type, description, status, score, created, updated, completed, result, metadata
                         FROM tasks ORDER BY created DESC LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![limit as i64], row_to_task)?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }

    pub async fn get_agent_stats(&self, agent_id: &str) -> Result<Option<AgentStats>> {
        let path = self.db_path.clone();
        let agent = agent_id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let row = conn
                .query_row(
                    "SELECT agent_id, total_tasks, successful_tasks, avg_score, last_activity
                     FROM agent_stats WHERE agent_id = ?1",
                    params![&agent],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;
            let stats = row.map(|(agent_id, total, successful, avg, last)| AgentStats {
                agent_id,
                total_tasks: total,
                successful_tasks: successful,
                avg_score: avg,
                last_activity: last.and_then(|s| parse_rfc3339(&s)),
            });
            Ok::<_, anyhow::Error>(stats)
        })
        .await?
    }

    pub async fn search_tasks(&self, query: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let path = self.db_path.clone();
        let pattern = format!("%{}%", query);

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, agent_id, type, description, status, score, created, updated, completed, result, metadata
                 FROM tasks WHERE description LIKE ?1 ORDER BY created DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![&pattern, limit as i64], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok::<_, anyhow::Error>(rows)
        })
        .await?
    }

    pub async fn get_decisions_for_task(&self, task_id: &str) -> Result<Vec<DecisionRecord>> {
        let path = self.db_path.clone();
        let id = task_id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, task_id, agent_id, decision, reasoning, outcome, created
                 FROM decisions WHERE task_id = ?1 ORDER BY created ASC",
            )?;
            let rows = stmt
                .query_map(params![&id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let decisions = rows
                .into_iter()
                .map(
                    |(id, task_id, agent_id, decision, reasoning, outcome, created)| DecisionRecord {
                        id,
                        task_id,
                        agent_id,
                        decision,
                        reasoning,
                        outcome,
                        created: parse_rfc3339(&created).unwrap_or_else(Utc::now),
                    },
                )
                .collect();
            Ok::<_, anyhow::Error>(decisions)
        })
        .await?
    }

    /// Database file size in bytes.
    pub async fn db_size(&self) -> u64 {
        tokio::fs::metadata(&self.db_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Reclaim space after L2 compression deletes.
    pub async fn vacuum(&self) -> Result<()> {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute("VACUUM", [])?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// Delete low-importance aged tasks (importance < 0.3 in metadata AND
    /// older than `max_age_days`). The only deletion path in L2.
    pub async fn compress(&self, max_age_days: i64) -> Result<usize> {
        let path = self.db_path.clone();
        let cutoff = (Utc::now() - chrono::Duration::days(max_age_days)).to_rfc3339();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare("SELECT id, metadata FROM tasks WHERE created < ?1")?;
            let candidates = stmt
                .query_map(params![&cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut removed = 0usize;
            for (id, metadata) in candidates {
                let importance = metadata
                    .and_then(|m| serde_json::from_str::<Value>(&m).ok())
                    .and_then(|v| v.get("importance").and_then(Value::as_f64))
                    .unwrap_or(0.5);
                if importance < 0.3 {
                    conn.execute("DELETE FROM tasks WHERE id = ?1", params![&id])?;
                    removed += 1;
                }
            }
            Ok::<_, anyhow::Error>(removed)
        })
        .await?
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: Option<String> = row.get(4)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    let completed: Option<String> = row.get(8)?;
    let result: Option<String> = row.get(9)?;
    let metadata: Option<String> = row.get(10)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_type: row.get(2)?,
        description: row.get(3)?,
        status: status.as_deref().and_then(TaskStatus::parse),
        score: row.get(5)?,
        created: parse_rfc3339(&created).unwrap_or_else(Utc::now),
        updated: parse_rfc3339(&updated).unwrap_or_else(Utc::now),
        completed: completed.as_deref().and_then(parse_rfc3339),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
    })
}
