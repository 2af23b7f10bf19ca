//! Evolution scheduler - idle-time self-improvement dispatch
//!
//! Runs a periodic check cycle: if the system has been idle long enough,
//! drain the priority queues P1..P4 one task per cycle, hand the composed
//! instruction to the external executor, and record the outcome in the
//! queues, the per-priority stats, and memory. Executor failures never
//! crash the loop.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::queue::{EvolutionQueue, EvolutionTask, Priority};
use crate::exec::{ExecutionOutcome, TaskExecutor};
use crate::memory::{MemoryManager, TaskRecord, TaskStatus};

const TIMEOUT_ERROR: &str = "Task execution timed out";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_tasks_processed: u64,
    pub p1_completed: u64,
    pub p2_completed: u64,
    pub p3_completed: u64,
    pub p4_completed: u64,
}

impl SchedulerStats {
    fn bump(&mut self, priority: Priority) {
        self.total_tasks_processed += 1;
        match priority {
            Priority::P1 => self.p1_completed += 1,
            Priority::P2 => self.p2_completed += 1,
            Priority::P3 => self.p3_completed += 1,
            Priority::P4 => self.p4_completed += 1,
        }
    }
}

/// Persisted scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    pub version: String,
    pub status: String,
    pub last_check: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: SchedulerStats,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            status: "active".to_string(),
            last_check: None,
            last_activity: Some(Utc::now()),
            stats: SchedulerStats::default(),
        }
    }
}

/// Maps an evolution task type to the agent that should run it.
fn agent_for_task(task_type: &str) -> &'static str {
    match task_type {
        "knowledge-update" => "platform-pm",
        "skill-training" | "capability-training" => "coding-pm",
        "domain-exploration" => "research-pm",
        "soul-draft" => "platform-pm",
        _ => "gm",
    }
}

/// Compose the instruction string handed to the external executor.
fn compose_instruction(task: &EvolutionTask) -> String {
    let payload = &task.payload;
    let action = if payload.action.is_empty() {
        "execute"
    } else {
        &payload.action
    };
    let mut message = format!(
        "[Evolution Task: {}]\nType: {}\nAction: {}\nTarget: {}\nSource: {}\n\nPlease perform the '{}' action for the evolution system.",
        task.id,
        task.task_type,
        action,
        if payload.target.is_empty() { "not specified" } else { &payload.target },
        if payload.source.is_empty() { "not specified" } else { &payload.source },
        action,
    );
    if !payload.target.is_empty() {
        message.push_str(&format!("\nFocus on: {}", payload.target));
    }
    message
}

/// The idle-time scheduler over the evolution queues.
pub struct EvolutionScheduler {
    queues: EvolutionQueue,
    state_file: PathBuf,
    state: Mutex<SchedulerState>,
    executor: Arc<dyn TaskExecutor>,
    memory: Option<Arc<MemoryManager>>,
    check_interval: Duration,
    idle_threshold: Duration,
    exec_timeout: Duration,
    shutdown: AtomicBool,
}

impl EvolutionScheduler {
    pub fn new(
        queue_dir: impl AsRef<Path>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        let queues = EvolutionQueue::new(&queue_dir)?;
        let state_file = queue_dir.as_ref().join("scheduler-state.json");
        let state = std::fs::read_to_string(&state_file)
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
            .unwrap_or_default();

        Ok(Self {
            queues,
            state_file,
            state: Mutex::new(state),
            executor,
            memory: None,
            check_interval: Duration::from_secs(900),
            idle_threshold: Duration::from_secs(900),
            exec_timeout: Duration::from_secs(300),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn queues(&self) -> &EvolutionQueue {
        &self.queues
    }

    async fn save_state(&self) -> Result<()> {
        let state = self.state.lock().await;
        std::fs::write(&self.state_file, serde_json::to_string_pretty(&*state)?)?;
        Ok(())
    }

    /// Real-task arrival: push back the idle window.
    pub async fn note_activity(&self) {
        self.state.lock().await.last_activity = Some(Utc::now());
        let _ = self.save_state().await;
    }

    /// Idle iff the last recorded activity is older than the threshold.
    pub async fn check_idle(&self) -> bool {
        let state = self.state.lock().await;
        match state.last_activity {
            Some(last) => {
                let idle = Utc::now() - last;
                idle.num_seconds() > self.idle_threshold.as_secs() as i64
            }
            None => true,
        }
    }

    /// One scheduling decision: if idle, claim the first pending task in
    /// priority order and move it to processing. Returns `None` when the
    /// system is busy or every queue is drained.
    pub async fn run_cycle(&self) -> Result<Option<(Priority, EvolutionTask)>> {
        {
            let mut state = self.state.lock().await;
            state.last_check = Some(Utc::now());
        }
        self.save_state().await?;

        if !self.check_idle().await {
            return Ok(None);
        }

        for priority in Priority::ORDER {
            if let Some(task) = self.queues.next_pending(priority) {
                if self.queues.move_to_processing(priority, &task.id)? {
                    info!(task = %task.id, %priority, "claimed evolution task");
                    return Ok(Some((priority, task)));
                }
            }
        }
        Ok(None)
    }

    /// Execute a claimed task with the wall-clock timeout.
    pub async fn execute_task(&self, task: &EvolutionTask) -> ExecutionOutcome {
        let agent = agent_for_task(&task.task_type);
        let instruction = compose_instruction(task);

        let outcome = match timeout(
            self.exec_timeout,
            self.executor.execute(agent, &instruction),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(task = %task.id, error = %e, "executor error");
                ExecutionOutcome::failure(e.to_string())
            }
            Err(_) => {
                warn!(task = %task.id, "executor timed out");
                ExecutionOutcome::failure(TIMEOUT_ERROR)
            }
        };

        // Record the outcome in memory; a memory failure must not fail the
        // scheduler.
        if let Some(memory) = &self.memory {
            let record = TaskRecord::new(task.id.clone(), agent)
                .with_type(task.task_type.clone())
                .with_description(instruction)
                .with_status(if outcome.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                });
            let output: String = outcome.stdout.chars().take(500).collect();
            let status = if outcome.success { "completed" } else { "failed" };
            let result = json!({
                "status": status,
                "output": output,
                "error": outcome.error,
            });
            let receipt = memory.store_task_result(&record, &result, "evolution").await;
            if !receipt.l2 {
                warn!(task = %task.id, "failed to store evolution result in memory");
            }
        }

        outcome
    }

    /// Full cycle: claim, execute, complete, bump stats. Swallows per-task
    /// errors so the caller's loop keeps running.
    pub async fn process_once(&self) -> Result<Option<(Priority, EvolutionTask, ExecutionOutcome)>> {
        let Some((priority, task)) = self.run_cycle().await? else {
            return Ok(None);
        };

        let outcome = self.execute_task(&task).await;
        let completed = self
            .queues
            .complete(priority, &task.id, serde_json::to_value(&outcome)?)?;
        if !completed {
            warn!(task = %task.id, "task missing from processing bucket");
        }

        {
            let mut state = self.state.lock().await;
            state.stats.bump(priority);
        }
        self.save_state().await?;

        Ok(Some((priority, task, outcome)))
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.state.lock().await.stats.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Daemon loop. SIGINT/SIGTERM flip the shutdown flag; sleep happens in
    /// one-second slices so shutdown latency stays at or under a second.
    pub async fn run_daemon(self: Arc<Self>) -> Result<()> {
        let signal_target = Arc::clone(&self);
        tokio::spawn(async move {
            if wait_for_shutdown_signal().await.is_ok() {
                info!("shutdown signal received");
                signal_target.request_shutdown();
            }
        });

        info!(interval = ?self.check_interval, "evolution scheduler started");
        let mut cycle: u64 = 0;

        while !self.shutdown_requested() {
            cycle += 1;
            match self.process_once().await {
                Ok(Some((priority, task, outcome))) => {
                    info!(
                        cycle,
                        task = %task.id,
                        %priority,
                        success = outcome.success,
                        "evolution task finished"
                    );
                }
                Ok(None) => {
                    info!(cycle, "no pending tasks or system not idle");
                }
                Err(e) => {
                    // Never crash the daemon on a cycle error.
                    error!(cycle, error = %e, "cycle failed");
                }
            }

            let slices = self.check_interval.as_secs().max(1);
            for _ in 0..slices {
                if self.shutdown_requested() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        info!("evolution scheduler stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::queue::{EvolutionPayload, EvolutionTaskStatus};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct RecordingExecutor {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, _agent_id: &str, message: &str) -> Result<ExecutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(message.contains("[Evolution Task:"));
            Ok(ExecutionOutcome {
                success: self.succeed,
                returncode: Some(if self.succeed { 0 } else { 1 }),
                stdout: "ran".to_string(),
                stderr: String::new(),
                error: None,
                executed_at: Utc::now(),
            })
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl TaskExecutor for HangingExecutor {
        async fn execute(&self, _agent_id: &str, _message: &str) -> Result<ExecutionOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    fn evo_task(task_type: &str) -> EvolutionTask {
        EvolutionTask::new(
            task_type,
            EvolutionPayload {
                action: "refresh".to_string(),
                target: "docs".to_string(),
                source: String::new(),
            },
        )
    }

    async fn idle_scheduler(
        dir: &TempDir,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<EvolutionScheduler> {
        let scheduler = EvolutionScheduler::new(dir.path().join("queue"), executor)?
            .with_idle_threshold(Duration::from_secs(0));
        // Backdate activity so the zero threshold counts as idle.
        scheduler.state.lock().await.last_activity =
            Some(Utc::now() - chrono::Duration::seconds(10));
        Ok(scheduler)
    }

    #[tokio::test]
    async fn test_empty_queues_yield_none() -> Result<()> {
        let dir = TempDir::new()?;
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let scheduler = idle_scheduler(&dir, executor).await?;
        assert!(scheduler.process_once().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_priority_order_p1_first() -> Result<()> {
        let dir = TempDir::new()?;
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let scheduler = idle_scheduler(&dir, executor).await?;

        scheduler.queues().enqueue(Priority::P3, evo_task("domain-exploration"))?;
        scheduler.queues().enqueue(Priority::P1, evo_task("knowledge-update"))?;

        let (priority, task) = scheduler.run_cycle().await?.expect("task claimed");
        assert_eq!(priority, Priority::P1);
        assert_eq!(task.task_type, "knowledge-update");
        Ok(())
    }

    #[tokio::test]
    async fn test_busy_system_yields_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let scheduler = EvolutionScheduler::new(dir.path().join("queue"), executor)?
            .with_idle_threshold(Duration::from_secs(900));
        scheduler.queues().enqueue(Priority::P1, evo_task("knowledge-update"))?;

        scheduler.note_activity().await;
        assert!(!scheduler.check_idle().await);
        assert!(scheduler.run_cycle().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_process_once_completes_and_bumps_stats() -> Result<()> {
        let dir = TempDir::new()?;
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let scheduler = idle_scheduler(&dir, Arc::clone(&executor) as Arc<dyn TaskExecutor>).await?;
        let id = scheduler
            .queues()
            .enqueue(Priority::P2, evo_task("capability-training"))?;

        let (priority, task, outcome) = scheduler.process_once().await?.expect("processed");
        assert_eq!(priority, Priority::P2);
        assert_eq!(task.id, id);
        assert!(outcome.success);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let queue = scheduler.queues().load(Priority::P2);
        assert!(queue.tasks.is_empty());
        assert!(queue.processing.is_empty());
        assert_eq!(queue.completed.len(), 1);
        assert_eq!(queue.completed[0].status, EvolutionTaskStatus::Completed);

        let stats = scheduler.stats().await;
        assert_eq!(stats.total_tasks_processed, 1);
        assert_eq!(stats.p2_completed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() -> Result<()> {
        let dir = TempDir::new()?;
        let scheduler = idle_scheduler(&dir, Arc::new(HangingExecutor))
            .await?
            .with_exec_timeout(Duration::from_millis(50));
        let id = scheduler
            .queues()
            .enqueue(Priority::P1, evo_task("knowledge-update"))?;

        let (_, _, outcome) = scheduler.process_once().await?.expect("processed");
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(TIMEOUT_ERROR));

        let queue = scheduler.queues().load(Priority::P1);
        assert_eq!(queue.completed.len(), 1);
        assert_eq!(queue.completed[0].status, EvolutionTaskStatus::Failed);
        assert_eq!(queue.completed[0].id, id);
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_mapping() {
        assert_eq!(agent_for_task("knowledge-update"), "platform-pm");
        assert_eq!(agent_for_task("skill-training"), "coding-pm");
        assert_eq!(agent_for_task("domain-exploration"), "research-pm");
        assert_eq!(agent_for_task("soul-draft"), "platform-pm");
        assert_eq!(agent_for_task("anything-else"), "gm");
    }

    #[tokio::test]
    async fn test_state_persists_across_restart() -> Result<()> {
        let dir = TempDir::new()?;
        let executor: Arc<dyn TaskExecutor> = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
            succeed: true,
        });

        {
            let scheduler = idle_scheduler(&dir, Arc::clone(&executor)).await?;
            scheduler.queues().enqueue(Priority::P1, evo_task("knowledge-update"))?;
            scheduler.process_once().await?;
        }

        let reloaded = EvolutionScheduler::new(dir.path().join("queue"), executor)?;
        assert_eq!(reloaded.stats().await.total_tasks_processed, 1);
        Ok(())
    }
}
