//! External executor seam
//!
//! The evolution scheduler hands composed task instructions to an executor
//! that actually drives an agent. The reference implementation shells out to
//! an external agent CLI; tests inject in-process fakes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Result of one external execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    pub returncode: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            returncode: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            executed_at: Utc::now(),
        }
    }
}

/// Contract for dispatching a composed instruction to an agent.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, agent_id: &str, message: &str) -> Result<ExecutionOutcome>;
}

/// Executor that invokes an external agent CLI as a subprocess.
///
/// The command is invoked as `<program> agent --agent <id> --message <msg>
/// --json`; timeouts are enforced by the caller (the scheduler), which kills
/// the future rather than the child.
pub struct CommandExecutor {
    program: String,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, agent_id: &str, message: &str) -> Result<ExecutionOutcome> {
        let output = Command::new(&self.program)
            .arg("agent")
            .arg("--agent")
            .arg(agent_id)
            .arg("--message")
            .arg(message)
            .arg("--json")
            .output()
            .await?;

        Ok(ExecutionOutcome {
            success: output.status.success(),
            returncode: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
            executed_at: Utc::now(),
        })
    }
}
