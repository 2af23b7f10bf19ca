//! Tool-Chain Runtime
//!
//! Declarative pipelines of tool invocations with template-resolved
//! parameters, per-step conditions and error handling, and a parallel
//! variant that infers a DAG from data references.

pub mod chain;
pub mod parallel;
pub mod template;

pub use chain::{ChainResult, ChainRunner, ChainSpec, ErrorHandling, StepRecord, StepSpec};
pub use parallel::ParallelChainRunner;
pub use template::TemplateContext;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    pub summary: String,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn success(data: impl Into<Value>, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
            summary: summary.into(),
            error: None,
        }
    }

    pub fn success_str(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            success: true,
            summary: content.clone(),
            data: Value::String(content),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            data: Value::Null,
            summary: format!("Error: {}", error),
            error: Some(error),
        }
    }
}

/// Trait for tools invocable from chains and the ReAct executor.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> String;

    fn description(&self) -> String;

    async fn execute(&self, params: Value) -> Result<ToolOutput>;
}

/// Registry of available tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().await.insert(tool.name(), tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a tool by name. An unknown tool is an error; a tool-level
    /// failure is a `ToolOutput` with `success: false`.
    pub async fn invoke(&self, name: &str, params: Value) -> Result<ToolOutput> {
        let Some(tool) = self.get(name).await else {
            anyhow::bail!("unknown tool: {}", name);
        };
        tool.execute(params).await
    }

    /// Tool list formatted for prompt injection.
    pub async fn describe_all(&self) -> String {
        let tools = self.tools.read().await;
        let mut lines: Vec<String> = tools
            .values()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

/// Tool that echoes its params back; handy default and test double.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> String {
        "echo".to_string()
    }

    fn description(&self) -> String {
        "Returns its parameters unchanged".to_string()
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput> {
        Ok(ToolOutput::success(json!({"echo": params}), "echoed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_register_and_invoke() -> Result<()> {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        assert_eq!(registry.names().await, vec!["echo"]);
        let output = registry.invoke("echo", json!({"a": 1})).await?;
        assert!(output.success);
        assert_eq!(output.data["echo"]["a"], 1);

        assert!(registry.invoke("missing", json!({})).await.is_err());
        Ok(())
    }
}
