//! Parallel chain execution
//!
//! Infers a DAG from `${steps.X...}` references, groups steps into
//! topological levels, and runs each level concurrently on a bounded
//! worker pool. A failing step yields an error-marked output without
//! cancelling its level.

use anyhow::Result;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::debug;

use super::chain::{ChainResult, ChainSpec, StepRecord, StepStatus};
use super::template::{referenced_steps, TemplateContext};
use super::ToolRegistry;
use crate::error::CoreError;

const DEFAULT_POOL_SIZE: usize = 5;

/// Parallel chain runner with a bounded worker pool.
pub struct ParallelChainRunner {
    registry: Arc<ToolRegistry>,
    pool_size: usize,
}

impl ParallelChainRunner {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Group step ids into topological levels by inferred data dependency.
    /// A dependency cycle is a validation error rather than a hang.
    pub fn levels(chain: &ChainSpec) -> Result<Vec<Vec<String>>> {
        let ids: HashSet<&str> = chain.steps.iter().map(|s| s.id.as_str()).collect();

        let mut deps: HashMap<&str, HashSet<String>> = HashMap::new();
        for step in &chain.steps {
            let mut probe = vec![step.params.clone()];
            if let Some(condition) = &step.condition {
                probe.push(Value::String(condition.clone()));
            }
            let refs: HashSet<String> = referenced_steps(&Value::Array(probe))
                .into_iter()
                .filter(|r| ids.contains(r.as_str()))
                .collect();
            deps.insert(step.id.as_str(), refs);
        }

        let mut placed: HashSet<String> = HashSet::new();
        let mut levels: Vec<Vec<String>> = Vec::new();

        while placed.len() < chain.steps.len() {
            let ready: Vec<String> = chain
                .steps
                .iter()
                .filter(|s| !placed.contains(&s.id))
                .filter(|s| deps[s.id.as_str()].iter().all(|d| placed.contains(d)))
                .map(|s| s.id.clone())
                .collect();

            if ready.is_empty() {
                let stuck: Vec<String> = chain
                    .steps
                    .iter()
                    .filter(|s| !placed.contains(&s.id))
                    .map(|s| s.id.clone())
                    .collect();
                return Err(CoreError::validation(format!(
                    "dependency cycle among steps: {}",
                    stuck.join(", ")
                ))
                .into());
            }

            for id in &ready {
                placed.insert(id.clone());
            }
            levels.push(ready);
        }

        Ok(levels)
    }

    pub async fn run(&self, chain: &ChainSpec, input: Value, context: Value) -> Result<ChainResult> {
        let levels = Self::levels(chain)?;
        let steps: HashMap<&str, &super::chain::StepSpec> =
            chain.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut ctx = TemplateContext::new(input, context);
        let mut log = Vec::new();
        let mut any_failed = false;
        let semaphore = Arc::new(Semaphore::new(self.pool_size));

        for (level_index, level) in levels.iter().enumerate() {
            debug!(level = level_index, steps = level.len(), "running level");

            // Resolve params against the frozen context before spawning;
            // steps in one level only see earlier levels' outputs.
            let mut launches = Vec::new();
            for id in level {
                let step = steps[id.as_str()];

                if let Some(condition) = &step.condition {
                    if !ctx.eval_condition(condition) {
                        ctx.record_step(id, json!({"skipped": true}));
                        log.push(StepRecord {
                            step: id.clone(),
                            tool: step.tool.clone(),
                            status: StepStatus::Skipped,
                            reason: Some("Condition not met".to_string()),
                            error: None,
                            attempts: 0,
                            duration_ms: 0,
                        });
                        continue;
                    }
                }

                let params = ctx.resolve_value(&step.params);
                let registry = Arc::clone(&self.registry);
                let semaphore = Arc::clone(&semaphore);
                let id = id.clone();
                let tool = step.tool.clone();

                launches.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                    let started = Instant::now();
                    let outcome = registry.invoke(&tool, params).await;
                    (id, tool, outcome, started.elapsed().as_millis() as u64)
                }));
            }

            for joined in join_all(launches).await {
                let (id, tool, outcome, duration_ms) = joined.expect("worker task panicked");
                match outcome {
                    Ok(output) if output.success => {
                        ctx.record_step(&id, output.data);
                        log.push(StepRecord {
                            step: id,
                            tool,
                            status: StepStatus::Completed,
                            reason: None,
                            error: None,
                            attempts: 1,
                            duration_ms,
                        });
                    }
                    Ok(output) => {
                        let error = output
                            .error
                            .unwrap_or_else(|| "tool reported failure".to_string());
                        any_failed = true;
                        ctx.record_step(&id, json!({"error": error, "success": false}));
                        log.push(StepRecord {
                            step: id,
                            tool,
                            status: StepStatus::Failed,
                            reason: None,
                            error: Some(error),
                            attempts: 1,
                            duration_ms,
                        });
                    }
                    Err(e) => {
                        any_failed = true;
                        let error = e.to_string();
                        ctx.record_step(&id, json!({"error": error, "success": false}));
                        log.push(StepRecord {
                            step: id,
                            tool,
                            status: StepStatus::Failed,
                            reason: None,
                            error: Some(error),
                            attempts: 1,
                            duration_ms,
                        });
                    }
                }
            }
        }

        let output = ctx.resolve_value(&chain.output);
        Ok(ChainResult {
            success: !any_failed,
            output,
            log,
            error: None,
            step: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::chain::StepSpec;
    use crate::toolchain::{EchoTool, Tool, ToolOutput};
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> String {
            "slow".to_string()
        }

        fn description(&self) -> String {
            "sleeps briefly".to_string()
        }

        async fn execute(&self, params: Value) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(ToolOutput::success(json!({"got": params}), "slept"))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> String {
            "fail".to_string()
        }

        fn description(&self) -> String {
            "always fails".to_string()
        }

        async fn execute(&self, _params: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::failure("boom"))
        }
    }

    fn step(id: &str, tool: &str, params: Value) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            tool: tool.to_string(),
            params,
            condition: None,
            error_handling: None,
        }
    }

    async fn registry() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(SlowTool)).await;
        registry.register(Arc::new(FailTool)).await;
        registry
    }

    #[test]
    fn test_level_grouping() -> Result<()> {
        let chain = ChainSpec {
            name: "dag".to_string(),
            steps: vec![
                step("a", "echo", json!({})),
                step("b", "echo", json!({})),
                step("c", "echo", json!({"x": "${steps.a.output}"})),
                step("d", "echo", json!({"x": "${steps.b.output}", "y": "${steps.c.output}"})),
            ],
            output: json!({}),
        };

        let levels = ParallelChainRunner::levels(&chain)?;
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a", "b"]);
        assert_eq!(levels[1], vec!["c"]);
        assert_eq!(levels[2], vec!["d"]);
        Ok(())
    }

    #[test]
    fn test_cycle_detected() {
        let chain = ChainSpec {
            name: "cycle".to_string(),
            steps: vec![
                step("a", "echo", json!({"x": "${steps.b.output}"})),
                step("b", "echo", json!({"x": "${steps.a.output}"})),
            ],
            output: json!({}),
        };
        let err = ParallelChainRunner::levels(&chain).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn test_parallel_execution_flows_data() -> Result<()> {
        let runner = ParallelChainRunner::new(registry().await);
        let chain = ChainSpec {
            name: "fanout".to_string(),
            steps: vec![
                step("a", "slow", json!({"part": 1})),
                step("b", "slow", json!({"part": 2})),
                step("merge", "echo", json!({
                    "a": "${steps.a.output.got.part}",
                    "b": "${steps.b.output.got.part}"
                })),
            ],
            output: json!({"merged": "${steps.merge.output.echo}"}),
        };

        let result = runner.run(&chain, json!({}), json!({})).await?;
        assert!(result.success);
        assert_eq!(result.output, json!({"merged": {"a": 1, "b": 2}}));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_level() -> Result<()> {
        let runner = ParallelChainRunner::new(registry().await);
        let chain = ChainSpec {
            name: "partial".to_string(),
            steps: vec![
                step("good", "echo", json!({"v": 1})),
                step("bad", "fail", json!({})),
            ],
            output: json!({
                "good": "${steps.good.output.echo.v}",
                "bad_error": "${steps.bad.output.error}"
            }),
        };

        let result = runner.run(&chain, json!({}), json!({})).await?;
        assert!(!result.success);
        assert_eq!(result.output["good"], json!(1));
        assert_eq!(result.output["bad_error"], json!("boom"));
        let statuses: Vec<StepStatus> = result.log.iter().map(|r| r.status).collect();
        assert!(statuses.contains(&StepStatus::Completed));
        assert!(statuses.contains(&StepStatus::Failed));
        Ok(())
    }
}
