//! Sequential chain execution
//!
//! Runs a chain's steps in order, resolving templates against the growing
//! execution context. Each step can gate itself on a condition and declare
//! how its failures are handled.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::template::TemplateContext;
use super::{ToolOutput, ToolRegistry};

const SKIP_REASON: &str = "Condition not met";

fn default_retries() -> u32 {
    1
}

/// Per-step failure strategy. `Abort` is the default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ErrorHandling {
    Retry {
        #[serde(default = "default_retries")]
        retries: u32,
    },
    Fallback {
        tool: String,
        #[serde(default)]
        params: Value,
    },
    Ignore,
    Abort,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        ErrorHandling::Abort
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
    /// Template for the chain's final output.
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Ignored,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: String,
    pub tool: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResult {
    pub success: bool,
    pub output: Value,
    pub log: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Sequential chain runner.
pub struct ChainRunner {
    registry: Arc<ToolRegistry>,
}

impl ChainRunner {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    async fn invoke(&self, tool: &str, params: Value) -> std::result::Result<ToolOutput, String> {
        match self.registry.invoke(tool, params).await {
            Ok(output) if output.success => Ok(output),
            Ok(output) => Err(output
                .error
                .unwrap_or_else(|| "tool reported failure".to_string())),
            Err(e) => Err(e.to_string()),
        }
    }

    pub async fn run(&self, chain: &ChainSpec, input: Value, context: Value) -> Result<ChainResult> {
        let mut ctx = TemplateContext::new(input, context);
        let mut log = Vec::new();

        for step in &chain.steps {
            let started = Instant::now();

            // Condition gate.
            if let Some(condition) = &step.condition {
                if !ctx.eval_condition(condition) {
                    debug!(step = %step.id, "condition not met, skipping");
                    ctx.record_step(&step.id, json!({"skipped": true}));
                    log.push(StepRecord {
                        step: step.id.clone(),
                        tool: step.tool.clone(),
                        status: StepStatus::Skipped,
                        reason: Some(SKIP_REASON.to_string()),
                        error: None,
                        attempts: 0,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    continue;
                }
            }

            let params = ctx.resolve_value(&step.params);
            let mut attempts = 1;
            let mut result = self.invoke(&step.tool, params).await;

            let strategy = step.error_handling.clone().unwrap_or_default();
            let first_error = result.as_ref().err().cloned();
            if let Some(first_error) = first_error {
                match &strategy {
                    ErrorHandling::Retry { retries } => {
                        for _ in 0..*retries {
                            attempts += 1;
                            // Params are re-resolved per attempt.
                            let params = ctx.resolve_value(&step.params);
                            result = self.invoke(&step.tool, params).await;
                            if result.is_ok() {
                                break;
                            }
                        }
                    }
                    ErrorHandling::Fallback { tool, params } => {
                        warn!(step = %step.id, error = %first_error, "falling back to {}", tool);
                        attempts += 1;
                        let params = ctx.resolve_value(params);
                        result = self.invoke(tool, params).await.map(|output| {
                            let mut data = output.data.clone();
                            if let Some(obj) = data.as_object_mut() {
                                obj.insert("fallback".to_string(), json!(true));
                            } else {
                                data = json!({"fallback": true, "data": output.data});
                            }
                            ToolOutput { data, ..output }
                        });
                    }
                    ErrorHandling::Ignore | ErrorHandling::Abort => {}
                }
            }

            if let Err(error) = &result {
                if matches!(strategy, ErrorHandling::Ignore) {
                    ctx.record_step(
                        &step.id,
                        json!({"error": error, "success": false, "ignored": true}),
                    );
                    log.push(StepRecord {
                        step: step.id.clone(),
                        tool: step.tool.clone(),
                        status: StepStatus::Ignored,
                        reason: None,
                        error: Some(error.clone()),
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    continue;
                }

                log.push(StepRecord {
                    step: step.id.clone(),
                    tool: step.tool.clone(),
                    status: StepStatus::Failed,
                    reason: None,
                    error: Some(error.clone()),
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                return Ok(ChainResult {
                    success: false,
                    output: Value::Null,
                    log,
                    error: Some(error.clone()),
                    step: Some(step.id.clone()),
                });
            }

            let output = result.expect("failures handled above");
            ctx.record_step(&step.id, output.data.clone());
            log.push(StepRecord {
                step: step.id.clone(),
                tool: step.tool.clone(),
                status: StepStatus::Completed,
                reason: None,
                error: None,
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let output = ctx.resolve_value(&chain.output);
        Ok(ChainResult {
            success: true,
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
    use crate::toolchain::{EchoTool, Tool};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails N times, then succeeds.
    struct FlakyTool {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        fn description(&self) -> String {
            "fails a configured number of times".to_string()
        }

        async fn execute(&self, _params: Value) -> Result<ToolOutput> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutput::failure("transient failure"))
            } else {
                Ok(ToolOutput::success(json!({"ok": true}), "recovered"))
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Tool for AlwaysFails {
        fn name(&self) -> String {
            "broken".to_string()
        }

        fn description(&self) -> String {
            "always fails".to_string()
        }

        async fn execute(&self, _params: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::failure("hard failure"))
        }
    }

    async fn registry() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(AlwaysFails)).await;
        registry
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

    #[tokio::test]
    async fn test_sequential_data_flow() -> Result<()> {
        let runner = ChainRunner::new(registry().await);
        let chain = ChainSpec {
            name: "flow".to_string(),
            steps: vec![
                step("first", "echo", json!({"value": "${input.seed}"})),
                step("second", "echo", json!({"from_first": "${steps.first.output.echo.value}"})),
            ],
            output: json!({"final": "${steps.second.output.echo.from_first}"}),
        };

        let result = runner.run(&chain, json!({"seed": 41}), json!({})).await?;
        assert!(result.success);
        assert_eq!(result.output, json!({"final": 41}));
        assert_eq!(result.log.len(), 2);
        assert!(result.log.iter().all(|r| r.status == StepStatus::Completed));
        Ok(())
    }

    #[tokio::test]
    async fn test_condition_skip() -> Result<()> {
        let runner = ChainRunner::new(registry().await);
        let mut skipped = step("gated", "echo", json!({}));
        skipped.condition = Some("${input.run_it} == yes".to_string());
        let chain = ChainSpec {
            name: "gated".to_string(),
            steps: vec![skipped],
            output: json!({"gated": "${steps.gated.output}"}),
        };

        let result = runner.run(&chain, json!({"run_it": "no"}), json!({})).await?;
        assert!(result.success);
        assert_eq!(result.log[0].status, StepStatus::Skipped);
        assert_eq!(result.log[0].reason.as_deref(), Some(SKIP_REASON));
        assert_eq!(result.output, json!({"gated": {"skipped": true}}));
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_default_stops_chain() -> Result<()> {
        let runner = ChainRunner::new(registry().await);
        let chain = ChainSpec {
            name: "abort".to_string(),
            steps: vec![
                step("bad", "broken", json!({})),
                step("never", "echo", json!({})),
            ],
            output: json!({}),
        };

        let result = runner.run(&chain, json!({}), json!({})).await?;
        assert!(!result.success);
        assert_eq!(result.step.as_deref(), Some("bad"));
        assert_eq!(result.error.as_deref(), Some("hard failure"));
        // The second step never ran.
        assert_eq!(result.log.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_recovers() -> Result<()> {
        let registry = registry().await;
        registry
            .register(Arc::new(FlakyTool {
                failures: AtomicUsize::new(2),
            }))
            .await;
        let runner = ChainRunner::new(registry);

        let mut flaky_step = step("r", "flaky", json!({}));
        flaky_step.error_handling = Some(ErrorHandling::Retry { retries: 3 });
        let chain = ChainSpec {
            name: "retry".to_string(),
            steps: vec![flaky_step],
            output: json!({"out": "${steps.r.output.ok}"}),
        };

        let result = runner.run(&chain, json!({}), json!({})).await?;
        assert!(result.success);
        assert_eq!(result.log[0].attempts, 3);
        assert_eq!(result.output, json!({"out": true}));
        Ok(())
    }

    #[tokio::test]
    async fn test_fallback_marks_output() -> Result<()> {
        let runner = ChainRunner::new(registry().await);
        let mut failing = step("f", "broken", json!({}));
        failing.error_handling = Some(ErrorHandling::Fallback {
            tool: "echo".to_string(),
            params: json!({"saved": "${input.plan_b}"}),
        });
        let chain = ChainSpec {
            name: "fallback".to_string(),
            steps: vec![failing],
            output: json!({"fellback": "${steps.f.output.fallback}"}),
        };

        let result = runner.run(&chain, json!({"plan_b": "backup"}), json!({})).await?;
        assert!(result.success);
        assert_eq!(result.output, json!({"fellback": true}));
        Ok(())
    }

    #[tokio::test]
    async fn test_ignore_continues() -> Result<()> {
        let runner = ChainRunner::new(registry().await);
        let mut ignored = step("i", "broken", json!({}));
        ignored.error_handling = Some(ErrorHandling::Ignore);
        let chain = ChainSpec {
            name: "ignore".to_string(),
            steps: vec![ignored, step("after", "echo", json!({"ok": true}))],
            output: json!({
                "ignored": "${steps.i.output.ignored}",
                "after": "${steps.after.output.echo.ok}"
            }),
        };

        let result = runner.run(&chain, json!({}), json!({})).await?;
        assert!(result.success);
        assert_eq!(result.log[0].status, StepStatus::Ignored);
        assert_eq!(result.output, json!({"ignored": true, "after": true}));
        Ok(())
    }
}
