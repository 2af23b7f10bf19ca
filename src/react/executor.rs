//! Five-phase reflective executor
//!
//! Drives an agent through Think -> Act -> Observe -> Reflect -> Adapt
//! cycles against an opaque oracle. The flow is an explicit state machine
//! with a serializable history; every phase is timed and the Adapt decision
//! labels the cycle's terminal edge.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::parse::{is_empty_response, parse_json_response};
use crate::llm::LLMProvider;
use crate::memory::ExperienceSink;
use crate::toolchain::ToolRegistry;

const DEFAULT_MAX_ITERATIONS: usize = 10;
const COMPLETE_SCORE: f64 = 0.8;
const PIVOT_ISSUE_COUNT: usize = 3;

/// Fixed description keyword -> tool mapping used by the Act phase.
const TOOL_MAPPING: &[(&str, &str)] = &[
    ("search", "web_search"),
    ("look up", "web_search"),
    ("read", "filesystem"),
    ("write", "filesystem"),
    ("file", "filesystem"),
    ("calculate", "calculator"),
    ("compute", "calculator"),
    ("remember", "memory_query"),
    ("recall", "memory_query"),
];
const DEFAULT_TOOL: &str = "web_search";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Think,
    Act,
    Observe,
    Reflect,
    Adapt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CycleDecision {
    Complete,
    Pivot,
    Abort,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: Phase,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRecord {
    pub iteration: usize,
    pub phases: Vec<PhaseRecord>,
    pub decision: CycleDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub iterations: usize,
    pub history: Vec<CycleRecord>,
}

#[derive(Debug, Clone, Default)]
struct Evaluation {
    success: bool,
    score: f64,
    issues: Vec<Issue>,
    lessons: Vec<String>,
}

#[derive(Debug, Clone)]
struct Issue {
    severity: Option<String>,
}

/// The reflective executor for one agent.
pub struct ReactExecutor {
    agent_id: String,
    provider: Arc<dyn LLMProvider>,
    tools: Arc<ToolRegistry>,
    experiences: Option<Arc<dyn ExperienceSink>>,
    max_iterations: usize,
}

impl ReactExecutor {
    pub fn new(
        agent_id: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            provider,
            tools,
            experiences: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_experiences(mut self, sink: Arc<dyn ExperienceSink>) -> Self {
        self.experiences = Some(sink);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    fn pick_tool(option: &str) -> &'static str {
        let lower = option.to_lowercase();
        TOOL_MAPPING
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .map(|(_, tool)| *tool)
            .unwrap_or(DEFAULT_TOOL)
    }

    fn format_experiences(experiences: &[String]) -> String {
        if experiences.is_empty() {
            return "none".to_string();
        }
        experiences
            .iter()
            .take(3)
            .enumerate()
            .map(|(i, e)| format!("{}. {}", i + 1, e))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn oracle(&self, prompt: String) -> Result<Value> {
        let response = self.provider.generate(prompt).await?;
        Ok(parse_json_response(&response))
    }

    /// Run the full cycle loop for a task.
    pub async fn execute(
        &self,
        task: &str,
        context: Option<&Value>,
        relevant_experiences: &[String],
    ) -> ExecutionReport {
        let mut history: Vec<CycleRecord> = Vec::new();
        let context = context.cloned().unwrap_or(Value::Null);

        for iteration in 1..=self.max_iterations {
            let mut phases: Vec<PhaseRecord> = Vec::new();
            let last_allowed = iteration == self.max_iterations;

            // --- Think ---
            let started = Instant::now();
            let think_prompt = format!(
                "You are working on this task: {task}\n\nRelevant past experiences:\n{exp}\n\nCurrent context: {ctx}\nIteration: {iteration}\n\nAnalyze the task and respond as JSON: {{\"analysis\": string, \"options\": [string], \"selectedOption\": number, \"reasoning\": string}}",
                task = task,
                exp = Self::format_experiences(relevant_experiences),
                ctx = context,
                iteration = iteration,
            );
            let thought = match self.oracle(think_prompt).await {
                Ok(value) if !is_empty_response(&value) => {
                    phases.push(PhaseRecord {
                        phase: Phase::Think,
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    });
                    value
                }
                other => {
                    let error = match other {
                        Err(e) => e.to_string(),
                        Ok(_) => "unparseable think response".to_string(),
                    };
                    warn!(iteration, error = %error, "think phase failed");
                    phases.push(PhaseRecord {
                        phase: Phase::Think,
                        success: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(error),
                    });
                    history.push(CycleRecord {
                        iteration,
                        phases,
                        decision: CycleDecision::Abort,
                    });
                    return ExecutionReport {
                        success: false,
                        result: None,
                        reason: Some("Think phase failed".to_string()),
                        iterations: iteration,
                        history,
                    };
                }
            };

            let options: Vec<String> = thought
                .get("options")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            let selected = match thought.get("selectedOption") {
                Some(Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| options.get(i as usize))
                    .cloned(),
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            }
            .or_else(|| options.first().cloned())
            .unwrap_or_else(|| task.to_string());

            // --- Act ---
            let started = Instant::now();
            let tool_name = Self::pick_tool(&selected);
            let params = json!({
                "description": selected,
                "task": task,
                "iteration": iteration,
            });
            let act_result = match self.tools.invoke(tool_name, params).await {
                Ok(output) if output.success => {
                    phases.push(PhaseRecord {
                        phase: Phase::Act,
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    });
                    output.data
                }
                other => {
                    let error = match other {
                        Ok(output) => output
                            .error
                            .unwrap_or_else(|| "tool reported failure".to_string()),
                        Err(e) => e.to_string(),
                    };
                    debug!(iteration, tool = tool_name, error = %error, "act phase failed, pivoting");
                    phases.push(PhaseRecord {
                        phase: Phase::Act,
                        success: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(error),
                    });
                    history.push(CycleRecord {
                        iteration,
                        phases,
                        decision: CycleDecision::Pivot,
                    });
                    if last_allowed {
                        return ExecutionReport {
                            success: false,
                            result: None,
                            reason: Some("Max iterations reached".to_string()),
                            iterations: iteration,
                            history,
                        };
                    }
                    continue;
                }
            };

            // --- Observe ---
            let started = Instant::now();
            let observe_prompt = format!(
                "Tool result for the task \"{task}\":\n{result}\n\nExtract observations as JSON: {{\"keyFindings\": [string], \"unexpectedFindings\": [string], \"questions\": [string]}}",
                task = task,
                result = act_result,
            );
            let observation = match self.oracle(observe_prompt).await {
                Ok(value) if !is_empty_response(&value) => {
                    phases.push(PhaseRecord {
                        phase: Phase::Observe,
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    });
                    value
                }
                other => {
                    // Observe failure is non-fatal; the raw result stands in.
                    let error = match other {
                        Err(e) => e.to_string(),
                        Ok(_) => "unparseable observe response".to_string(),
                    };
                    phases.push(PhaseRecord {
                        phase: Phase::Observe,
                        success: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(error),
                    });
                    json!({"raw": act_result})
                }
            };

            // --- Reflect ---
            let started = Instant::now();
            let reflect_prompt = format!(
                "Task: {task}\nAction taken: {selected}\nResult: {result}\nObservations: {obs}\n\nEvaluate as JSON: {{\"evaluation\": {{\"success\": bool, \"score\": number, \"criteria\": {{\"correctness\": number, \"completeness\": number, \"efficiency\": number}}}}, \"issues\": [{{\"description\": string, \"severity\": string}}], \"lessons\": [string], \"improvements\": [string]}}",
                task = task,
                selected = selected,
                result = act_result,
                obs = observation,
            );
            let (evaluation, reflect_value) = match self.oracle(reflect_prompt).await {
                Ok(value) if !is_empty_response(&value) => {
                    phases.push(PhaseRecord {
                        phase: Phase::Reflect,
                        success: true,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                    });
                    (parse_evaluation(&value), value)
                }
                other => {
                    let error = match other {
                        Err(e) => e.to_string(),
                        Ok(_) => "unparseable reflect response".to_string(),
                    };
                    warn!(iteration, error = %error, "reflect phase failed");
                    phases.push(PhaseRecord {
                        phase: Phase::Reflect,
                        success: false,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(error),
                    });
                    (Evaluation::default(), Value::Null)
                }
            };

            // Experience emission: only when the reflection produced lessons.
            if !evaluation.lessons.is_empty() {
                if let Some(sink) = &self.experiences {
                    let text = format!(
                        "Task: {} | Outcome: {} (score {:.2}) | Lessons: {}",
                        task,
                        if evaluation.success { "success" } else { "incomplete" },
                        evaluation.score,
                        evaluation.lessons.join("; "),
                    );
                    if let Err(e) =
                        sink.record(&self.agent_id, &text, "react-cycle", Some(evaluation.score))
                    {
                        warn!(error = %e, "failed to persist experience");
                    }
                }
            }

            // --- Adapt ---
            let started = Instant::now();
            let decision = if evaluation.success && evaluation.score >= COMPLETE_SCORE {
                CycleDecision::Complete
            } else if evaluation.issues.len() > PIVOT_ISSUE_COUNT
                || evaluation
                    .issues
                    .iter()
                    .any(|i| i.severity.as_deref() == Some("high"))
            {
                CycleDecision::Pivot
            } else if last_allowed {
                CycleDecision::Abort
            } else {
                CycleDecision::Continue
            };
            phases.push(PhaseRecord {
                phase: Phase::Adapt,
                success: true,
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            });

            history.push(CycleRecord {
                iteration,
                phases,
                decision,
            });

            match decision {
                CycleDecision::Complete => {
                    return ExecutionReport {
                        success: true,
                        result: Some(json!({
                            "output": act_result,
                            "observation": observation,
                            "evaluation": reflect_value.get("evaluation").cloned().unwrap_or(Value::Null),
                            "completedAt": Utc::now().to_rfc3339(),
                        })),
                        reason: None,
                        iterations: iteration,
                        history,
                    };
                }
                CycleDecision::Abort => {
                    return ExecutionReport {
                        success: false,
                        result: None,
                        reason: Some("Max iterations reached".to_string()),
                        iterations: iteration,
                        history,
                    };
                }
                CycleDecision::Pivot | CycleDecision::Continue => {}
            }
        }

        let iterations = history.len();
        ExecutionReport {
            success: false,
            result: None,
            reason: Some("Max iterations reached".to_string()),
            iterations,
            history,
        }
    }
}

fn parse_evaluation(reflect: &Value) -> Evaluation {
    let evaluation = reflect.get("evaluation").cloned().unwrap_or(Value::Null);
    let issues = reflect
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| Issue {
                    severity: item
                        .get("severity")
                        .and_then(Value::as_str)
                        .map(|s| s.to_lowercase()),
                })
                .collect()
        })
        .unwrap_or_default();
    let lessons = reflect
        .get("lessons")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Evaluation {
        success: evaluation
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        score: evaluation
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        issues,
        lessons,
    }
}
