//! Federation router - pick the cheapest capable agent
//!
//! Matches required capabilities against agent cards, filters by node
//! liveness, and ranks by utility score. "No agent" is a structured
//! outcome, not an error: the caller learns what was asked for and how many
//! candidates existed before filtering.

use anyhow::Result;
use chrono::Utc;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::card::{AgentCard, CardRegistry, Tier};

lazy_static! {
    /// Fixed keyword -> capabilities map used for extraction.
    static ref CAPABILITY_RULES: Vec<(Vec<&'static str>, Vec<&'static str>)> = vec![
        (
            vec!["code", "implement", "develop"],
            vec!["coding", "software-engineering", "development"],
        ),
        (
            vec!["write", "document"],
            vec!["writing", "content-creation", "documentation"],
        ),
        (
            vec!["research", "analyze"],
            vec!["research", "analysis", "investigation"],
        ),
        (
            vec!["test", "verify"],
            vec!["testing", "quality-assurance", "validation"],
        ),
        (
            vec!["alpha", "quant", "trading"],
            vec!["quantitative", "trading", "alpha"],
        ),
    ];
}

/// A task to be routed; only type and description matter here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
}

impl RouteRequest {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alternative {
    pub agent_id: String,
    pub score: f64,
}

/// A successful routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub agent_id: String,
    pub node: String,
    pub tier: Tier,
    pub confidence: f64,
    pub utility_score: f64,
    pub alternatives: Vec<Alternative>,
}

/// Structured "no agent" outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoAgentAvailable {
    pub error: String,
    pub capabilities_requested: Vec<String>,
    pub candidates_found: usize,
    pub available_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteOutcome {
    Routed(RoutingDecision),
    NoAgent(NoAgentAvailable),
}

impl RouteOutcome {
    pub fn decision(&self) -> Option<&RoutingDecision> {
        match self {
            RouteOutcome::Routed(d) => Some(d),
            RouteOutcome::NoAgent(_) => None,
        }
    }
}

/// Task router over the card registry and node status file.
pub struct FederationRouter {
    registry: CardRegistry,
    node_status_file: PathBuf,
    decisions_log: Option<PathBuf>,
}

impl FederationRouter {
    pub fn new(cards_dir: impl AsRef<Path>, node_status_file: impl AsRef<Path>) -> Self {
        Self {
            registry: CardRegistry::new(cards_dir),
            node_status_file: node_status_file.as_ref().to_path_buf(),
            decisions_log: None,
        }
    }

    pub fn with_decisions_log(mut self, path: impl AsRef<Path>) -> Self {
        self.decisions_log = Some(path.as_ref().to_path_buf());
        self
    }

    /// Extract required capabilities from the task text.
    pub fn extract_capabilities(task: &RouteRequest) -> Vec<String> {
        let haystack = format!(
            "{} {}",
            task.task_type.to_lowercase(),
            task.description.to_lowercase()
        );

        let mut capabilities = Vec::new();
        for (triggers, caps) in CAPABILITY_RULES.iter() {
            if triggers.iter().any(|t| haystack.contains(t)) {
                for cap in caps {
                    if !capabilities.iter().any(|c: &String| c == cap) {
                        capabilities.push(cap.to_string());
                    }
                }
            }
        }

        if capabilities.is_empty() {
            capabilities.push("general".to_string());
        }
        capabilities
    }

    fn is_node_online(&self, node: &str) -> bool {
        // Missing status file means we assume online.
        let Ok(body) = std::fs::read_to_string(&self.node_status_file) else {
            return true;
        };
        let Ok(status) = serde_json::from_str::<Value>(&body) else {
            return true;
        };

        let nodes: Vec<&Value> = match status.get("nodes") {
            Some(Value::Array(list)) => list.iter().collect(),
            Some(Value::Object(map)) => map.values().collect(),
            _ => return true,
        };

        for entry in nodes {
            let id = entry.get("id").and_then(Value::as_str);
            let role = entry.get("role").and_then(Value::as_str);
            if id == Some(node) || role == Some(node) {
                return entry.get("status").and_then(Value::as_str) == Some("online");
            }
        }
        true
    }

    /// Confidence grows with the utility gap between the top two candidates.
    fn confidence(ranked: &[AgentCard]) -> f64 {
        if ranked.len() < 2 {
            return 1.0;
        }
        let best = ranked[0].performance.utility_score;
        let second = ranked[1].performance.utility_score;
        if best == 0.0 {
            return 0.5;
        }
        (0.5 + (best - second) / 2.0).min(1.0)
    }

    /// Route a task to the best available agent.
    pub fn route_task(&self, task: &RouteRequest) -> Result<RouteOutcome> {
        let capabilities = Self::extract_capabilities(task);

        let candidates: Vec<AgentCard> = self
            .registry
            .load_all()?
            .into_iter()
            .filter(|card| card.matches_capabilities(&capabilities))
            .collect();
        let candidates_found = candidates.len();

        let mut available: Vec<AgentCard> = candidates
            .into_iter()
            .filter(|card| self.is_node_online(&card.identity.node))
            .collect();

        if available.is_empty() {
            return Ok(RouteOutcome::NoAgent(NoAgentAvailable {
                error: "No available agent for this task".to_string(),
                capabilities_requested: capabilities,
                candidates_found,
                available_count: 0,
            }));
        }

        available.sort_by(|a, b| {
            b.performance
                .utility_score
                .partial_cmp(&a.performance.utility_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.performance.tasks_completed.cmp(&a.performance.tasks_completed))
                .then_with(|| a.human_readable_id.cmp(&b.human_readable_id))
        });

        let confidence = Self::confidence(&available);
        let best = &available[0];
        let decision = RoutingDecision {
            agent_id: best.human_readable_id.clone(),
            node: best.identity.node.clone(),
            tier: best.identity.tier,
            confidence,
            utility_score: best.performance.utility_score,
            alternatives: available
                .iter()
                .skip(1)
                .take(3)
                .map(|card| Alternative {
                    agent_id: card.human_readable_id.clone(),
                    score: card.performance.utility_score,
                })
                .collect(),
        };

        info!(
            agent = %decision.agent_id,
            node = %decision.node,
            confidence = decision.confidence,
            "task routed"
        );
        Ok(RouteOutcome::Routed(decision))
    }

    /// Append the decision to the command-tier decision log.
    pub fn log_decision(&self, task_id: &str, decision: &RoutingDecision, result: &str) -> Result<()> {
        let Some(path) = &self.decisions_log else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let alternatives = if decision.alternatives.is_empty() {
            "none".to_string()
        } else {
            decision
                .alternatives
                .iter()
                .map(|a| a.agent_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let entry = format!(
            "\n### {}\n- **time**: {}\n- **selected**: {} (score: {:.2})\n- **node**: {}\n- **confidence**: {:.2}\n- **alternatives**: {}\n- **result**: {}\n",
            task_id,
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            decision.agent_id,
            decision.utility_score,
            decision.node,
            decision.confidence,
            alternatives,
            result,
        );

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }
}
