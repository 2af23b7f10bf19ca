//! Multi-dimensional task classifier
//!
//! Scores a task on complexity, risk, and importance, detects multi-domain
//! work, and decides which tier handles it. Pure function of its inputs so
//! the same task always classifies the same way.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

const WEIGHT_COMPLEXITY: f64 = 0.35;
const WEIGHT_RISK: f64 = 0.30;
const WEIGHT_IMPORTANCE: f64 = 0.35;

const COMMAND_THRESHOLD: f64 = 7.5;
const ASSISTED_THRESHOLD: f64 = 5.0;
const HUMAN_REVIEW_THRESHOLD: f64 = 9.0;

const COMMAND_HANDLER: &str = "GM Agent";
const WORKER_HANDLER: &str = "Henry";

lazy_static! {
    static ref TECH_KEYWORDS: Vec<(&'static str, f64)> = vec![
        ("machine learning", 3.0),
        ("ai model", 2.5),
        ("distributed system", 2.5),
        ("microservices", 2.0),
        ("database", 1.5),
        ("authentication", 1.5),
        ("api", 1.0),
        ("encryption", 1.0),
    ];
    static ref RISK_KEYWORDS: Vec<(&'static str, f64)> = vec![
        ("security", 2.0),
        ("privacy", 2.0),
        ("legal", 1.5),
        ("compliance", 1.5),
        ("money", 2.0),
        ("payment", 2.5),
        ("financial", 2.0),
        ("data loss", 2.5),
        ("downtime", 1.5),
    ];
    static ref IMPORTANCE_KEYWORDS: Vec<(&'static str, f64)> = vec![
        ("urgent", 2.0),
        ("critical", 2.5),
        ("important", 1.5),
        ("asap", 2.0),
        ("priority", 1.5),
        ("immediately", 2.0),
        ("as soon as possible", 2.0),
    ];
    static ref DOMAIN_KEYWORDS: Vec<(&'static str, Vec<&'static str>)> = vec![
        ("dev", vec!["code", "develop", "programming", "software", "app"]),
        ("design", vec!["design", "ui", "ux", "interface", "visual"]),
        ("marketing", vec!["market", "content", "campaign", "brand", "promotion"]),
        ("legal", vec!["legal", "contract", "compliance", "policy"]),
        ("ops", vec!["deploy", "monitor", "infrastructure", "ops"]),
    ];
}

/// Optional context supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyContext {
    /// One of critical/high/medium/low.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    /// One of critical/high/medium.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionScores {
    pub complexity: f64,
    pub risk: f64,
    pub importance: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandlingMode {
    Managed,
    Assisted,
    Solo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDecision {
    pub handler: String,
    pub mode: HandlingMode,
    pub confidence: String,
    pub reason: String,
    pub estimated_time: String,
    pub oversight: bool,
    pub requires_human_review: bool,
    pub requires_pm_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub task: String,
    pub scores: DimensionScores,
    pub is_multi_domain: bool,
    pub decision: HandlerDecision,
    pub classified_at: DateTime<Utc>,
}

/// Classify a task description. Pure given the same text and context.
pub fn classify(task: &str, context: &ClassifyContext) -> Classification {
    let lower = task.to_lowercase();

    let complexity = assess_complexity(&lower);
    let risk = assess_risk(&lower, context);
    let importance = assess_importance(&lower, context);
    let is_multi_domain = check_multi_domain(&lower, context);

    let total = complexity * WEIGHT_COMPLEXITY + risk * WEIGHT_RISK + importance * WEIGHT_IMPORTANCE;
    let total = (total * 10.0).round() / 10.0;

    let decision = decide(total, is_multi_domain);

    Classification {
        task: task.to_string(),
        scores: DimensionScores {
            complexity,
            risk,
            importance,
            total,
        },
        is_multi_domain,
        decision,
        classified_at: Utc::now(),
    }
}

fn count_steps(task: &str) -> usize {
    let connectors = [" and ", " then ", " after ", " also ", " plus "];
    let steps = 1 + connectors
        .iter()
        .map(|c| task.matches(c).count())
        .sum::<usize>();
    steps.min(10)
}

fn count_dependencies(task: &str) -> usize {
    ["database", "api", "integration", "external"]
        .iter()
        .filter(|k| task.contains(*k))
        .count()
}

fn assess_complexity(task: &str) -> f64 {
    let mut score = (count_steps(task) as f64 * 1.5).min(4.0);

    // First matching technical keyword only.
    if let Some((_, points)) = TECH_KEYWORDS.iter().find(|(k, _)| task.contains(k)) {
        score += points;
    }

    score += (count_dependencies(task) as f64 * 0.5).min(2.0);

    if task.contains("database") || task.contains("sql") {
        score += 1.0;
    }
    if task.contains("api") || task.contains("integration") {
        score += 0.5;
    }

    score.min(10.0)
}

fn assess_risk(task: &str, context: &ClassifyContext) -> f64 {
    let mut score: f64 = RISK_KEYWORDS
        .iter()
        .filter(|(k, _)| task.contains(k))
        .map(|(_, p)| p)
        .sum();

    if task.contains("user data") || task.contains("personal information") {
        score += 2.0;
    }
    if task.contains("payment") || task.contains("credit card") {
        score += 2.5;
    }
    if task.contains("password") || task.contains("authentication") {
        score += 1.5;
    }
    if task.contains("production") || task.contains("live") {
        score += 2.0;
    }
    if task.contains("deploy") {
        score += 1.0;
    }

    if let Some(level) = context.risk_level.as_deref() {
        score += match level {
            "critical" => 3.0,
            "high" => 2.0,
            "medium" => 1.0,
            _ => 0.0,
        };
    }

    score.min(10.0)
}

fn assess_importance(task: &str, context: &ClassifyContext) -> f64 {
    let mut score: f64 = IMPORTANCE_KEYWORDS
        .iter()
        .filter(|(k, _)| task.contains(k))
        .map(|(_, p)| p)
        .sum();

    if task.contains("core") || task.contains("strategic") {
        score += 2.0;
    }
    if task.contains("key") || task.contains("critical") {
        score += 1.5;
    }

    if let Some(priority) = context.priority.as_deref() {
        score += match priority {
            "critical" => 3.0,
            "high" => 2.0,
            "medium" => 1.0,
            _ => 0.0,
        };
    }

    if task.contains("blocking") || task.contains("blocked by") {
        score += 1.5;
    }

    score.min(10.0)
}

fn check_multi_domain(task: &str, context: &ClassifyContext) -> bool {
    let mut domains: Vec<&str> = DOMAIN_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| task.contains(k)))
        .map(|(domain, _)| *domain)
        .collect();

    for domain in &context.domains {
        if !domains.iter().any(|d| d == domain) {
            domains.push(domain.as_str());
        }
    }

    domains.len() >= 2
}

fn decide(total: f64, multi: bool) -> HandlerDecision {
    if multi || total >= COMMAND_THRESHOLD {
        let mut reasons = Vec::new();
        if multi {
            reasons.push("spans multiple domains and needs cross-domain coordination");
        }
        if total > 8.0 {
            reasons.push("composite score is very high");
        } else if total >= COMMAND_THRESHOLD {
            reasons.push("composite score requires senior oversight");
        }
        HandlerDecision {
            handler: COMMAND_HANDLER.to_string(),
            mode: HandlingMode::Managed,
            confidence: "high".to_string(),
            reason: if reasons.is_empty() {
                "meets command-tier handling criteria".to_string()
            } else {
                reasons.join("; ")
            },
            estimated_time: "10-20 min".to_string(),
            oversight: true,
            requires_human_review: total > HUMAN_REVIEW_THRESHOLD,
            requires_pm_review: false,
        }
    } else if total >= ASSISTED_THRESHOLD {
        HandlerDecision {
            handler: WORKER_HANDLER.to_string(),
            mode: HandlingMode::Assisted,
            confidence: "medium".to_string(),
            reason: if total > 6.0 {
                "elevated complexity; pm review recommended".to_string()
            } else {
                "moderate complexity".to_string()
            },
            estimated_time: "3-5 min".to_string(),
            oversight: true,
            requires_human_review: false,
            requires_pm_review: true,
        }
    } else {
        HandlerDecision {
            handler: WORKER_HANDLER.to_string(),
            mode: HandlingMode::Solo,
            confidence: "high".to_string(),
            reason: if total < 3.0 {
                "simple task, fast path".to_string()
            } else {
                "low complexity, can be completed quickly".to_string()
            },
            estimated_time: "< 2 min".to_string(),
            oversight: false,
            requires_human_review: false,
            requires_pm_review: false,
        }
    }
}
