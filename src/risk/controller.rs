//! Risk rule evaluation and enforcement

use anyhow::Result;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, warn};

lazy_static! {
    static ref DISCONNECT_RE: Regex =
        Regex::new(r"disconnect\s*>\s*(\d+)").expect("static regex");
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    Hard,
    Soft,
}

/// Type-specific rule body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleKind {
    NodeRestriction {
        #[serde(rename = "allowedNodes", default)]
        allowed_nodes: Vec<String>,
    },
    ActionRestriction {
        #[serde(rename = "forbiddenActions", default)]
        forbidden_actions: Vec<String>,
    },
    ResourceLimit {
        #[serde(default)]
        limits: HashMap<String, f64>,
    },
    SafetyAction {
        #[serde(default)]
        trigger: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRule {
    pub id: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Patterns: literal, prefix `x*`, wildcard `*`, or negation `!x`.
    #[serde(default)]
    pub agents: Vec<String>,
    pub enforcement: Enforcement,
}

impl RiskRule {
    /// Whether this rule applies to an agent. Any matching negation makes
    /// the rule not apply; otherwise any positive match applies it; a list
    /// of only negations with no match means "all except these".
    pub fn applies_to(&self, agent_id: &str) -> bool {
        if self.agents.is_empty() {
            return false;
        }

        let mut has_positive = false;
        for pattern in &self.agents {
            if let Some(negated) = pattern.strip_prefix('!') {
                if pattern_matches(negated, agent_id) {
                    return false;
                }
            } else {
                has_positive = true;
                if pattern_matches(pattern, agent_id) {
                    return true;
                }
            }
        }

        !has_positive
    }
}

fn pattern_matches(pattern: &str, agent_id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return agent_id.starts_with(prefix);
    }
    agent_id == pattern
}

/// On-disk rules file: `{rules: [...], immutable: [ruleId...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskLimitsFile {
    #[serde(default)]
    pub rules: Vec<RiskRule>,
    #[serde(default)]
    pub immutable: Vec<String>,
}

/// Evaluation context for one action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Outcome of a validation: allowed (possibly with a warning) or denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskVerdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RiskVerdict {
    fn clean() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub action: String,
    pub rule: String,
    pub reason: String,
    pub enforcement: Enforcement,
}

/// Rule table plus violation log. The table is loaded once and treated as
/// read-only; `reload` swaps mutable rules but immutable ones keep their
/// originally loaded definition.
pub struct RiskController {
    rules: Vec<RiskRule>,
    immutable: HashSet<String>,
    violations: Mutex<Vec<Violation>>,
}

impl RiskController {
    pub fn new(limits: RiskLimitsFile) -> Self {
        Self {
            immutable: limits.immutable.into_iter().collect(),
            rules: limits.rules,
            violations: Mutex::new(Vec::new()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let limits = if path.as_ref().exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            RiskLimitsFile::default()
        };
        Ok(Self::new(limits))
    }

    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    pub fn is_rule_immutable(&self, rule_id: &str) -> bool {
        self.immutable.contains(rule_id)
    }

    /// Replace the mutable rules with a new set. Rules marked immutable at
    /// initial load keep their original definition regardless of what the
    /// new file says.
    pub fn reload(&mut self, limits: RiskLimitsFile) {
        let preserved: Vec<RiskRule> = self
            .rules
            .iter()
            .filter(|r| self.immutable.contains(&r.id))
            .cloned()
            .collect();

        let mut rules: Vec<RiskRule> = limits
            .rules
            .into_iter()
            .filter(|r| !self.immutable.contains(&r.id))
            .collect();
        rules.extend(preserved);
        self.rules = rules;
    }

    /// Validate an action against every applicable rule.
    pub fn validate_action(&self, agent_id: &str, action: &str, context: &RiskContext) -> RiskVerdict {
        for rule in &self.rules {
            if !rule.applies_to(agent_id) {
                continue;
            }

            let failure: Option<String> = match &rule.kind {
                RuleKind::NodeRestriction { allowed_nodes } => {
                    match context.target_node.as_deref() {
                        Some(node)
                            if allowed_nodes != &["*".to_string()]
                                && !allowed_nodes.iter().any(|n| n == node) =>
                        {
                            Some(format!(
                                "Node '{}' not allowed for agent '{}' (allowed: {})",
                                node,
                                agent_id,
                                allowed_nodes.join(", ")
                            ))
                        }
                        _ => None,
                    }
                }
                RuleKind::ActionRestriction { forbidden_actions } => {
                    if forbidden_actions.iter().any(|a| a == action) {
                        Some(format!(
                            "Action '{}' forbidden for agent '{}'",
                            action, agent_id
                        ))
                    } else {
                        None
                    }
                }
                RuleKind::ResourceLimit { limits } => {
                    let limit = limits
                        .get(agent_id)
                        .or_else(|| limits.get("default"))
                        .copied()
                        .unwrap_or(f64::INFINITY);
                    match context.current_usage {
                        Some(usage) if usage > limit => Some(format!(
                            "Resource limit exceeded for '{}': {} > {}",
                            agent_id, usage, limit
                        )),
                        _ => None,
                    }
                }
                RuleKind::SafetyAction { trigger } => {
                    self.check_safety_trigger(trigger, agent_id, context)
                }
            };

            if let Some(reason) = failure {
                return self.handle_violation(agent_id, action, rule, reason);
            }
        }

        RiskVerdict::clean()
    }

    fn check_safety_trigger(
        &self,
        trigger: &str,
        agent_id: &str,
        context: &RiskContext,
    ) -> Option<String> {
        let threshold_min: i64 = DISCONNECT_RE
            .captures(trigger)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())?;
        let heartbeat = context.last_heartbeat?;
        let minutes = (Utc::now() - heartbeat).num_minutes();
        if minutes > threshold_min {
            Some(format!(
                "Safety condition violated for '{}': disconnected {} min (limit {} min)",
                agent_id, minutes, threshold_min
            ))
        } else {
            None
        }
    }

    fn handle_violation(
        &self,
        agent_id: &str,
        action: &str,
        rule: &RiskRule,
        reason: String,
    ) -> RiskVerdict {
        self.violations.lock().expect("violation log").push(Violation {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            rule: rule.id.clone(),
            reason: reason.clone(),
            enforcement: rule.enforcement,
        });

        match rule.enforcement {
            Enforcement::Hard => {
                error!(agent = agent_id, rule = %rule.id, "BLOCKED: {}", reason);
                RiskVerdict {
                    allowed: false,
                    reason: Some(reason),
                }
            }
            Enforcement::Soft => {
                warn!(agent = agent_id, rule = %rule.id, "WARNING: {}", reason);
                RiskVerdict {
                    allowed: true,
                    reason: Some(format!("Warning: {}", reason)),
                }
            }
        }
    }

    /// Union of allowedNodes across every applicable node-restriction rule,
    /// defaulting to all nodes.
    pub fn get_allowed_nodes(&self, agent_id: &str) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        let mut restricted = false;

        for rule in &self.rules {
            if !rule.applies_to(agent_id) {
                continue;
            }
            if let RuleKind::NodeRestriction { allowed_nodes } = &rule.kind {
                restricted = true;
                for node in allowed_nodes {
                    if !nodes.contains(node) {
                        nodes.push(node.clone());
                    }
                }
            }
        }

        if restricted {
            nodes
        } else {
            vec!["*".to_string()]
        }
    }

    pub fn violation_count(&self) -> usize {
        self.violations.lock().expect("violation log").len()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().expect("violation log").clone()
    }

    /// Persist the violation log.
    pub fn save_violation_log(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = self.violations.lock().expect("violation log");
        std::fs::write(path, serde_json::to_string_pretty(&*log)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_rule(id: &str, agents: &[&str], allowed: &[&str], enforcement: Enforcement) -> RiskRule {
        RiskRule {
            id: id.to_string(),
            kind: RuleKind::NodeRestriction {
                allowed_nodes: allowed.iter().map(|s| s.to_string()).collect(),
            },
            agents: agents.iter().map(|s| s.to_string()).collect(),
            enforcement,
        }
    }

    fn controller(rules: Vec<RiskRule>, immutable: Vec<&str>) -> RiskController {
        RiskController::new(RiskLimitsFile {
            rules,
            immutable: immutable.into_iter().map(String::from).collect(),
        })
    }

    #[test]
    fn test_hard_node_restriction_denies() {
        let rc = controller(
            vec![node_rule(
                "alpha-isolation",
                &["alpha-executor"],
                &["quant"],
                Enforcement::Hard,
            )],
            vec![],
        );

        let ctx = RiskContext {
            target_node: Some("local".to_string()),
            ..Default::default()
        };
        let verdict = rc.validate_action("alpha-executor", "execute-trade", &ctx);
        assert!(!verdict.allowed);
        let reason = verdict.reason.expect("reason");
        assert!(reason.contains("local"));
        assert!(reason.contains("quant"));
        assert_eq!(rc.violation_count(), 1);

        // Allowed node passes clean.
        let ctx = RiskContext {
            target_node: Some("quant".to_string()),
            ..Default::default()
        };
        let verdict = rc.validate_action("alpha-executor", "execute-trade", &ctx);
        assert!(verdict.allowed);
        assert!(verdict.reason.is_none());

        assert_eq!(rc.get_allowed_nodes("alpha-executor"), vec!["quant"]);
        assert_eq!(rc.get_allowed_nodes("someone-else"), vec!["*"]);
    }

    #[test]
    fn test_soft_violation_warns_but_allows() {
        let rc = controller(
            vec![RiskRule {
                id: "no-deploy".to_string(),
                kind: RuleKind::ActionRestriction {
                    forbidden_actions: vec!["deploy".to_string()],
                },
                agents: vec!["*".to_string()],
                enforcement: Enforcement::Soft,
            }],
            vec![],
        );

        let verdict = rc.validate_action("henry", "deploy", &RiskContext::default());
        assert!(verdict.allowed);
        assert!(verdict.reason.unwrap().starts_with("Warning: "));
        assert_eq!(rc.violation_count(), 1);
    }

    #[test]
    fn test_resource_limit_with_default() {
        let mut limits = HashMap::new();
        limits.insert("big-spender".to_string(), 100.0);
        limits.insert("default".to_string(), 10.0);
        let rc = controller(
            vec![RiskRule {
                id: "cost-limit".to_string(),
                kind: RuleKind::ResourceLimit { limits },
                agents: vec!["*".to_string()],
                enforcement: Enforcement::Hard,
            }],
            vec![],
        );

        let ctx = RiskContext {
            current_usage: Some(50.0),
            ..Default::default()
        };
        assert!(rc.validate_action("big-spender", "spend", &ctx).allowed);
        assert!(!rc.validate_action("henry", "spend", &ctx).allowed);
    }

    #[test]
    fn test_safety_disconnect_trigger() {
        let rc = controller(
            vec![RiskRule {
                id: "heartbeat-guard".to_string(),
                kind: RuleKind::SafetyAction {
                    trigger: "disconnect > 10 min".to_string(),
                },
                agents: vec!["*".to_string()],
                enforcement: Enforcement::Hard,
            }],
            vec![],
        );

        let fresh = RiskContext {
            last_heartbeat: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..Default::default()
        };
        assert!(rc.validate_action("henry", "act", &fresh).allowed);

        let stale = RiskContext {
            last_heartbeat: Some(Utc::now() - chrono::Duration::minutes(30)),
            ..Default::default()
        };
        assert!(!rc.validate_action("henry", "act", &stale).allowed);
    }

    #[test]
    fn test_pattern_semantics() {
        let rule = RiskRule {
            id: "r".to_string(),
            kind: RuleKind::ActionRestriction {
                forbidden_actions: vec![],
            },
            agents: vec!["coder-*".to_string(), "!coder-trusted".to_string()],
            enforcement: Enforcement::Hard,
        };
        assert!(rule.applies_to("coder-frontend"));
        // Negation wins even though the prefix also matches.
        assert!(!rule.applies_to("coder-trusted"));
        assert!(!rule.applies_to("writer"));

        // Only negations: applies to everyone except the negated.
        let except = RiskRule {
            agents: vec!["!gm".to_string()],
            ..rule.clone()
        };
        assert!(except.applies_to("henry"));
        assert!(!except.applies_to("gm"));

        // Empty agents list never applies.
        let nobody = RiskRule {
            agents: vec![],
            ..rule
        };
        assert!(!nobody.applies_to("anyone"));
    }

    #[test]
    fn test_allowed_nodes_union() {
        let rc = controller(
            vec![
                node_rule("r1", &["worker-*"], &["quant"], Enforcement::Hard),
                node_rule("r2", &["worker-*"], &["archive"], Enforcement::Hard),
            ],
            vec![],
        );
        assert_eq!(
            rc.get_allowed_nodes("worker-a"),
            vec!["quant".to_string(), "archive".to_string()]
        );
    }

    #[test]
    fn test_reload_preserves_immutable_rules() {
        let original = node_rule("alpha-isolation", &["alpha-*"], &["quant"], Enforcement::Hard);
        let mut rc = controller(vec![original.clone()], vec!["alpha-isolation"]);
        assert!(rc.is_rule_immutable("alpha-isolation"));

        // An attacker-supplied reload that loosens the immutable rule and
        // adds a new one.
        let loosened = node_rule("alpha-isolation", &["alpha-*"], &["*"], Enforcement::Soft);
        let extra = node_rule("new-rule", &["*"], &["quant"], Enforcement::Soft);
        rc.reload(RiskLimitsFile {
            rules: vec![loosened, extra],
            immutable: vec![],
        });

        let kept = rc
            .rules()
            .iter()
            .find(|r| r.id == "alpha-isolation")
            .expect("still present");
        assert_eq!(*kept, original);
        assert!(rc.rules().iter().any(|r| r.id == "new-rule"));
    }

    #[test]
    fn test_wire_format_round_trip() {
        let body = json!({
            "rules": [
                {
                    "id": "alpha-isolation",
                    "type": "node-restriction",
                    "agents": ["alpha-executor"],
                    "allowedNodes": ["quant"],
                    "enforcement": "hard"
                },
                {
                    "id": "no-rm",
                    "type": "action-restriction",
                    "agents": ["!gm"],
                    "forbiddenActions": ["rm-rf"],
                    "enforcement": "hard"
                }
            ],
            "immutable": ["alpha-isolation"]
        });

        let limits: RiskLimitsFile = serde_json::from_value(body).expect("parse");
        assert_eq!(limits.rules.len(), 2);
        assert!(matches!(
            limits.rules[0].kind,
            RuleKind::NodeRestriction { .. }
        ));
        let rc = RiskController::new(limits);
        assert!(rc.is_rule_immutable("alpha-isolation"));
        assert!(
            !rc.validate_action("henry", "rm-rf", &RiskContext::default())
                .allowed
        );
    }
}
