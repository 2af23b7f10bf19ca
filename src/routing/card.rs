//! Agent cards - capability records for routing
//!
//! One JSON card per agent describing identity, skills, utility, and
//! liveness. Validation enforces the tier rules the schema alone cannot
//! express.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::CoreError;

/// Heartbeat age beyond which an "active" agent is considered inconsistent.
pub const HEARTBEAT_MAX_AGE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Command,
    Pm,
    Worker,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Command => "command",
            Tier::Pm => "pm",
            Tier::Worker => "worker",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Active,
    Idle,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub node: String,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub pm_appointment: bool,
    #[serde(default)]
    pub task_evaluation: bool,
    #[serde(default)]
    pub task_execution: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    #[serde(default = "default_utility")]
    pub utility_score: f64,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub avg_score: f64,
}

fn default_utility() -> f64 {
    0.5
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            utility_score: default_utility(),
            tasks_completed: 0,
            avg_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub human_readable_id: String,
    pub identity: Identity,
    #[serde(default)]
    pub skills: Vec<Skill>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub performance: Performance,
    pub status: AgentStatus,
}

impl AgentCard {
    /// Whether any requested capability appears in skill ids or tags.
    pub fn matches_capabilities(&self, capabilities: &[String]) -> bool {
        capabilities.iter().any(|c| {
            self.skills
                .iter()
                .any(|s| s.id == *c || s.tags.iter().any(|t| t == c))
        })
    }

    /// Enforce the tier invariants. Returns every violation found.
    pub fn validate(&self, now: DateTime<Utc>) -> Vec<CoreError> {
        let mut violations = Vec::new();
        let tier = self.identity.tier;

        if !self
            .human_readable_id
            .contains(&format!("/{}/", tier))
        {
            violations.push(
                CoreError::validation(format!(
                    "tier '{}' does not match humanReadableId pattern: {}",
                    tier, self.human_readable_id
                ))
                .with_context("humanReadableId"),
            );
        }

        match tier {
            Tier::Command => {
                if !self.capabilities.pm_appointment {
                    violations.push(
                        CoreError::validation("command tier requires pmAppointment capability")
                            .with_context("capabilities.pmAppointment"),
                    );
                }
            }
            Tier::Pm => {
                if !self.capabilities.task_evaluation {
                    violations.push(
                        CoreError::validation("pm tier requires taskEvaluation capability")
                            .with_context("capabilities.taskEvaluation"),
                    );
                }
            }
            Tier::Worker => {
                if self.identity.parent.is_none() {
                    violations.push(
                        CoreError::validation("worker tier requires a parent pm")
                            .with_context("identity.parent"),
                    );
                }
            }
        }

        if self.status.state == AgentState::Active {
            match self.status.last_heartbeat {
                Some(heartbeat) => {
                    let age = (now - heartbeat).num_seconds();
                    if age > HEARTBEAT_MAX_AGE_SECS {
                        violations.push(
                            CoreError::validation(format!(
                                "agent marked active but last heartbeat was {}s ago",
                                age
                            ))
                            .with_context("status.lastHeartbeat"),
                        );
                    }
                }
                None => {
                    violations.push(
                        CoreError::validation("active agent is missing lastHeartbeat")
                            .with_context("status.lastHeartbeat"),
                    );
                }
            }
        }

        violations
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.validate(now).is_empty()
    }
}

/// Loads agent cards from a directory tree of JSON files.
pub struct CardRegistry {
    cards_dir: PathBuf,
}

impl CardRegistry {
    pub fn new(cards_dir: impl AsRef<Path>) -> Self {
        Self {
            cards_dir: cards_dir.as_ref().to_path_buf(),
        }
    }

    /// Load every parseable card under the registry directory. Unparseable
    /// files are skipped; routing must not stall on one bad card.
    pub fn load_all(&self) -> Result<Vec<AgentCard>> {
        let mut cards = Vec::new();
        if !self.cards_dir.exists() {
            return Ok(cards);
        }
        Self::collect(&self.cards_dir, &mut cards)?;
        Ok(cards)
    }

    fn collect(dir: &Path, cards: &mut Vec<AgentCard>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect(&path, cards)?;
            } else if path.extension().map(|e| e == "json").unwrap_or(false) {
                match std::fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|body| serde_json::from_str::<AgentCard>(&body).map_err(Into::into))
                {
                    Ok(card) => cards.push(card),
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping bad card"),
                }
            }
        }
        Ok(())
    }

    fn card_path(&self, human_readable_id: &str) -> PathBuf {
        let file_name = human_readable_id.replace('/', "_");
        self.cards_dir.join(format!("{}.json", file_name))
    }

    /// Write a card to `<dir>/<agent-id>.json` (registration path).
    pub fn save(&self, card: &AgentCard) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.cards_dir)?;
        let path = self.card_path(&card.human_readable_id);
        std::fs::write(&path, serde_json::to_string_pretty(card)?)?;
        Ok(path)
    }

    pub fn get(&self, human_readable_id: &str) -> Option<AgentCard> {
        std::fs::read_to_string(self.card_path(human_readable_id))
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
    }

    /// Heartbeat path: stamp the card active with a fresh heartbeat.
    pub fn touch_heartbeat(&self, human_readable_id: &str) -> Result<bool> {
        let Some(mut card) = self.get(human_readable_id) else {
            return Ok(false);
        };
        card.status.state = AgentState::Active;
        card.status.last_heartbeat = Some(Utc::now());
        self.save(&card)?;
        Ok(true)
    }

    /// Deregistration path: remove the card.
    pub fn remove(&self, human_readable_id: &str) -> Result<bool> {
        let path = self.card_path(human_readable_id);
        if path.exists() {
            std::fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn worker_card(id: &str, utility: f64) -> AgentCard {
        AgentCard {
            human_readable_id: format!("acme/worker/{}", id),
            identity: Identity {
                node: "local".to_string(),
                tier: Tier::Worker,
                parent: Some("acme/pm/coding".to_string()),
            },
            skills: vec![Skill {
                id: "writing".to_string(),
                tags: vec!["content-creation".to_string(), "documentation".to_string()],
            }],
            capabilities: Capabilities::default(),
            performance: Performance {
                utility_score: utility,
                tasks_completed: 10,
                avg_score: 8.0,
            },
            status: AgentStatus {
                state: AgentState::Active,
                last_heartbeat: Some(Utc::now()),
            },
        }
    }

    #[test]
    fn test_valid_worker_card() {
        let card = worker_card("henry", 0.7);
        assert!(card.is_valid(Utc::now()));
    }

    #[test]
    fn test_worker_without_parent_invalid() {
        let mut card = worker_card("henry", 0.7);
        card.identity.parent = None;
        let violations = card.validate(Utc::now());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].context.as_deref(), Some("identity.parent"));
    }

    #[test]
    fn test_command_requires_pm_appointment() {
        let mut card = worker_card("boss", 0.9);
        card.human_readable_id = "acme/command/boss".to_string();
        card.identity.tier = Tier::Command;
        card.identity.parent = None;
        let violations = card.validate(Utc::now());
        assert!(violations
            .iter()
            .any(|v| v.context.as_deref() == Some("capabilities.pmAppointment")));

        card.capabilities.pm_appointment = true;
        assert!(card.is_valid(Utc::now()));
    }

    #[test]
    fn test_tier_must_appear_in_id_path() {
        let mut card = worker_card("henry", 0.7);
        card.human_readable_id = "acme/pm/henry".to_string();
        let violations = card.validate(Utc::now());
        assert!(violations
            .iter()
            .any(|v| v.context.as_deref() == Some("humanReadableId")));
    }

    #[test]
    fn test_stale_heartbeat_on_active_agent() {
        let mut card = worker_card("henry", 0.7);
        card.status.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(600));
        let violations = card.validate(Utc::now());
        assert!(violations
            .iter()
            .any(|v| v.context.as_deref() == Some("status.lastHeartbeat")));

        // Idle agents are allowed stale heartbeats.
        card.status.state = AgentState::Idle;
        assert!(card.is_valid(Utc::now()));
    }

    #[test]
    fn test_capability_matching() {
        let card = worker_card("henry", 0.7);
        assert!(card.matches_capabilities(&["documentation".to_string()]));
        assert!(card.matches_capabilities(&["writing".to_string()]));
        assert!(!card.matches_capabilities(&["quantitative".to_string()]));
    }

    #[test]
    fn test_registry_lifecycle() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let registry = CardRegistry::new(dir.path());

        let mut card = worker_card("henry", 0.7);
        card.status.state = AgentState::Idle;
        card.status.last_heartbeat = Some(Utc::now() - chrono::Duration::hours(1));
        registry.save(&card)?;

        assert!(registry.touch_heartbeat("acme/worker/henry")?);
        let refreshed = registry.get("acme/worker/henry").expect("card exists");
        assert_eq!(refreshed.status.state, AgentState::Active);
        assert!(refreshed.is_valid(Utc::now()));

        assert!(registry.remove("acme/worker/henry")?);
        assert!(registry.get("acme/worker/henry").is_none());
        assert!(!registry.remove("acme/worker/henry")?);
        Ok(())
    }

    #[test]
    fn test_registry_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let registry = CardRegistry::new(dir.path());
        registry.save(&worker_card("henry", 0.7))?;
        registry.save(&worker_card("writer", 0.6))?;
        // A junk file must not break loading.
        std::fs::write(dir.path().join("broken.json"), "{not json")?;

        let cards = registry.load_all()?;
        assert_eq!(cards.len(), 2);
        Ok(())
    }
}
