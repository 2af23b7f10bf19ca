//! Nomination workflow for federation memory
//!
//! High-scoring agents are proposed for promotion; a human approves or
//! rejects. Nominations are one-way state machines: pending is the only
//! live state, and a terminal nomination is never reopened. An agent that
//! becomes eligible again after a rejection gets a fresh nomination id.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::scorer::{ScoreChange, ScoreRecord, UtilityScorer};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NominationStatus {
    Pending,
    Approved,
    Rejected,
}

impl NominationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NominationStatus::Pending)
    }
}

/// Evidence carried with a nomination: the recent score trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NominationEvidence {
    #[serde(default)]
    pub score_history: Vec<ScoreChange>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nomination {
    pub nomination_id: String,
    pub agent_id: String,
    pub utility_score: f64,
    pub tier: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: NominationStatus,
    pub reason: String,
    pub evidence: NominationEvidence,
    #[serde(default)]
    pub notes: String,
    pub approver: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
}

/// Manages nomination proposals and their approval lifecycle.
pub struct NominationManager {
    scorer: UtilityScorer,
    nominations_dir: PathBuf,
    audit_log: PathBuf,
}

impl NominationManager {
    pub fn new(
        scorer: UtilityScorer,
        nominations_dir: impl AsRef<Path>,
        audit_log: impl AsRef<Path>,
    ) -> Result<Self> {
        let nominations_dir = nominations_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&nominations_dir)?;
        Ok(Self {
            scorer,
            nominations_dir,
            audit_log: audit_log.as_ref().to_path_buf(),
        })
    }

    fn nomination_path(&self, nomination_id: &str) -> PathBuf {
        self.nominations_dir.join(format!("{}.json", nomination_id))
    }

    fn load(&self, nomination_id: &str) -> Option<Nomination> {
        std::fs::read_to_string(self.nomination_path(nomination_id))
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
    }

    fn save(&self, nomination: &Nomination) -> Result<()> {
        std::fs::write(
            self.nomination_path(&nomination.nomination_id),
            serde_json::to_string_pretty(nomination)?,
        )?;
        Ok(())
    }

    /// Eligible agents without a pending nomination, best first. A terminal
    /// rejection does not block re-nomination.
    pub fn check_candidates(&self) -> Result<Vec<ScoreRecord>> {
        let mut candidates: Vec<ScoreRecord> = self
            .scorer
            .nomination_candidates()?
            .into_iter()
            .filter(|record| !self.has_pending_nomination(&record.agent_id))
            .collect();
        candidates.sort_by(|a, b| {
            b.utility_score
                .partial_cmp(&a.utility_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }

    pub fn has_pending_nomination(&self, agent_id: &str) -> bool {
        self.all_nominations(None)
            .unwrap_or_default()
            .iter()
            .any(|n| n.agent_id == agent_id && n.status == NominationStatus::Pending)
    }

    /// Create a pending nomination from a score record.
    pub fn create_nomination(&self, record: &ScoreRecord, reason: Option<&str>) -> Result<String> {
        let now = Utc::now();
        let nomination_id = format!(
            "nom-{}-{}",
            record.agent_id.replace('/', "_"),
            now.format("%Y%m%d-%H%M%S%3f")
        );

        let evidence_window = record
            .history
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect();

        let nomination = Nomination {
            nomination_id: nomination_id.clone(),
            agent_id: record.agent_id.clone(),
            utility_score: record.utility_score,
            tier: record.tier.clone(),
            timestamp: now,
            status: NominationStatus::Pending,
            reason: reason.map(String::from).unwrap_or_else(|| {
                format!(
                    "Score {:.2} exceeds threshold {:.2}",
                    record.utility_score,
                    super::scorer::NOMINATION_THRESHOLD
                )
            }),
            evidence: NominationEvidence {
                score_history: evidence_window,
                last_updated: record.last_updated,
            },
            notes: String::new(),
            approver: None,
            approved_at: None,
        };

        self.save(&nomination)?;
        info!(agent = %record.agent_id, id = %nomination_id, "nomination created");
        Ok(nomination_id)
    }

    fn transition(
        &self,
        nomination_id: &str,
        status: NominationStatus,
        notes: &str,
        approver: Option<&str>,
    ) -> Result<bool> {
        let Some(mut nomination) = self.load(nomination_id) else {
            return Ok(false);
        };
        // pending -> {approved, rejected} only; terminal states are final.
        if nomination.status.is_terminal() {
            warn!(id = nomination_id, "refusing to transition terminal nomination");
            return Ok(false);
        }

        nomination.status = status;
        nomination.notes = notes.to_string();
        nomination.approver = approver.map(String::from);
        nomination.approved_at = Some(Utc::now());
        self.save(&nomination)?;

        self.append_audit(&nomination)?;
        Ok(true)
    }

    /// Approve a pending nomination (human action).
    pub fn approve_nomination(
        &self,
        nomination_id: &str,
        notes: &str,
        approver: &str,
    ) -> Result<bool> {
        self.transition(nomination_id, NominationStatus::Approved, notes, Some(approver))
    }

    /// Reject a pending nomination with an auditable reason.
    pub fn reject_nomination(&self, nomination_id: &str, notes: &str) -> Result<bool> {
        self.transition(nomination_id, NominationStatus::Rejected, notes, None)
    }

    fn append_audit(&self, nomination: &Nomination) -> Result<()> {
        if let Some(parent) = self.audit_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let verdict = match nomination.status {
            NominationStatus::Approved => "APPROVED",
            NominationStatus::Rejected => "REJECTED",
            NominationStatus::Pending => "PENDING",
        };
        let entry = format!(
            "[{}] {}: {} (score: {:.2}){}\n",
            Utc::now().to_rfc3339(),
            verdict,
            nomination.agent_id,
            nomination.utility_score,
            if nomination.notes.is_empty() {
                String::new()
            } else {
                format!(" - {}", nomination.notes)
            }
        );
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    pub fn get_nomination(&self, nomination_id: &str) -> Option<Nomination> {
        self.load(nomination_id)
    }

    pub fn pending_nominations(&self) -> Result<Vec<Nomination>> {
        let mut pending = self.all_nominations(Some(NominationStatus::Pending))?;
        pending.sort_by(|a, b| {
            b.utility_score
                .partial_cmp(&a.utility_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(pending)
    }

    pub fn all_nominations(&self, status: Option<NominationStatus>) -> Result<Vec<Nomination>> {
        let mut nominations = Vec::new();
        if !self.nominations_dir.exists() {
            return Ok(nominations);
        }
        for entry in std::fs::read_dir(&self.nominations_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            if !name.map(|n| n.starts_with("nom-")).unwrap_or(false) {
                continue;
            }
            if let Ok(nomination) = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|body| serde_json::from_str::<Nomination>(&body).map_err(Into::into))
            {
                if status.map(|s| nomination.status == s).unwrap_or(true) {
                    nominations.push(nomination);
                }
            }
        }
        nominations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(nominations)
    }

    /// Create pending nominations for every eligible agent.
    pub fn auto_nominate_eligible(&self) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for candidate in self.check_candidates()? {
            match self.create_nomination(&candidate, None) {
                Ok(id) => created.push(id),
                Err(e) => warn!(agent = %candidate.agent_id, error = %e, "nomination failed"),
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::feedback::FeedbackCollector;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Result<(UtilityScorer, NominationManager)> {
        let feedback = FeedbackCollector::new(dir.path().join("feedback"))?;
        let scorer = UtilityScorer::new(feedback, dir.path().join("utility-scores"))?;
        let manager = NominationManager::new(
            scorer.clone(),
            dir.path().join("nominations"),
            dir.path().join("federation/nominations.log"),
        )?;
        Ok((scorer, manager))
    }

    fn make_eligible(scorer: &UtilityScorer, agent: &str) -> Result<()> {
        for _ in 0..8 {
            scorer.update_score(agent, 9.0)?;
        }
        Ok(())
    }

    #[test]
    fn test_auto_nominate_creates_pending() -> Result<()> {
        let dir = TempDir::new()?;
        let (scorer, manager) = setup(&dir)?;
        make_eligible(&scorer, "star")?;

        let created = manager.auto_nominate_eligible()?;
        assert_eq!(created.len(), 1);

        let pending = manager.pending_nominations()?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].agent_id, "star");
        assert_eq!(pending[0].status, NominationStatus::Pending);
        assert!(!pending[0].evidence.score_history.is_empty());

        // Re-running while pending creates nothing new.
        assert!(manager.auto_nominate_eligible()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_approval_is_terminal_and_audited() -> Result<()> {
        let dir = TempDir::new()?;
        let (scorer, manager) = setup(&dir)?;
        make_eligible(&scorer, "star")?;

        let id = &manager.auto_nominate_eligible()?[0];
        assert!(manager.approve_nomination(id, "well deserved", "boss")?);

        let nomination = manager.get_nomination(id).expect("exists");
        assert_eq!(nomination.status, NominationStatus::Approved);
        assert_eq!(nomination.approver.as_deref(), Some("boss"));
        assert!(nomination.approved_at.is_some());

        let audit = std::fs::read_to_string(dir.path().join("federation/nominations.log"))?;
        assert!(audit.contains("APPROVED: star"));

        // Terminal nominations cannot transition again.
        assert!(!manager.reject_nomination(id, "changed my mind")?);
        Ok(())
    }

    #[test]
    fn test_rejection_then_renomination_gets_new_id() -> Result<()> {
        let dir = TempDir::new()?;
        let (scorer, manager) = setup(&dir)?;
        make_eligible(&scorer, "star")?;

        let first = manager.auto_nominate_eligible()?.remove(0);
        assert!(manager.reject_nomination(&first, "not yet")?);

        let rejected = manager.get_nomination(&first).expect("exists");
        assert_eq!(rejected.status, NominationStatus::Rejected);
        assert_eq!(rejected.notes, "not yet");
        assert!(rejected.approved_at.is_some());

        let audit = std::fs::read_to_string(dir.path().join("federation/nominations.log"))?;
        assert!(audit.contains("REJECTED: star"));

        // Still eligible, no pending record: a fresh nomination is created
        // under a new id.
        let second = manager.auto_nominate_eligible()?;
        assert_eq!(second.len(), 1);
        assert_ne!(second[0], first);
        Ok(())
    }

    #[test]
    fn test_unknown_nomination() -> Result<()> {
        let dir = TempDir::new()?;
        let (_, manager) = setup(&dir)?;
        assert!(!manager.approve_nomination("nom-ghost-0", "", "boss")?);
        assert!(manager.get_nomination("nom-ghost-0").is_none());
        Ok(())
    }
}
