//! Utility scorer - composite and delta-based agent scores
//!
//! Scores live in [0, 1] and gate both routing priority and nomination
//! eligibility. The composite score aggregates a 30-day feedback window;
//! the delta update reacts to a single validation result. Every update
//! appends to a bounded per-agent history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::feedback::{round2, FeedbackCollector};

pub const NOMINATION_THRESHOLD: f64 = 0.85;
pub const WARNING_THRESHOLD: f64 = 0.50;
pub const DEFAULT_SCORE: f64 = 0.5;
const HISTORY_LIMIT: usize = 30;

const WEIGHT_QUALITY: f64 = 0.30;
const WEIGHT_COMPLETENESS: f64 = 0.25;
const WEIGHT_EFFICIENCY: f64 = 0.20;
const WEIGHT_CONSISTENCY: f64 = 0.15;
const WEIGHT_AUTONOMY: f64 = 0.10;

const DELTA_HIGH: f64 = 0.05;
const DELTA_LOW: f64 = -0.02;

/// One history entry per score update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreChange {
    pub timestamp: DateTime<Utc>,
    pub old_score: f64,
    pub new_score: f64,
    #[serde(default)]
    pub notes: String,
}

/// Persisted per-agent score record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub agent_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    pub utility_score: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub nomination_eligible: bool,
    #[serde(default)]
    pub history: Vec<ScoreChange>,
}

impl ScoreRecord {
    fn fresh(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            tier: None,
            utility_score: DEFAULT_SCORE,
            last_updated: None,
            nomination_eligible: false,
            history: Vec::new(),
        }
    }
}

/// Calculates and persists agent utility scores.
#[derive(Clone)]
pub struct UtilityScorer {
    feedback: FeedbackCollector,
    scores_dir: PathBuf,
}

impl UtilityScorer {
    pub fn new(feedback: FeedbackCollector, scores_dir: impl AsRef<Path>) -> Result<Self> {
        let scores_dir = scores_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&scores_dir)?;
        Ok(Self {
            feedback,
            scores_dir,
        })
    }

    fn score_path(&self, agent_id: &str) -> PathBuf {
        // Hierarchical agent ids flatten into one file name.
        self.scores_dir
            .join(format!("{}.json", agent_id.replace('/', "_")))
    }

    /// Composite utility score over the agent's recent feedback window.
    /// Empty window means the neutral default.
    pub fn calculate_score(&self, agent_id: &str, days: i64) -> Result<f64> {
        let feedback = self.feedback.get_feedback_for_agent(agent_id, days, None)?;
        if feedback.is_empty() {
            return Ok(DEFAULT_SCORE);
        }

        let n = feedback.len() as f64;
        let quality = feedback.iter().map(|f| f.scores.quality).sum::<f64>() / n / 10.0;
        let completeness = feedback.iter().map(|f| f.scores.completeness).sum::<f64>() / n / 10.0;
        let efficiency = feedback.iter().map(|f| f.scores.efficiency).sum::<f64>() / n / 10.0;
        let pass_rate = feedback.iter().filter(|f| f.passed).count() as f64 / n;
        let avg_issues = feedback.iter().map(|f| f.issues.len()).sum::<usize>() as f64 / n;
        let autonomy = (1.0 - avg_issues * 0.1).max(0.0);

        let score = quality * WEIGHT_QUALITY
            + completeness * WEIGHT_COMPLETENESS
            + efficiency * WEIGHT_EFFICIENCY
            + pass_rate * WEIGHT_CONSISTENCY
            + autonomy * WEIGHT_AUTONOMY;

        Ok(round2(score))
    }

    /// Delta update from a single validation score on the 0-10 scale:
    /// +0.05 at >= 8.5, -0.02 below 6, otherwise unchanged. Clamped to [0, 1].
    pub fn update_score(&self, agent_id: &str, validation_score: f64) -> Result<f64> {
        let current = self.get_current_score(agent_id);
        let delta = if validation_score >= 8.5 {
            DELTA_HIGH
        } else if validation_score < 6.0 {
            DELTA_LOW
        } else {
            0.0
        };

        let new_score = (current + delta).clamp(0.0, 1.0);
        self.save_score(
            agent_id,
            new_score,
            &format!("validation score {:.1}", validation_score),
        )?;
        debug!(agent = agent_id, old = current, new = new_score, "score updated");
        Ok(new_score)
    }

    /// Recalculate the composite and persist it.
    pub fn refresh_score(&self, agent_id: &str, days: i64) -> Result<f64> {
        let score = self.calculate_score(agent_id, days)?;
        self.save_score(agent_id, score, &format!("composite over {} days", days))?;
        Ok(score)
    }

    pub fn get_current_score(&self, agent_id: &str) -> f64 {
        self.get_score_details(agent_id).utility_score
    }

    pub fn get_score_details(&self, agent_id: &str) -> ScoreRecord {
        std::fs::read_to_string(self.score_path(agent_id))
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
            .unwrap_or_else(|| ScoreRecord::fresh(agent_id))
    }

    fn save_score(&self, agent_id: &str, score: f64, notes: &str) -> Result<()> {
        let mut record = self.get_score_details(agent_id);
        let old_score = record.utility_score;

        record.utility_score = score;
        record.last_updated = Some(Utc::now());
        record.nomination_eligible = score >= NOMINATION_THRESHOLD;
        record.history.push(ScoreChange {
            timestamp: Utc::now(),
            old_score,
            new_score: score,
            notes: notes.to_string(),
        });
        // History is a bounded ring of the latest updates.
        if record.history.len() > HISTORY_LIMIT {
            let drop = record.history.len() - HISTORY_LIMIT;
            record.history.drain(..drop);
        }

        std::fs::write(
            self.score_path(agent_id),
            serde_json::to_string_pretty(&record)?,
        )?;
        Ok(())
    }

    pub fn check_nomination(&self, agent_id: &str, days: i64) -> Result<bool> {
        Ok(self.calculate_score(agent_id, days)? >= NOMINATION_THRESHOLD)
    }

    pub fn check_warning(&self, agent_id: &str) -> bool {
        self.get_current_score(agent_id) < WARNING_THRESHOLD
    }

    /// All persisted score records, highest first.
    pub fn get_all_scores(&self) -> Result<Vec<ScoreRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.scores_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(record) = std::fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|body| serde_json::from_str::<ScoreRecord>(&body).map_err(Into::into))
                {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| {
            b.utility_score
                .partial_cmp(&a.utility_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(records)
    }

    /// Agents currently flagged nomination-eligible.
    pub fn nomination_candidates(&self) -> Result<Vec<ScoreRecord>> {
        Ok(self
            .get_all_scores()?
            .into_iter()
            .filter(|r| r.nomination_eligible)
            .collect())
    }

    /// Agents in the warning zone.
    pub fn warning_agents(&self) -> Result<Vec<ScoreRecord>> {
        Ok(self
            .get_all_scores()?
            .into_iter()
            .filter(|r| r.utility_score < WARNING_THRESHOLD)
            .collect())
    }
}
