//! Validator feedback collection
//!
//! Feedback is append-only JSONL, sharded per day. Appends take an advisory
//! file lock so concurrent validators interleave whole lines.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// The three validator sub-scores, each on 0-10.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackScores {
    pub quality: f64,
    pub completeness: f64,
    pub efficiency: f64,
}

/// One validation feedback record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub task_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub scores: FeedbackScores,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub validator_notes: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Aggregate over an agent's recent feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSummary {
    pub agent_id: String,
    pub period_days: i64,
    pub total_tasks: usize,
    pub avg_quality: f64,
    pub avg_completeness: f64,
    pub avg_efficiency: f64,
    pub pass_rate: f64,
    pub total_issues: usize,
}

/// Collects and reads validation feedback shards.
#[derive(Clone)]
pub struct FeedbackCollector {
    feedback_dir: PathBuf,
}

impl FeedbackCollector {
    pub fn new(feedback_dir: impl AsRef<Path>) -> Result<Self> {
        let feedback_dir = feedback_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&feedback_dir)?;
        Ok(Self { feedback_dir })
    }

    fn shard_path(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.feedback_dir
            .join(format!("feedback-{}.jsonl", timestamp.format("%Y-%m-%d")))
    }

    /// Record feedback for a validated task.
    pub fn collect(
        &self,
        task_id: &str,
        agent_id: &str,
        scores: FeedbackScores,
        issues: Vec<String>,
        notes: &str,
        passed: bool,
        metadata: Option<Value>,
    ) -> Result<FeedbackRecord> {
        let record = FeedbackRecord {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            scores,
            issues,
            validator_notes: notes.to_string(),
            passed,
            metadata,
        };
        self.append(&record)?;
        Ok(record)
    }

    /// Append a record to its daily shard.
    pub fn append(&self, record: &FeedbackRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.shard_path(record.timestamp))?;
        file.lock_exclusive()?;
        let result = (&file).write_all(line.as_bytes());
        let _ = FileExt::unlock(&file);
        result?;
        Ok(())
    }

    fn scan<F>(&self, mut keep: F) -> Result<Vec<FeedbackRecord>>
    where
        F: FnMut(&FeedbackRecord) -> bool,
    {
        let mut records = Vec::new();
        if !self.feedback_dir.exists() {
            return Ok(records);
        }

        let mut shards: Vec<PathBuf> = std::fs::read_dir(&self.feedback_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with("feedback-") && n.ends_with(".jsonl")
                    })
                    .unwrap_or(false)
            })
            .collect();
        shards.sort();

        for shard in shards {
            let Ok(file) = std::fs::File::open(&shard) else {
                continue;
            };
            for line in BufReader::new(file).lines() {
                let line = line?;
                let Ok(record) = serde_json::from_str::<FeedbackRecord>(line.trim()) else {
                    continue;
                };
                if keep(&record) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Recent feedback for an agent, newest first.
    pub fn get_feedback_for_agent(
        &self,
        agent_id: &str,
        days_back: i64,
        limit: Option<usize>,
    ) -> Result<Vec<FeedbackRecord>> {
        let cutoff = Utc::now() - Duration::days(days_back);
        let mut records =
            self.scan(|r| r.agent_id == agent_id && r.timestamp >= cutoff)?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub fn get_feedback_for_task(&self, task_id: &str) -> Result<Vec<FeedbackRecord>> {
        self.scan(|r| r.task_id == task_id)
    }

    /// Summarize an agent's feedback window.
    pub fn summarize(&self, agent_id: &str, days: i64) -> Result<FeedbackSummary> {
        let feedback = self.get_feedback_for_agent(agent_id, days, None)?;
        let total = feedback.len();

        if total == 0 {
            return Ok(FeedbackSummary {
                agent_id: agent_id.to_string(),
                period_days: days,
                total_tasks: 0,
                avg_quality: 0.0,
                avg_completeness: 0.0,
                avg_efficiency: 0.0,
                pass_rate: 0.0,
                total_issues: 0,
            });
        }

        let n = total as f64;
        let avg_quality = feedback.iter().map(|f| f.scores.quality).sum::<f64>() / n;
        let avg_completeness = feedback.iter().map(|f| f.scores.completeness).sum::<f64>() / n;
        let avg_efficiency = feedback.iter().map(|f| f.scores.efficiency).sum::<f64>() / n;
        let pass_rate = feedback.iter().filter(|f| f.passed).count() as f64 / n;
        let total_issues = feedback.iter().map(|f| f.issues.len()).sum();

        Ok(FeedbackSummary {
            agent_id: agent_id.to_string(),
            period_days: days,
            total_tasks: total,
            avg_quality: round2(avg_quality),
            avg_completeness: round2(avg_completeness),
            avg_efficiency: round2(avg_efficiency),
            pass_rate: round2(pass_rate),
            total_issues,
        })
    }
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scores(q: f64, c: f64, e: f64) -> FeedbackScores {
        FeedbackScores {
            quality: q,
            completeness: c,
            efficiency: e,
        }
    }

    #[test]
    fn test_collect_and_read_back() -> Result<()> {
        let dir = TempDir::new()?;
        let collector = FeedbackCollector::new(dir.path())?;

        collector.collect(
            "task-1",
            "coder-frontend",
            scores(8.0, 9.0, 7.0),
            vec!["minor formatting issue".to_string()],
            "good work overall",
            true,
            None,
        )?;

        let by_agent = collector.get_feedback_for_agent("coder-frontend", 30, None)?;
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].task_id, "task-1");
        assert!(by_agent[0].passed);

        let by_task = collector.get_feedback_for_task("task-1")?;
        assert_eq!(by_task.len(), 1);

        assert!(collector.get_feedback_for_agent("other", 30, None)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_limit_applies_newest_first() -> Result<()> {
        let dir = TempDir::new()?;
        let collector = FeedbackCollector::new(dir.path())?;

        for i in 0..5 {
            collector.collect(
                &format!("t{}", i),
                "gm",
                scores(7.0, 7.0, 7.0),
                vec![],
                "",
                true,
                None,
            )?;
        }

        let limited = collector.get_feedback_for_agent("gm", 30, Some(2))?;
        assert_eq!(limited.len(), 2);
        Ok(())
    }

    #[test]
    fn test_summary_aggregates() -> Result<()> {
        let dir = TempDir::new()?;
        let collector = FeedbackCollector::new(dir.path())?;

        collector.collect("t1", "gm", scores(8.0, 9.0, 7.0), vec!["a".into()], "", true, None)?;
        collector.collect("t2", "gm", scores(6.0, 7.0, 9.0), vec![], "", false, None)?;

        let summary = collector.summarize("gm", 30)?;
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.avg_quality, 7.0);
        assert_eq!(summary.avg_completeness, 8.0);
        assert_eq!(summary.avg_efficiency, 8.0);
        assert_eq!(summary.pass_rate, 0.5);
        assert_eq!(summary.total_issues, 1);
        Ok(())
    }

    #[test]
    fn test_empty_summary() -> Result<()> {
        let dir = TempDir::new()?;
        let collector = FeedbackCollector::new(dir.path())?;
        let summary = collector.summarize("ghost", 30)?;
        assert_eq!(summary.total_tasks, 0);
        assert_eq!(summary.pass_rate, 0.0);
        Ok(())
    }

    #[test]
    fn test_old_feedback_outside_window() -> Result<()> {
        let dir = TempDir::new()?;
        let collector = FeedbackCollector::new(dir.path())?;

        let mut record = FeedbackRecord {
            task_id: "old".to_string(),
            agent_id: "gm".to_string(),
            timestamp: Utc::now() - Duration::days(60),
            scores: scores(9.0, 9.0, 9.0),
            issues: vec![],
            validator_notes: String::new(),
            passed: true,
            metadata: None,
        };
        collector.append(&record)?;
        record.task_id = "fresh".to_string();
        record.timestamp = Utc::now();
        collector.append(&record)?;

        let windowed = collector.get_feedback_for_agent("gm", 30, None)?;
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].task_id, "fresh");
        Ok(())
    }
}
