//! L4 Snapshot - versioned cross-machine memory exports
//!
//! Writes date-partitioned exports into a git-tracked repository and drives
//! the repository itself through the `git` binary. The core only stages,
//! commits, pushes, and pulls; credentials and remotes are operator-owned.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const MEMORY_SUBDIR: &str = "memory/github";

/// Result of a sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum SyncOutcome {
    /// Working tree was clean; nothing to commit.
    NoOp,
    /// A commit was created.
    Committed {
        commit_hash: String,
        files_changed: usize,
    },
}

/// Repository status summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    pub is_repo: bool,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub has_changes: bool,
    pub changed_files: usize,
    pub last_commit: Option<String>,
}

/// Snapshot exporter over a local git repository.
pub struct SnapshotRepo {
    repo_path: PathBuf,
    memory_path: PathBuf,
}

impl SnapshotRepo {
    pub fn new(repo_path: impl AsRef<Path>) -> Result<Self> {
        let repo_path = repo_path.as_ref().to_path_buf();
        let memory_path = repo_path.join(MEMORY_SUBDIR);
        std::fs::create_dir_all(&memory_path)?;
        Ok(Self {
            repo_path,
            memory_path,
        })
    }

    fn is_git_repo(&self) -> bool {
        self.repo_path.join(".git").exists()
    }

    async fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .with_context(|| format!("failed to spawn git {:?}", args))?;

        if !output.status.success() {
            bail!(
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn write_json(&self, path: &Path, value: &Value) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(value)?)?;
        Ok(path.to_path_buf())
    }

    /// Export a batch of experiences into today's partition.
    pub fn export_experiences(&self, experiences: &[Value]) -> Result<PathBuf> {
        let now = Utc::now();
        let date = now.format("%Y-%m-%d").to_string();
        let stamp = now.format("%H%M%S").to_string();
        let path = self
            .memory_path
            .join(&date)
            .join(format!("experiences-{}.json", stamp));

        self.write_json(
            &path,
            &json!({
                "exportedAt": now.to_rfc3339(),
                "date": date,
                "experiences": experiences,
                "count": experiences.len(),
                "version": "1.0",
            }),
        )
    }

    /// Export (overwrite) an agent's summary.
    pub fn export_agent_summary(&self, agent_id: &str, summary: &Value) -> Result<PathBuf> {
        let path = self.memory_path.join("agents").join(format!("{}.json", agent_id));
        let mut data = json!({
            "agentId": agent_id,
            "updatedAt": Utc::now().to_rfc3339(),
        });
        merge_objects(&mut data, summary);
        self.write_json(&path, &data)
    }

    /// Export a session archive into today's partition.
    pub fn export_session_archive(&self, session_id: &str, session_data: &Value) -> Result<PathBuf> {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = self
            .memory_path
            .join("sessions")
            .join(&date)
            .join(format!("{}.json", session_id));
        let mut data = json!({
            "sessionId": session_id,
            "archivedAt": Utc::now().to_rfc3339(),
        });
        merge_objects(&mut data, session_data);
        self.write_json(&path, &data)
    }

    /// Append lessons into today's lessons file, merging with any existing.
    pub fn export_lessons_learned(&self, lessons: &[Value]) -> Result<PathBuf> {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = self.memory_path.join("lessons").join(format!("{}.json", date));

        let mut all: Vec<Value> = if path.exists() {
            serde_json::from_str::<Value>(&std::fs::read_to_string(&path)?)
                .ok()
                .and_then(|v| v.get("lessons").and_then(Value::as_array).cloned())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        all.extend(lessons.iter().cloned());

        self.write_json(
            &path,
            &json!({
                "date": date,
                "updatedAt": Utc::now().to_rfc3339(),
                "lessons": all,
                "count": all.len(),
            }),
        )
    }

    /// Stage everything and commit iff the working tree is dirty.
    pub async fn sync(&self, message: Option<&str>) -> Result<SyncOutcome> {
        if !self.is_git_repo() {
            bail!("not a git repository: {}", self.repo_path.display());
        }

        let status = self.run_git(&["status", "--porcelain"]).await?;
        let status = status.trim();
        if status.is_empty() {
            debug!("snapshot repo clean, nothing to sync");
            return Ok(SyncOutcome::NoOp);
        }
        let files_changed = status.lines().count();

        self.run_git(&["add", "."]).await?;
        let msg = message
            .map(String::from)
            .unwrap_or_else(|| format!("Memory sync {}", Utc::now().format("%Y-%m-%d %H:%M")));
        self.run_git(&["commit", "-m", &msg]).await?;

        let head = self.run_git(&["log", "-1", "--format=%H"]).await?;
        Ok(SyncOutcome::Committed {
            commit_hash: head.trim().to_string(),
            files_changed,
        })
    }

    pub async fn push(&self) -> Result<()> {
        if !self.is_git_repo() {
            bail!("not a git repository: {}", self.repo_path.display());
        }
        self.run_git(&["push"]).await?;
        Ok(())
    }

    pub async fn pull(&self) -> Result<String> {
        if !self.is_git_repo() {
            bail!("not a git repository: {}", self.repo_path.display());
        }
        self.run_git(&["pull"]).await
    }

    pub async fn get_status(&self) -> RepoStatus {
        if !self.is_git_repo() {
            return RepoStatus {
                is_repo: false,
                path: self.repo_path.clone(),
                branch: None,
                has_changes: false,
                changed_files: 0,
                last_commit: None,
            };
        }

        let branch = self
            .run_git(&["branch", "--show-current"])
            .await
            .ok()
            .map(|s| s.trim().to_string());
        let changes = self
            .run_git(&["status", "--porcelain"])
            .await
            .unwrap_or_default();
        let changes = changes.trim().to_string();
        let last_commit = self
            .run_git(&["log", "-1", "--format=%H %ci %s"])
            .await
            .ok()
            .map(|s| s.trim().to_string());

        RepoStatus {
            is_repo: true,
            path: self.repo_path.clone(),
            branch,
            has_changes: !changes.is_empty(),
            changed_files: if changes.is_empty() {
                0
            } else {
                changes.lines().count()
            },
            last_commit,
        }
    }

    /// List exported files by category (agents, sessions, lessons).
    pub fn list_exports(&self, category: Option<&str>) -> Result<Vec<(String, PathBuf)>> {
        let categories: Vec<&str> = match category {
            Some(c) => vec![c],
            None => vec!["agents", "sessions", "lessons"],
        };

        let mut exports = Vec::new();
        for cat in categories {
            let cat_path = self.memory_path.join(cat);
            if !cat_path.exists() {
                continue;
            }
            collect_json_files(&cat_path, cat, &mut exports)?;
        }
        Ok(exports)
    }
}

fn collect_json_files(dir: &Path, category: &str, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, category, out)?;
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            out.push((category.to_string(), path));
        }
    }
    Ok(())
}

fn merge_objects(target: &mut Value, extra: &Value) {
    if let (Some(t), Some(e)) = (target.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            t.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exports_land_in_partitions() -> Result<()> {
        let dir = TempDir::new()?;
        let repo = SnapshotRepo::new(dir.path())?;

        let exp = repo.export_experiences(&[json!({"id": "e1"})])?;
        assert!(exp.to_string_lossy().contains("experiences-"));

        let agent = repo.export_agent_summary("gm", &json!({"utilityScore": 0.7}))?;
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&agent)?)?;
        assert_eq!(written["agentId"], "gm");
        assert_eq!(written["utilityScore"], 0.7);

        let session = repo.export_session_archive("session-1", &json!({"keys": 3}))?;
        assert!(session.to_string_lossy().contains("sessions"));
        Ok(())
    }

    #[test]
    fn test_lessons_append_merge() -> Result<()> {
        let dir = TempDir::new()?;
        let repo = SnapshotRepo::new(dir.path())?;

        repo.export_lessons_learned(&[json!({"lesson": "first"})])?;
        let path = repo.export_lessons_learned(&[json!({"lesson": "second"})])?;

        let data: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(data["count"], 2);
        assert_eq!(data["lessons"].as_array().map(|a| a.len()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_refuses_non_repo() -> Result<()> {
        let dir = TempDir::new()?;
        let repo = SnapshotRepo::new(dir.path())?;
        assert!(repo.sync(None).await.is_err());
        let status = repo.get_status().await;
        assert!(!status.is_repo);
        Ok(())
    }

    #[test]
    fn test_list_exports() -> Result<()> {
        let dir = TempDir::new()?;
        let repo = SnapshotRepo::new(dir.path())?;
        repo.export_agent_summary("gm", &json!({}))?;
        repo.export_lessons_learned(&[json!({"lesson": "x"})])?;

        let all = repo.list_exports(None)?;
        assert_eq!(all.len(), 2);
        let agents_only = repo.list_exports(Some("agents"))?;
        assert_eq!(agents_only.len(), 1);
        Ok(())
    }
}
