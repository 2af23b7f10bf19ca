//! Mailbox queues over the filesystem
//!
//! One directory per agent with `inbox/` and `processed/` subdirectories;
//! each message is a single JSON file. Sends are atomic (write to a temp
//! name, then rename), filenames are `<millis>_<id>.json` so lexicographic
//! order is age order, and expiry is discovered on read.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::envelope::MessageEnvelope;

/// Filesystem-backed message bus with per-agent mailboxes.
#[derive(Clone)]
pub struct Blackboard {
    root: PathBuf,
}

impl Blackboard {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn inbox_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id).join("inbox")
    }

    fn processed_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id).join("processed")
    }

    fn file_name(message: &MessageEnvelope) -> String {
        format!("{}_{}.json", message.timestamp.timestamp_millis(), message.id)
    }

    /// Deliver a message to the recipient's inbox atomically.
    pub async fn send(&self, message: &MessageEnvelope) -> Result<PathBuf> {
        let inbox = self.inbox_dir(&message.to.agent);
        fs::create_dir_all(&inbox).await?;

        let final_path = inbox.join(Self::file_name(message));
        let tmp_path = inbox.join(format!(".{}.tmp", message.id));

        let body = serde_json::to_vec_pretty(message)?;
        fs::write(&tmp_path, &body).await?;
        fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("failed to publish {}", final_path.display()))?;

        debug!(to = %message.to.agent, id = %message.id, "message delivered");
        Ok(final_path)
    }

    /// Sorted inbox listing (ascending filename = ascending age).
    async fn list_inbox(&self, agent_id: &str) -> Result<Vec<PathBuf>> {
        let inbox = self.inbox_dir(agent_id);
        if !inbox.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&inbox).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json") && !name.starts_with('.') {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Read up to `limit` messages. Expired messages are deleted and never
    /// returned. Messages stay in the inbox until acked, which is what makes
    /// delivery at-least-once.
    pub async fn receive(&self, agent_id: &str, limit: usize) -> Result<Vec<MessageEnvelope>> {
        let now = Utc::now();
        let mut messages = Vec::new();

        for path in self.list_inbox(agent_id).await? {
            if messages.len() >= limit {
                break;
            }
            let body = match fs::read_to_string(&path).await {
                Ok(body) => body,
                // Racing reader may have acked it already.
                Err(_) => continue,
            };
            let Ok(message) = serde_json::from_str::<MessageEnvelope>(&body) else {
                debug!(path = %path.display(), "skipping unparseable message file");
                continue;
            };
            if message.is_expired(now) {
                debug!(id = %message.id, "dropping expired message");
                let _ = fs::remove_file(&path).await;
                continue;
            }
            messages.push(message);
        }

        Ok(messages)
    }

    /// Acknowledge a message: move it from inbox to processed.
    pub async fn ack(&self, agent_id: &str, message_id: &str) -> Result<bool> {
        let suffix = format!("_{}.json", message_id);
        for path in self.list_inbox(agent_id).await? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.ends_with(&suffix) {
                let processed = self.processed_dir(agent_id);
                fs::create_dir_all(&processed).await?;
                fs::rename(&path, processed.join(&name)).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of messages waiting (including any not yet expired-checked).
    pub async fn inbox_count(&self, agent_id: &str) -> Result<usize> {
        Ok(self.list_inbox(agent_id).await?.len())
    }

    /// Optional sweeper: drop every expired message from an inbox. Expiry is
    /// normally discovered on read; this exists for housekeeping.
    pub async fn purge_expired(&self, agent_id: &str) -> Result<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for path in self.list_inbox(agent_id).await? {
            let Ok(body) = fs::read_to_string(&path).await else {
                continue;
            };
            let Ok(message) = serde_json::from_str::<MessageEnvelope>(&body) else {
                continue;
            };
            if message.is_expired(now) {
                let _ = fs::remove_file(&path).await;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
