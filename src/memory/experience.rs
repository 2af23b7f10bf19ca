//! L3 Experience Store - append-only experience log with keyword search
//!
//! JSONL-backed long-term memory for agent experiences. Retrieval is
//! keyword-match scored; the interface is shaped so a real similarity
//! backend can replace the scoring without changing signatures.

use anyhow::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MAX_KEYWORDS: usize = 20;

lazy_static! {
    static ref WORD_RE: Regex = Regex::new(r"\b[a-z]{3,}\b").expect("static regex");
    static ref STOPWORDS: HashSet<&'static str> = [
        "the", "and", "for", "was", "are", "but", "not", "you", "all", "can", "had", "her",
        "one", "our", "out",
    ]
    .into_iter()
    .collect();
}

/// One stored experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experience {
    pub id: String,
    pub agent_id: String,
    pub experience: String,
    #[serde(rename = "type")]
    pub experience_type: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub score: Option<f64>,
    pub created: DateTime<Utc>,
}

/// A search hit with its match score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceMatch {
    #[serde(flatten)]
    pub experience: Experience,
    pub match_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperienceIndex {
    by_agent: HashMap<String, Vec<String>>,
    by_type: HashMap<String, Vec<String>>,
    total: u64,
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceStats {
    pub total_experiences: u64,
    pub agent_count: usize,
    pub type_count: usize,
    pub types: Vec<String>,
}

/// Append-only experience store with a secondary index.
pub struct ExperienceStore {
    experiences_file: PathBuf,
    index_file: PathBuf,
    index: Mutex<ExperienceIndex>,
}

impl ExperienceStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = storage_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let experiences_file = dir.join("experiences.jsonl");
        let index_file = dir.join("index.json");

        let index = if index_file.exists() {
            serde_json::from_str(&std::fs::read_to_string(&index_file)?).unwrap_or_default()
        } else {
            ExperienceIndex::default()
        };

        Ok(Self {
            experiences_file,
            index_file,
            index: Mutex::new(index),
        })
    }

    fn generate_id(agent_id: &str, content: &str) -> String {
        let prefix: String = content.chars().take(100).collect();
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(format!("{}-{}-{}", agent_id, prefix, nanos));
        let digest = hasher.finalize();
        hex_prefix(&digest, 12)
    }

    /// Lowercased alphabetic tokens of length >= 3 minus stopwords, capped.
    pub fn extract_keywords(text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        WORD_RE
            .find_iter(&lower)
            .map(|m| m.as_str().to_string())
            .filter(|w| !STOPWORDS.contains(w.as_str()))
            .take(MAX_KEYWORDS)
            .collect()
    }

    /// Append an experience and update the index. Returns the new id.
    pub fn store_experience(
        &self,
        agent_id: &str,
        experience: &str,
        experience_type: &str,
        metadata: Option<Value>,
        score: Option<f64>,
    ) -> Result<String> {
        let entry = Experience {
            id: Self::generate_id(agent_id, experience),
            agent_id: agent_id.to_string(),
            experience: experience.to_string(),
            experience_type: experience_type.to_string(),
            keywords: Self::extract_keywords(experience),
            metadata: metadata.unwrap_or(Value::Null),
            score,
            created: Utc::now(),
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.experiences_file)?;
        file.lock_exclusive()?;
        let write_result = (&file).write_all(line.as_bytes());
        let _ = FileExt::unlock(&file);
        write_result?;

        let mut index = self.index.lock().expect("index lock");
        index
            .by_agent
            .entry(agent_id.to_string())
            .or_default()
            .push(entry.id.clone());
        index
            .by_type
            .entry(experience_type.to_string())
            .or_default()
            .push(entry.id.clone());
        index.total += 1;
        self.save_index(&index)?;

        Ok(entry.id)
    }

    fn save_index(&self, index: &ExperienceIndex) -> Result<()> {
        std::fs::write(&self.index_file, serde_json::to_string_pretty(index)?)?;
        Ok(())
    }

    fn scan<F>(&self, mut keep: F) -> Result<Vec<Experience>>
    where
        F: FnMut(&Experience) -> bool,
    {
        if !self.experiences_file.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.experiences_file)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let Ok(entry) = serde_json::from_str::<Experience>(line.trim()) else {
                continue;
            };
            if keep(&entry) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Most recent experiences for an agent, newest first.
    pub fn retrieve_recent(
        &self,
        agent_id: &str,
        limit: usize,
        experience_type: Option<&str>,
    ) -> Result<Vec<Experience>> {
        let mut matches = self.scan(|e| {
            e.agent_id == agent_id
                && experience_type
                    .map(|t| e.experience_type == t)
                    .unwrap_or(true)
        })?;
        let skip = matches.len().saturating_sub(limit);
        matches.drain(..skip);
        matches.reverse();
        Ok(matches)
    }

    /// Keyword search: score = matching keywords / query keywords.
    pub fn search_by_keywords(
        &self,
        keywords: &[String],
        limit: usize,
        agent_id: Option<&str>,
    ) -> Result<Vec<ExperienceMatch>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();

        let candidates = self.scan(|e| agent_id.map(|a| e.agent_id == a).unwrap_or(true))?;
        let mut results: Vec<ExperienceMatch> = candidates
            .into_iter()
            .filter_map(|e| {
                let matches = query.iter().filter(|k| e.keywords.contains(k)).count();
                if matches > 0 {
                    Some(ExperienceMatch {
                        match_score: matches as f64 / query.len() as f64,
                        experience: e,
                    })
                } else {
                    None
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }

    pub fn get_by_type(&self, experience_type: &str, limit: usize) -> Result<Vec<Experience>> {
        let mut matches = self.scan(|e| e.experience_type == experience_type)?;
        let skip = matches.len().saturating_sub(limit);
        matches.drain(..skip);
        matches.reverse();
        Ok(matches)
    }

    pub fn get_high_scoring(
        &self,
        min_score: f64,
        limit: usize,
        agent_id: Option<&str>,
    ) -> Result<Vec<Experience>> {
        let mut matches = self.scan(|e| {
            e.score.map(|s| s >= min_score).unwrap_or(false)
                && agent_id.map(|a| e.agent_id == a).unwrap_or(true)
        })?;
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn stats(&self) -> ExperienceStats {
        let index = self.index.lock().expect("index lock");
        ExperienceStats {
            total_experiences: index.total,
            agent_count: index.by_agent.len(),
            type_count: index.by_type.len(),
            types: index.by_type.keys().cloned().collect(),
        }
    }

    /// Rebuild the secondary index from the experiences file.
    pub fn rebuild_index(&self) -> Result<()> {
        let mut fresh = ExperienceIndex::default();
        for entry in self.scan(|_| true)? {
            fresh
                .by_agent
                .entry(entry.agent_id.clone())
                .or_default()
                .push(entry.id.clone());
            fresh
                .by_type
                .entry(entry.experience_type.clone())
                .or_default()
                .push(entry.id);
            fresh.total += 1;
        }
        let mut index = self.index.lock().expect("index lock");
        *index = fresh;
        self.save_index(&index)
    }
}

/// Sink for components that only need to append experiences (ReAct).
pub trait ExperienceSink: Send + Sync {
    fn record(
        &self,
        agent_id: &str,
        experience: &str,
        experience_type: &str,
        score: Option<f64>,
    ) -> Result<String>;
}

impl ExperienceSink for ExperienceStore {
    fn record(
        &self,
        agent_id: &str,
        experience: &str,
        experience_type: &str,
        score: Option<f64>,
    ) -> Result<String> {
        self.store_experience(agent_id, experience, experience_type, None, score)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut s = String::with_capacity(len);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
        if s.len() >= len {
            break;
        }
    }
    s.truncate(len);
    s
}
