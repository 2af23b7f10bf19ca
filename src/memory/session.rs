//! L1 Session Memory - RAM-based session context
//!
//! Fast in-process storage for the current session. Nothing here survives
//! process exit; `export`/`from_export` exist so L4 can archive a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const MAX_SIZE_BYTES: usize = 100 * 1024 * 1024;
const MAX_KEYS: usize = 10_000;

/// One stored value with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// Serializable snapshot of a session, suitable for L4 archiving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    pub session_id: String,
    pub created: DateTime<Utc>,
    pub context: Vec<(String, SessionEntry)>,
    pub size_estimate: usize,
}

/// Session-scoped context store, bounded by byte estimate and key count.
///
/// Eviction is oldest-key-first by insertion order; `store` returns `false`
/// only when the new entry alone would still exceed the byte budget.
pub struct SessionMemory {
    session_id: String,
    created: DateTime<Utc>,
    // Insertion order is the eviction order, so keep an explicit sequence.
    order: Vec<String>,
    context: BTreeMap<String, SessionEntry>,
    size_estimate: usize,
}

impl SessionMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created: Utc::now(),
            order: Vec::new(),
            context: BTreeMap::new(),
            size_estimate: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn entry_size(key: &str, entry: &SessionEntry) -> usize {
        let value_size = serde_json::to_string(&entry.value)
            .map(|s| s.len())
            .unwrap_or(1024);
        value_size + key.len() * 2
    }

    /// Store a value under `key`. Returns `false` if the byte budget cannot
    /// accommodate the entry even after evicting the oldest keys.
    pub fn store(&mut self, key: impl Into<String>, value: Value, metadata: Option<Value>) -> bool {
        let key = key.into();
        let entry = SessionEntry {
            value,
            timestamp: Utc::now(),
            metadata: metadata.unwrap_or(Value::Null),
        };
        let entry_size = Self::entry_size(&key, &entry);

        if entry_size > MAX_SIZE_BYTES {
            return false;
        }

        // Replacing an existing key frees its old footprint first.
        if self.context.contains_key(&key) {
            self.delete(&key);
        }

        while self.size_estimate + entry_size > MAX_SIZE_BYTES || self.context.len() >= MAX_KEYS {
            let Some(oldest) = self.order.first().cloned() else {
                break;
            };
            self.delete(&oldest);
        }

        if self.size_estimate + entry_size > MAX_SIZE_BYTES {
            return false;
        }

        self.order.push(key.clone());
        self.context.insert(key, entry);
        self.size_estimate += entry_size;
        true
    }

    pub fn retrieve(&self, key: &str) -> Option<&Value> {
        self.context.get(key).map(|e| &e.value)
    }

    /// Full entry including timestamp and metadata.
    pub fn get_entry(&self, key: &str) -> Option<&SessionEntry> {
        self.context.get(key)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        if let Some(entry) = self.context.remove(key) {
            let size = Self::entry_size(key, &entry);
            self.size_estimate = self.size_estimate.saturating_sub(size);
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.context.clear();
        self.order.clear();
        self.size_estimate = 0;
    }

    pub fn keys(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.context.contains_key(key)
    }

    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    /// Export the session for persistence or transfer.
    pub fn export(&self) -> SessionExport {
        SessionExport {
            session_id: self.session_id.clone(),
            created: self.created,
            context: self
                .order
                .iter()
                .filter_map(|k| self.context.get(k).map(|e| (k.clone(), e.clone())))
                .collect(),
            size_estimate: self.size_estimate,
        }
    }

    /// Restore a session from an export.
    pub fn from_export(export: SessionExport) -> Self {
        let mut order = Vec::with_capacity(export.context.len());
        let mut context = BTreeMap::new();
        for (key, entry) in export.context {
            order.push(key.clone());
            context.insert(key, entry);
        }
        Self {
            session_id: export.session_id,
            created: export.created,
            order,
            context,
            size_estimate: export.size_estimate,
        }
    }
}
