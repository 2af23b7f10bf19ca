//! Hierarchical Memory
//!
//! Four independent tiers behind one façade:
//! - L1 session context (RAM, bounded, session-scoped)
//! - L2 task history (SQLite, persistent)
//! - L3 experiences (JSONL, keyword-searchable)
//! - L4 snapshot (git-tracked cross-machine exports)

pub mod experience;
pub mod history;
pub mod manager;
pub mod session;
pub mod snapshot;

pub use experience::{Experience, ExperienceMatch, ExperienceSink, ExperienceStore};
pub use history::{AgentStats, DecisionRecord, TaskHistory, TaskRecord, TaskStatus};
pub use manager::{AgentContext, ArchiveReceipt, MemoryManager, StoreReceipt};
pub use session::{SessionExport, SessionMemory};
pub use snapshot::{RepoStatus, SnapshotRepo, SyncOutcome};
