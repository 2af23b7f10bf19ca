//! Blackboard Message Bus
//!
//! Filesystem-backed inbox/outbox queues with TTL expiry and at-least-once
//! delivery. All cross-agent coordination flows through here.

pub mod envelope;
pub mod mailbox;

pub use envelope::{AgentRef, MessageEnvelope, MessageType, Priority};
pub use mailbox::Blackboard;
