//! Multi-agent coordination core
//!
//! The shared substrate for a fleet of heterogeneous agents organized in a
//! command / pm / worker hierarchy:
//! - Four-tier hierarchical memory with write-through routing
//! - Filesystem blackboard message bus with TTL'd mailboxes
//! - Task classification and utility-ranked federation routing
//! - Feedback-driven utility scoring and human-gated nominations
//! - Idle-time evolution scheduling and a reflective ReAct executor
//! - Risk-rule enforcement and declarative tool chains

pub mod blackboard;
pub mod config;
pub mod error;
pub mod evolution;
pub mod exec;
pub mod llm;
pub mod memory;
pub mod react;
pub mod risk;
pub mod routing;
pub mod scoring;
pub mod toolchain;

// Re-exports for convenience
pub use blackboard::{AgentRef, Blackboard, MessageEnvelope};
pub use config::CoreConfig;
pub use error::{CoreError, ErrorKind};
pub use evolution::EvolutionScheduler;
pub use exec::TaskExecutor;
pub use llm::LLMProvider;
pub use memory::MemoryManager;
pub use react::ReactExecutor;
pub use risk::RiskController;
pub use routing::{classify, FederationRouter};
pub use scoring::{NominationManager, UtilityScorer};
pub use toolchain::{ChainRunner, ToolRegistry};
