//! Evolution Scheduler
//!
//! Priority-tiered background queues (P1 knowledge, P2 training, P3
//! exploration, P4 soul drafts) drained one task per idle cycle and
//! dispatched to the external executor.

pub mod queue;
pub mod scheduler;

pub use queue::{EvolutionPayload, EvolutionQueue, EvolutionTask, EvolutionTaskStatus, Priority};
pub use scheduler::{EvolutionScheduler, SchedulerState, SchedulerStats};
