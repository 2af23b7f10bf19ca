//! ReAct Executor
//!
//! Think/Act/Observe/Reflect/Adapt executor over the oracle seam, with
//! lenient response parsing and experience emission into L3.

pub mod executor;
pub mod parse;

pub use executor::{CycleDecision, CycleRecord, ExecutionReport, Phase, PhaseRecord, ReactExecutor};
pub use parse::parse_json_response;
