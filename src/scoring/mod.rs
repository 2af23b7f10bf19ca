//! Utility Scoring & Nomination
//!
//! Feedback-driven scoring loop: validators append feedback, the scorer
//! maintains per-agent utility scores, and the nomination manager turns
//! sustained high scores into human-gated promotion proposals.

pub mod feedback;
pub mod nomination;
pub mod scorer;

pub use feedback::{FeedbackCollector, FeedbackRecord, FeedbackScores, FeedbackSummary};
pub use nomination::{Nomination, NominationManager, NominationStatus};
pub use scorer::{ScoreRecord, UtilityScorer, NOMINATION_THRESHOLD, WARNING_THRESHOLD};
