//! Risk Controller
//!
//! Rule-driven enforcement consulted before any dispatch. Rules are loaded
//! once; the immutable subset survives reloads untouched. Hard violations
//! deny the action, soft violations allow it with a warning, and every
//! violation lands in the persistent log.

pub mod controller;

pub use controller::{
    Enforcement, RiskContext, RiskController, RiskLimitsFile, RiskRule, RiskVerdict, RuleKind,
};
