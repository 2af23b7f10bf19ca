//! Core error taxonomy
//!
//! Structured errors surfaced at public seams. Internal plumbing uses
//! `anyhow::Result`; these variants are for callers that need to branch
//! on the failure class.

use thiserror::Error;

/// Failure classes recognized across the coordination core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Schema or rule violation; carries the offending path or rule id.
    Validation,
    /// No candidate agent, node offline, or a required file is missing.
    Unavailable,
    /// Subprocess timeout or filesystem race; retryable by the owner.
    Transient,
    /// Data corruption; the subsystem refuses to proceed.
    Fatal,
    /// Risk-rule denial.
    Policy,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<anyhow::Error>,
    /// Free-form context: rule id, file path, agent id, etc.
    pub context: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            context: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Policy, message)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::policy("action forbidden").with_context("rule:alpha-isolation");
        assert_eq!(err.kind, ErrorKind::Policy);
        assert!(err.to_string().contains("action forbidden"));
        assert_eq!(err.context.as_deref(), Some("rule:alpha-isolation"));
    }
}
