//! Message envelope and canonical builders
//!
//! Every message on the blackboard carries the same envelope; the payload
//! shape depends on the message type. Builders fill in the default TTLs and
//! priorities for the four canonical shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const ENVELOPE_VERSION: &str = "1.0";

pub const DEFAULT_REQUEST_TTL_SECS: i64 = 3_600;
pub const DEFAULT_RESPONSE_TTL_SECS: i64 = 3_600;
pub const DEFAULT_NOTIFICATION_TTL_SECS: i64 = 86_400;
pub const DEFAULT_ERROR_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Sender or recipient of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl AgentRef {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            node: None,
        }
    }

    pub fn on_node(agent: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            node: Some(node.into()),
        }
    }
}

/// The envelope every blackboard message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub version: String,
    pub id: String,
    pub trace_id: String,
    pub from: AgentRef,
    pub to: AgentRef,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    /// Time-to-live in seconds; expired messages are discarded on read.
    pub ttl: i64,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl MessageEnvelope {
    fn base(
        from: AgentRef,
        to: AgentRef,
        message_type: MessageType,
        priority: Priority,
        ttl: i64,
        payload: Value,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            from,
            to,
            message_type,
            priority,
            timestamp: Utc::now(),
            ttl,
            payload,
            metadata: Value::Null,
        }
    }

    /// Request: `{action, params, deadline?}`.
    pub fn request(from: AgentRef, to: AgentRef, action: &str, params: Value) -> Self {
        Self::base(
            from,
            to,
            MessageType::Request,
            Priority::Normal,
            DEFAULT_REQUEST_TTL_SECS,
            json!({"action": action, "params": params}),
        )
    }

    pub fn request_with_deadline(
        from: AgentRef,
        to: AgentRef,
        action: &str,
        params: Value,
        deadline: DateTime<Utc>,
    ) -> Self {
        let mut msg = Self::request(from, to, action, params);
        if let Some(obj) = msg.payload.as_object_mut() {
            obj.insert("deadline".to_string(), json!(deadline.to_rfc3339()));
        }
        msg
    }

    /// Response: `{requestId, status, result, error?}`. Shares the request's
    /// trace id so the pair is groupable.
    pub fn response(
        from: AgentRef,
        to: AgentRef,
        request: &MessageEnvelope,
        status: &str,
        result: Value,
        error: Option<&str>,
    ) -> Self {
        let mut payload = json!({
            "requestId": request.id,
            "status": status,
            "result": result,
        });
        if let Some(err) = error {
            payload["error"] = json!(err);
        }
        let mut msg = Self::base(
            from,
            to,
            MessageType::Response,
            Priority::Normal,
            DEFAULT_RESPONSE_TTL_SECS,
            payload,
        );
        msg.trace_id = request.trace_id.clone();
        msg
    }

    /// Notification: `{event, message, progress?}`.
    pub fn notification(from: AgentRef, to: AgentRef, event: &str, message: &str) -> Self {
        Self::base(
            from,
            to,
            MessageType::Notification,
            Priority::Normal,
            DEFAULT_NOTIFICATION_TTL_SECS,
            json!({"event": event, "message": message}),
        )
    }

    /// Progress notification with a guarded percentage (0 when total is 0).
    pub fn progress_notification(
        from: AgentRef,
        to: AgentRef,
        event: &str,
        message: &str,
        current: u64,
        total: u64,
    ) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64 * 1000.0).round() / 10.0
        };
        let mut msg = Self::notification(from, to, event, message);
        if let Some(obj) = msg.payload.as_object_mut() {
            obj.insert(
                "progress".to_string(),
                json!({"current": current, "total": total, "percent": percent}),
            );
        }
        msg
    }

    /// Error: `{requestId, code, message, recoverable, suggestion?}`,
    /// high priority.
    pub fn error(
        from: AgentRef,
        to: AgentRef,
        request_id: Option<&str>,
        code: &str,
        message: &str,
        recoverable: bool,
        suggestion: Option<&str>,
    ) -> Self {
        let mut payload = json!({
            "requestId": request_id,
            "code": code,
            "message": message,
            "recoverable": recoverable,
        });
        if let Some(s) = suggestion {
            payload["suggestion"] = json!(s);
        }
        Self::base(
            from,
            to,
            MessageType::Error,
            Priority::High,
            DEFAULT_ERROR_TTL_SECS,
            payload,
        )
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl = ttl_secs;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Age in seconds at `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age_secs(now) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let msg = MessageEnvelope::request(
            AgentRef::new("gm"),
            AgentRef::new("coder-frontend"),
            "implement",
            json!({"feature": "login"}),
        );
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.ttl, 3600);
        assert_eq!(msg.payload["action"], "implement");
        assert_eq!(msg.version, ENVELOPE_VERSION);
    }

    #[test]
    fn test_response_shares_trace() {
        let req = MessageEnvelope::request(
            AgentRef::new("gm"),
            AgentRef::new("henry"),
            "write",
            json!({}),
        );
        let resp = MessageEnvelope::response(
            AgentRef::new("henry"),
            AgentRef::new("gm"),
            &req,
            "completed",
            json!({"output": "done"}),
            None,
        );
        assert_eq!(resp.trace_id, req.trace_id);
        assert_eq!(resp.payload["requestId"], json!(req.id));
        assert_ne!(resp.id, req.id);
    }

    #[test]
    fn test_error_is_high_priority() {
        let msg = MessageEnvelope::error(
            AgentRef::new("henry"),
            AgentRef::new("gm"),
            Some("req-1"),
            "TOOL_FAILURE",
            "tool crashed",
            true,
            Some("retry with smaller input"),
        );
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.ttl, 86_400);
        assert_eq!(msg.payload["recoverable"], json!(true));
    }

    #[test]
    fn test_progress_percent_guard() {
        let msg = MessageEnvelope::progress_notification(
            AgentRef::new("a"),
            AgentRef::new("b"),
            "step",
            "working",
            0,
            0,
        );
        assert_eq!(msg.payload["progress"]["percent"], json!(0.0));

        let msg = MessageEnvelope::progress_notification(
            AgentRef::new("a"),
            AgentRef::new("b"),
            "step",
            "working",
            1,
            3,
        );
        assert_eq!(msg.payload["progress"]["percent"], json!(33.3));
    }

    #[test]
    fn test_expiry() {
        let mut msg = MessageEnvelope::notification(
            AgentRef::new("a"),
            AgentRef::new("b"),
            "tick",
            "hello",
        )
        .with_ttl(1);
        msg.timestamp = Utc::now() - chrono::Duration::seconds(5);
        assert!(msg.is_expired(Utc::now()));

        msg.timestamp = Utc::now();
        assert!(!msg.is_expired(Utc::now()));
    }
}
