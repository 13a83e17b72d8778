use serde::{Deserialize, Serialize};

/// One atomic unit of agent output, ordered by emission time within a
/// session. The buffered event history is the single source of truth for a
/// session's state: replaying it in order reconstructs the live view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    Text,
    Thinking,
    ThinkingStart,
    ToolStart,
    ToolInput,
    ToolResult,
    ToolProgress,
    BlockStop,
    MessageStart,
    MessageStop,
    Status,
    Result,
    Error,
}

impl AgentEvent {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: chrono::Utc::now(),
        }
    }

    /// The pipeline's opening event; `session_id` is the external resume
    /// token used by a later `start` to continue the conversation.
    pub fn init(resume_token: &str) -> Self {
        Self::new(
            EventKind::Init,
            serde_json::json!({ "session_id": resume_token }),
        )
    }

    pub fn text(text: &str) -> Self {
        Self::new(EventKind::Text, serde_json::json!({ "text": text }))
    }

    pub fn result(cost_usd: f64, duration_ms: u64, is_error: bool) -> Self {
        Self::new(
            EventKind::Result,
            serde_json::json!({
                "cost_usd": cost_usd,
                "duration_ms": duration_ms,
                "is_error": is_error,
            }),
        )
    }

    pub fn error(message: &str) -> Self {
        Self::new(EventKind::Error, serde_json::json!({ "message": message }))
    }

    /// Resume token carried by an `init` event, if any.
    pub fn resume_token(&self) -> Option<&str> {
        if self.kind != EventKind::Init {
            return None;
        }
        self.data.get("session_id").and_then(|v| v.as_str())
    }
}
