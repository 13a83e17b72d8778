use base64::Engine;
use sb_agent::store::ChatRecord;
use sb_agent::{AgentEvent, ChatReplay, ChatSummary};
use sb_fs::FsEvent;
use sb_pty::TermSummary;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One client request: subscribe/unsubscribe join or leave a channel,
/// `message` carries a channel-scoped RPC.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub channel: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    pub action: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsError {
    pub code: String,
    pub message: String,
}

/// One server-to-client notification, channel-scoped by `type`
/// (e.g. `chat:event`, `terminal:data`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl ServerEnvelope {
    pub fn new(msg_type: &str, payload: serde_json::Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            payload,
            request_id: None,
            error: None,
        }
    }

    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }

    pub fn error(request_id: Option<String>, code: &str, message: &str) -> Self {
        Self {
            msg_type: "error".to_string(),
            payload: serde_json::Value::Null,
            request_id,
            error: Some(WsError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }

    // -- chat ---------------------------------------------------------------

    pub fn chat_sessions(sessions: &[ChatSummary]) -> Self {
        Self::new("chat:sessions", serde_json::json!({ "sessions": sessions }))
    }

    pub fn chat_started(session_id: Uuid, summary: &ChatSummary) -> Self {
        Self::new(
            "chat:started",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "session": summary,
            }),
        )
    }

    pub fn chat_event(session_id: Uuid, event: &AgentEvent) -> Self {
        Self::new(
            "chat:event",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "event": event,
            }),
        )
    }

    pub fn chat_completed(
        session_id: Uuid,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    ) -> Self {
        Self::new(
            "chat:completed",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "result": {
                    "cost_usd": cost_usd,
                    "duration_ms": duration_ms,
                },
            }),
        )
    }

    pub fn chat_aborted(session_id: Uuid) -> Self {
        Self::new(
            "chat:aborted",
            serde_json::json!({ "session_id": session_id.to_string() }),
        )
    }

    pub fn chat_error(session_id: Uuid, message: &str) -> Self {
        Self::new(
            "chat:error",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "message": message,
            }),
        )
    }

    /// State snapshot plus the full buffered history, sent to a joining
    /// connection before any live event.
    pub fn chat_replay(session_id: Uuid, replay: &ChatReplay) -> Self {
        Self::new(
            "chat:replay",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "session": replay.summary,
                "events": replay.events,
            }),
        )
    }

    /// Read-only historical timeline loaded from the on-disk record.
    pub fn chat_conversation(record: &ChatRecord) -> Self {
        Self::new(
            "chat:conversation",
            serde_json::json!({
                "session_id": record.session_id.to_string(),
                "session": record.summary(),
                "events": record.events,
            }),
        )
    }

    // -- terminal -----------------------------------------------------------

    pub fn terminal_sessions(sessions: &[TermSummary]) -> Self {
        Self::new(
            "terminal:sessions",
            serde_json::json!({ "sessions": sessions }),
        )
    }

    pub fn terminal_created(summary: &TermSummary) -> Self {
        Self::new("terminal:created", serde_json::json!({ "session": summary }))
    }

    pub fn terminal_joined(session_id: Uuid, scrollback: &[u8], cols: u16, rows: u16) -> Self {
        Self::new(
            "terminal:joined",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "scrollback": base64_encode(scrollback),
                "cols": cols,
                "rows": rows,
            }),
        )
    }

    pub fn terminal_data(session_id: Uuid, data: &[u8]) -> Self {
        Self::new(
            "terminal:data",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "data": base64_encode(data),
            }),
        )
    }

    pub fn terminal_exit(session_id: Uuid, exit_code: Option<u32>) -> Self {
        Self::new(
            "terminal:exit",
            serde_json::json!({
                "session_id": session_id.to_string(),
                "exit_code": exit_code,
            }),
        )
    }

    pub fn terminal_terminated(session_id: Uuid) -> Self {
        Self::new(
            "terminal:terminated",
            serde_json::json!({ "session_id": session_id.to_string() }),
        )
    }

    // -- files --------------------------------------------------------------

    pub fn files_change(root: &str, event: &FsEvent) -> Self {
        Self::new(
            "files:change",
            serde_json::json!({
                "root": root,
                "type": event.kind,
                "path": event.path,
                "timestamp": event.timestamp,
            }),
        )
    }
}

fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_parses_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","channel":"chat","params":{"session_id":"x"}}"#,
        )
        .unwrap();
        assert_eq!(msg.msg_type, "subscribe");
        assert_eq!(msg.channel.as_deref(), Some("chat"));
        assert_eq!(msg.params["session_id"], "x");
        assert!(msg.action.is_none());
    }

    #[test]
    fn client_message_parses_rpc() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"message","channel":"terminal","action":"input","payload":{"data":"ls"},"request_id":"r1"}"#,
        )
        .unwrap();
        assert_eq!(msg.msg_type, "message");
        assert_eq!(msg.action.as_deref(), Some("input"));
        assert_eq!(msg.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn envelope_error_shape() {
        let env = ServerEnvelope::error(Some("r2".into()), "SESSION_NOT_FOUND", "gone");
        assert_eq!(env.msg_type, "error");
        assert_eq!(env.request_id.as_deref(), Some("r2"));
        let err = env.error.unwrap();
        assert_eq!(err.code, "SESSION_NOT_FOUND");
        assert_eq!(err.message, "gone");
    }

    #[test]
    fn envelope_with_request_id() {
        let env = ServerEnvelope::new("x", serde_json::Value::Null)
            .with_request_id(Some("req".into()));
        assert_eq!(env.request_id.as_deref(), Some("req"));
    }

    #[test]
    fn terminal_data_is_base64() {
        let env = ServerEnvelope::terminal_data(Uuid::nil(), b"hello");
        assert_eq!(env.msg_type, "terminal:data");
        assert_eq!(env.payload["data"], "aGVsbG8=");
    }

    #[test]
    fn terminal_joined_carries_scrollback_and_size() {
        let env = ServerEnvelope::terminal_joined(Uuid::nil(), b"abc", 80, 24);
        assert_eq!(env.payload["scrollback"], "YWJj");
        assert_eq!(env.payload["cols"], 80);
        assert_eq!(env.payload["rows"], 24);
    }

    #[test]
    fn chat_event_embeds_typed_event() {
        let event = AgentEvent::text("hi");
        let env = ServerEnvelope::chat_event(Uuid::nil(), &event);
        assert_eq!(env.msg_type, "chat:event");
        assert_eq!(env.payload["event"]["type"], "text");
        assert_eq!(env.payload["event"]["data"]["text"], "hi");
    }

    #[test]
    fn files_change_wire_shape() {
        let event = FsEvent {
            kind: sb_fs::FsEventKind::Modify,
            path: "src/main.rs".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let env = ServerEnvelope::files_change("/repo", &event);
        assert_eq!(env.msg_type, "files:change");
        assert_eq!(env.payload["type"], "modify");
        assert_eq!(env.payload["path"], "src/main.rs");
        assert_eq!(env.payload["root"], "/repo");
    }

    #[test]
    fn base64_roundtrip() {
        let data = b"\x00\x01terminal bytes\xff";
        let encoded = base64_encode(data);
        assert_eq!(base64_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn serde_roundtrip() {
        let env = ServerEnvelope::chat_aborted(Uuid::nil()).with_request_id(Some("r".into()));
        let json = serde_json::to_string(&env).unwrap();
        let parsed: ServerEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.msg_type, "chat:aborted");
        assert_eq!(parsed.request_id.as_deref(), Some("r"));
    }
}
