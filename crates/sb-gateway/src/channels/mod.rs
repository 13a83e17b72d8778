pub mod chat;
pub mod files;
pub mod terminal;

use crate::error::GatewayError;
use crate::rooms::ConnectionHandle;
use async_trait::async_trait;

pub use chat::ChatChannel;
pub use files::FilesChannel;
pub use terminal::TerminalChannel;

/// A named subsystem reachable through subscribe/message dispatch.
///
/// A channel never holds a connection beyond the duration of a call: all
/// addressing happens through room membership, which `subscribe` is
/// responsible for establishing (and `unsubscribe` for tearing down).
/// `unsubscribe` must be idempotent and side-effect bounded: a departing
/// subscriber never terminates the underlying session.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Join the connection to the room identified by `params`, emitting any
    /// initial state (replay, scrollback, listing) to it. Returns the room
    /// key recorded for disconnect cleanup.
    async fn subscribe(
        &self,
        conn: &ConnectionHandle,
        params: &serde_json::Value,
    ) -> Result<String, GatewayError>;

    /// Reverse of `subscribe` for one recorded room key.
    async fn unsubscribe(&self, conn: &ConnectionHandle, room: &str);

    /// Channel-specific RPC.
    async fn message(
        &self,
        conn: &ConnectionHandle,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<(), GatewayError>;
}

/// Shared payload helpers for channel implementations.
pub(crate) fn payload_session_id(
    payload: &serde_json::Value,
) -> Result<uuid::Uuid, GatewayError> {
    payload
        .get("session_id")
        .and_then(|v| v.as_str())
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
        .ok_or_else(|| GatewayError::InvalidPayload("missing or invalid session_id".to_string()))
}
