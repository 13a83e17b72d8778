use crate::channels::{payload_session_id, Channel};
use crate::error::GatewayError;
use crate::rooms::{ConnectionHandle, Rooms};
use crate::ws::messages::ServerEnvelope;
use async_trait::async_trait;
use sb_agent::{ChatManager, ChatUpdate, UpdateSink};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub const CHAT_CHANNEL: &str = "chat";

fn session_room(id: Uuid) -> String {
    format!("chat:{id}")
}

/// Maps chat manager updates onto room broadcasts. Per-session updates are
/// published under the session lock, so their room delivery order equals
/// emission order and never races a replay hand-off.
pub fn chat_update_sink(rooms: Arc<Rooms>) -> UpdateSink {
    Arc::new(move |update: &ChatUpdate| match update {
        ChatUpdate::Started {
            session_id,
            summary,
        } => {
            rooms.broadcast(
                &session_room(*session_id),
                &ServerEnvelope::chat_started(*session_id, summary),
            );
        }
        ChatUpdate::Event { session_id, event } => {
            rooms.broadcast(
                &session_room(*session_id),
                &ServerEnvelope::chat_event(*session_id, event),
            );
        }
        ChatUpdate::Completed {
            session_id,
            cost_usd,
            duration_ms,
        } => {
            rooms.broadcast(
                &session_room(*session_id),
                &ServerEnvelope::chat_completed(*session_id, *cost_usd, *duration_ms),
            );
        }
        ChatUpdate::Aborted { session_id } => {
            rooms.broadcast(
                &session_room(*session_id),
                &ServerEnvelope::chat_aborted(*session_id),
            );
        }
        ChatUpdate::Error {
            session_id,
            message,
        } => {
            rooms.broadcast(
                &session_room(*session_id),
                &ServerEnvelope::chat_error(*session_id, message),
            );
        }
        ChatUpdate::SessionsChanged { sessions } => {
            rooms.broadcast(CHAT_CHANNEL, &ServerEnvelope::chat_sessions(sessions));
        }
    })
}

pub struct ChatChannel {
    chat: Arc<ChatManager>,
    rooms: Arc<Rooms>,
    default_cwd: PathBuf,
}

impl ChatChannel {
    pub fn new(chat: Arc<ChatManager>, rooms: Arc<Rooms>, default_cwd: PathBuf) -> Self {
        Self {
            chat,
            rooms,
            default_cwd,
        }
    }

    fn cwd_from(&self, payload: &serde_json::Value) -> PathBuf {
        payload
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_cwd.clone())
    }
}

#[async_trait]
impl Channel for ChatChannel {
    fn name(&self) -> &'static str {
        CHAT_CHANNEL
    }

    async fn subscribe(
        &self,
        conn: &ConnectionHandle,
        params: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        let session_id = params
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        let Some(id) = session_id else {
            // Channel-level subscription: the session list.
            self.rooms.join(CHAT_CHANNEL, conn);
            conn.send(ServerEnvelope::chat_sessions(&self.chat.summaries()));
            return Ok(CHAT_CHANNEL.to_string());
        };

        let room = session_room(id);
        let joined = self.chat.subscribe_session(id, |replay| {
            // Under the session lock: join the room first, then enqueue the
            // replay. Any event published after this point reaches the
            // connection through the room, strictly after the replay.
            self.rooms.join(&room, conn);
            conn.send(ServerEnvelope::chat_replay(id, replay));
        });

        match joined {
            Ok(()) => Ok(room),
            Err(sb_agent::AgentError::SessionNotFound(_)) => {
                // Not in memory: serve the historical record as a single
                // read-only conversation payload.
                let record = self.chat.load_conversation(id)?;
                self.rooms.join(&room, conn);
                conn.send(ServerEnvelope::chat_conversation(&record));
                Ok(room)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn unsubscribe(&self, conn: &ConnectionHandle, room: &str) {
        // Only the subscriber departs; the session keeps running.
        self.rooms.leave(room, conn.id);
    }

    async fn message(
        &self,
        conn: &ConnectionHandle,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        match action {
            "start" => {
                let message = payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        GatewayError::InvalidPayload("missing message".to_string())
                    })?
                    .to_string();
                let resume_id = payload
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(|s| {
                        Uuid::parse_str(s).map_err(|_| {
                            GatewayError::InvalidPayload("invalid session_id".to_string())
                        })
                    })
                    .transpose()?;
                let cwd = self.cwd_from(payload);
                self.chat.start(message, resume_id, cwd)?;
                Ok(())
            }
            "abort" => {
                let id = payload_session_id(payload)?;
                self.chat.abort(id)?;
                Ok(())
            }
            "load" => {
                let id = payload_session_id(payload)?;
                let record = self.chat.load_conversation(id)?;
                conn.send(ServerEnvelope::chat_conversation(&record));
                Ok(())
            }
            "list" => {
                conn.send(ServerEnvelope::chat_sessions(&self.chat.summaries()));
                Ok(())
            }
            other => Err(GatewayError::UnsupportedMessage {
                channel: CHAT_CHANNEL.to_string(),
                action: other.to_string(),
            }),
        }
    }
}
