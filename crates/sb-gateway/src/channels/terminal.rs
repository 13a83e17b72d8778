use crate::channels::{payload_session_id, Channel};
use crate::error::GatewayError;
use crate::rooms::{ConnectionHandle, Rooms};
use crate::ws::messages::{base64_decode, ServerEnvelope};
use async_trait::async_trait;
use sb_pty::{PtyOutput, TermPool, TermSession};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TERMINAL_CHANNEL: &str = "terminal";

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

fn session_room(id: Uuid) -> String {
    format!("terminal:{id}")
}

pub struct TerminalChannel {
    pool: Arc<TermPool>,
    rooms: Arc<Rooms>,
    default_cwd: PathBuf,
}

impl TerminalChannel {
    pub fn new(pool: Arc<TermPool>, rooms: Arc<Rooms>, default_cwd: PathBuf) -> Self {
        Self {
            pool,
            rooms,
            default_cwd,
        }
    }

    /// Drain the session's output queue: append to scrollback and broadcast
    /// under the scrollback mutex, so a concurrent join never tears the
    /// buffer or misses a chunk. Exit evicts the session and notifies the
    /// room unless an explicit terminate got there first.
    fn spawn_pump(pool: Arc<TermPool>, rooms: Arc<Rooms>, session: Arc<TermSession>) {
        let Some(mut rx) = session.take_output() else {
            return;
        };
        let room = session_room(session.id);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    PtyOutput::Data(chunk) => {
                        let scrollback = session.scrollback();
                        let mut guard = scrollback.lock().unwrap_or_else(|e| e.into_inner());
                        guard.push(&chunk);
                        rooms.broadcast(&room, &ServerEnvelope::terminal_data(session.id, &chunk));
                    }
                    PtyOutput::Exit(code) => {
                        if pool.remove(&session.id).await.is_some() {
                            tracing::info!(session_id = %session.id, ?code, "terminal process exited");
                            rooms.broadcast(&room, &ServerEnvelope::terminal_exit(session.id, code));
                            rooms.broadcast(
                                TERMINAL_CHANNEL,
                                &ServerEnvelope::terminal_sessions(&pool.summaries().await),
                            );
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Periodic reap of sessions with zero subscribers idle past the
    /// timeout. Subscriber presence alone postpones eviction regardless of
    /// I/O idleness.
    pub fn spawn_idle_sweep(
        pool: Arc<TermPool>,
        rooms: Arc<Rooms>,
        idle_timeout: Duration,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for session in pool.list().await {
                    let room = session_room(session.id);
                    if rooms.member_count(&room) > 0 {
                        continue;
                    }
                    if session.idle_for() < idle_timeout {
                        continue;
                    }
                    tracing::info!(session_id = %session.id, "reaping idle terminal session");
                    let _ = session.kill().await;
                    if pool.remove(&session.id).await.is_some() {
                        rooms.broadcast(&room, &ServerEnvelope::terminal_terminated(session.id));
                        rooms.broadcast(
                            TERMINAL_CHANNEL,
                            &ServerEnvelope::terminal_sessions(&pool.summaries().await),
                        );
                    }
                }
            }
        })
    }

    async fn session(&self, payload: &serde_json::Value) -> Result<Arc<TermSession>, GatewayError> {
        let id = payload_session_id(payload)?;
        Ok(self.pool.get(&id).await?)
    }

    async fn broadcast_sessions(&self) {
        self.rooms.broadcast(
            TERMINAL_CHANNEL,
            &ServerEnvelope::terminal_sessions(&self.pool.summaries().await),
        );
    }

    async fn create(
        &self,
        conn: &ConnectionHandle,
        payload: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let title = payload
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Terminal")
            .to_string();
        let cwd = payload
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_cwd.clone());

        let session = self
            .pool
            .create(title, &cwd, DEFAULT_COLS, DEFAULT_ROWS)
            .await?;
        Self::spawn_pump(self.pool.clone(), self.rooms.clone(), session.clone());

        let summaries = self.pool.summaries().await;
        let summary = summaries
            .iter()
            .find(|s| s.session_id == session.id)
            .cloned();
        if let Some(summary) = summary {
            conn.send(ServerEnvelope::terminal_created(&summary));
        }
        self.broadcast_sessions().await;
        Ok(())
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn name(&self) -> &'static str {
        TERMINAL_CHANNEL
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
            self.rooms.join(TERMINAL_CHANNEL, conn);
            conn.send(ServerEnvelope::terminal_sessions(
                &self.pool.summaries().await,
            ));
            return Ok(TERMINAL_CHANNEL.to_string());
        };

        let session = self.pool.get(&id).await?;
        let room = session_room(id);
        {
            // Join + snapshot under the scrollback mutex: output pumped
            // concurrently lands either in the snapshot or in the room
            // queue after it, never both, never neither.
            let scrollback = session.scrollback();
            let guard = scrollback.lock().unwrap_or_else(|e| e.into_inner());
            self.rooms.join(&room, conn);
            let (cols, rows) = session.size();
            conn.send(ServerEnvelope::terminal_joined(
                id,
                &guard.snapshot(),
                cols,
                rows,
            ));
        }
        Ok(room)
    }

    async fn unsubscribe(&self, conn: &ConnectionHandle, room: &str) {
        // Leaving never kills the process.
        self.rooms.leave(room, conn.id);
    }

    async fn message(
        &self,
        conn: &ConnectionHandle,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        match action {
            "create" => self.create(conn, payload).await,
            "leave" => {
                let id = payload_session_id(payload)?;
                self.rooms.leave(&session_room(id), conn.id);
                Ok(())
            }
            "terminate" => {
                let session = self.session(payload).await?;
                let id = session.id;
                let _ = session.kill().await;
                if self.pool.remove(&id).await.is_some() {
                    self.rooms
                        .broadcast(&session_room(id), &ServerEnvelope::terminal_terminated(id));
                    self.broadcast_sessions().await;
                }
                Ok(())
            }
            "rename" => {
                let session = self.session(payload).await?;
                let title = payload
                    .get("title")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::InvalidPayload("missing title".to_string()))?;
                session.set_title(title.to_string());
                self.broadcast_sessions().await;
                Ok(())
            }
            "input" => {
                let session = self.session(payload).await?;
                let bytes = if let Some(b64) = payload.get("data_b64").and_then(|v| v.as_str()) {
                    base64_decode(b64).ok_or_else(|| {
                        GatewayError::InvalidPayload("invalid data_b64".to_string())
                    })?
                } else {
                    payload
                        .get("data")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .as_bytes()
                        .to_vec()
                };
                session.write(&bytes).await?;
                Ok(())
            }
            "resize" => {
                let session = self.session(payload).await?;
                let cols = payload.get("cols").and_then(|v| v.as_u64()).unwrap_or(80) as u16;
                let rows = payload.get("rows").and_then(|v| v.as_u64()).unwrap_or(24) as u16;
                session.resize(cols, rows).await?;
                Ok(())
            }
            "inject" => {
                let session = self.session(payload).await?;
                let command = payload
                    .get("command")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::InvalidPayload("missing command".to_string()))?;
                session.inject(command).await?;
                Ok(())
            }
            other => Err(GatewayError::UnsupportedMessage {
                channel: TERMINAL_CHANNEL.to_string(),
                action: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::ConnectionId;

    fn setup() -> (TerminalChannel, Arc<TermPool>, Arc<Rooms>) {
        let pool = Arc::new(TermPool::new(4, 64 * 1024, "/bin/sh".to_string()));
        let rooms = Arc::new(Rooms::new());
        (
            TerminalChannel::new(pool.clone(), rooms.clone(), PathBuf::from("/tmp")),
            pool,
            rooms,
        )
    }

    async fn created_session_id(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEnvelope>,
    ) -> Uuid {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if let Ok(env) = rx.try_recv() {
                if env.msg_type == "terminal:created" {
                    let id = env.payload["session"]["session_id"].as_str().unwrap();
                    return Uuid::parse_str(id).unwrap();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("terminal:created never arrived");
    }

    async fn collect_until<F>(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEnvelope>,
        mut done: F,
    ) -> Vec<ServerEnvelope>
    where
        F: FnMut(&[ServerEnvelope]) -> bool,
    {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline && !done(&out) {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(env)) => out.push(env),
                _ => {}
            }
        }
        out
    }

    fn concat_data(envelopes: &[ServerEnvelope]) -> Vec<u8> {
        envelopes
            .iter()
            .filter(|e| e.msg_type == "terminal:data")
            .filter_map(|e| e.payload["data"].as_str().map(|s| base64_decode(s).unwrap()))
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn create_echo_input_delivers_output_to_room() {
        let (channel, pool, _rooms) = setup();
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::json!({"title": "t"}))
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;

        channel
            .subscribe(&conn, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();
        channel
            .message(
                &conn,
                "input",
                &serde_json::json!({"session_id": id.to_string(), "data": "echo sb_echo_probe\n"}),
            )
            .await
            .unwrap();

        let envelopes = collect_until(&mut rx, |collected| {
            String::from_utf8_lossy(&concat_data(collected)).contains("sb_echo_probe")
        })
        .await;
        let all_output = String::from_utf8_lossy(&concat_data(&envelopes)).to_string();
        assert!(all_output.contains("sb_echo_probe"), "got: {all_output}");

        let session = pool.get(&id).await.unwrap();
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn resize_then_second_join_reports_new_size() {
        let (channel, pool, _rooms) = setup();
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;

        channel
            .message(
                &conn,
                "resize",
                &serde_json::json!({"session_id": id.to_string(), "cols": 80, "rows": 24}),
            )
            .await
            .unwrap();

        let (second, mut rx2) = ConnectionHandle::new(ConnectionId::new());
        channel
            .subscribe(&second, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();
        let joined = rx2.recv().await.unwrap();
        assert_eq!(joined.msg_type, "terminal:joined");
        assert_eq!(joined.payload["cols"], 80);
        assert_eq!(joined.payload["rows"], 24);

        let session = pool.get(&id).await.unwrap();
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn join_returns_scrollback_within_cap() {
        let (channel, pool, _rooms) = setup();
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;
        channel
            .subscribe(&conn, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();

        // Generate some output, then join from a fresh connection.
        channel
            .message(
                &conn,
                "inject",
                &serde_json::json!({"session_id": id.to_string(), "command": "echo sb_scrollback_probe"}),
            )
            .await
            .unwrap();
        collect_until(&mut rx, |collected| {
            String::from_utf8_lossy(&concat_data(collected)).contains("sb_scrollback_probe")
        })
        .await;

        let (second, mut rx2) = ConnectionHandle::new(ConnectionId::new());
        channel
            .subscribe(&second, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();
        let joined = rx2.recv().await.unwrap();
        let scrollback = base64_decode(joined.payload["scrollback"].as_str().unwrap()).unwrap();
        assert!(scrollback.len() <= 64 * 1024);
        assert!(String::from_utf8_lossy(&scrollback).contains("sb_scrollback_probe"));

        let session = pool.get(&id).await.unwrap();
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_notifies_room_and_evicts() {
        let (channel, pool, _rooms) = setup();
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;
        channel
            .subscribe(&conn, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();

        channel
            .message(&conn, "terminate", &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();

        assert!(!pool.contains(&id).await);
        let envelopes = collect_until(&mut rx, |collected| {
            collected.iter().any(|e| e.msg_type == "terminal:terminated")
        })
        .await;
        assert!(envelopes.iter().any(|e| e.msg_type == "terminal:terminated"));
    }

    #[tokio::test]
    async fn leave_keeps_the_process_running() {
        let (channel, pool, rooms) = setup();
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;
        let room = channel
            .subscribe(&conn, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();
        assert_eq!(rooms.member_count(&room), 1);

        channel
            .message(&conn, "leave", &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();
        assert_eq!(rooms.member_count(&room), 0);
        assert!(pool.contains(&id).await, "leave must not kill the session");

        let session = pool.get(&id).await.unwrap();
        assert!(!session.is_stopped());
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn idle_sweep_respects_subscribers_and_timeout() {
        let (channel, pool, rooms) = setup();
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;
        let room = channel
            .subscribe(&conn, &serde_json::json!({"session_id": id.to_string()}))
            .await
            .unwrap();

        // Subscribed: even a zero timeout must not reap it.
        let sweep = TerminalChannel::spawn_idle_sweep(
            pool.clone(),
            rooms.clone(),
            Duration::ZERO,
            Duration::from_millis(30),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pool.contains(&id).await, "subscriber presence postpones reaping");

        // Unsubscribed but below the timeout: still not reaped.
        sweep.abort();
        rooms.leave(&room, conn.id);
        let sweep = TerminalChannel::spawn_idle_sweep(
            pool.clone(),
            rooms.clone(),
            Duration::from_secs(3600),
            Duration::from_millis(30),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pool.contains(&id).await, "below-timeout session is never reaped");

        // Unsubscribed and past the timeout: reaped.
        sweep.abort();
        let sweep = TerminalChannel::spawn_idle_sweep(
            pool.clone(),
            rooms.clone(),
            Duration::ZERO,
            Duration::from_millis(30),
        );
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while pool.contains(&id).await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!pool.contains(&id).await, "idle session past timeout is reaped");
        sweep.abort();
    }

    #[tokio::test]
    async fn input_on_unknown_session_is_not_found() {
        let (channel, _pool, _rooms) = setup();
        let (conn, _rx) = ConnectionHandle::new(ConnectionId::new());
        let err = channel
            .message(
                &conn,
                "input",
                &serde_json::json!({"session_id": Uuid::new_v4().to_string(), "data": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn create_above_cap_is_spawn_failure() {
        let pool = Arc::new(TermPool::new(1, 1024, "/bin/sh".to_string()));
        let rooms = Arc::new(Rooms::new());
        let channel = TerminalChannel::new(pool.clone(), rooms, PathBuf::from("/tmp"));
        let (conn, mut rx) = ConnectionHandle::new(ConnectionId::new());

        channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap();
        let id = created_session_id(&mut rx).await;

        let err = channel
            .message(&conn, "create", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SPAWN_FAILURE");

        let session = pool.get(&id).await.unwrap();
        session.kill().await.unwrap();
    }
}
