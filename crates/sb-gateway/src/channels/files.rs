use crate::channels::Channel;
use crate::error::GatewayError;
use crate::rooms::{ConnectionHandle, Rooms};
use crate::ws::messages::ServerEnvelope;
use async_trait::async_trait;
use sb_fs::WatchRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const FILES_CHANNEL: &str = "files";

fn root_room(root: &Path) -> String {
    format!("files:{}", root.display())
}

fn room_root(room: &str) -> Option<PathBuf> {
    room.strip_prefix("files:").map(PathBuf::from)
}

/// Pure present-tense notification: no buffering, no replay, no
/// persistence. One watcher per root shared by refcount.
pub struct FilesChannel {
    registry: Arc<WatchRegistry>,
    rooms: Arc<Rooms>,
}

impl FilesChannel {
    pub fn new(registry: Arc<WatchRegistry>, rooms: Arc<Rooms>) -> Self {
        Self { registry, rooms }
    }
}

#[async_trait]
impl Channel for FilesChannel {
    fn name(&self) -> &'static str {
        FILES_CHANNEL
    }

    async fn subscribe(
        &self,
        conn: &ConnectionHandle,
        params: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidPayload("missing path".to_string()))?;

        // A repeated subscribe from the same connection must not bump the
        // refcount: membership is the source of truth.
        if let Ok(canonical) = Path::new(path).canonicalize() {
            let room = root_room(&canonical);
            if self.rooms.contains(&room, conn.id) {
                return Ok(room);
            }
        }

        let (root, mut rx, created) = self
            .registry
            .watch(Path::new(path))
            .await
            .map_err(|err| GatewayError::WatchFailed(err.to_string()))?;
        let room = root_room(&root);
        self.rooms.join(&room, conn);

        if created {
            // One forwarder per watcher; it ends when the watcher closes
            // and its broadcast sender drops.
            let rooms = self.rooms.clone();
            let forward_room = room.clone();
            let root_display = root.display().to_string();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            rooms.broadcast(
                                &forward_room,
                                &ServerEnvelope::files_change(&root_display, &event),
                            );
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(room = %forward_room, lagged = n, "file events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        Ok(room)
    }

    async fn unsubscribe(&self, conn: &ConnectionHandle, room: &str) {
        // Only decrement for connections that were actually members, so the
        // disconnect path stays idempotent.
        if !self.rooms.contains(room, conn.id) {
            return;
        }
        self.rooms.leave(room, conn.id);
        if let Some(root) = room_root(room) {
            self.registry.unwatch(&root).await;
        }
    }

    async fn message(
        &self,
        _conn: &ConnectionHandle,
        action: &str,
        _payload: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::UnsupportedMessage {
            channel: FILES_CHANNEL.to_string(),
            action: action.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::ConnectionId;
    use std::time::Duration;

    fn setup() -> (FilesChannel, Arc<WatchRegistry>, Arc<Rooms>) {
        let registry = Arc::new(WatchRegistry::with_window(Duration::from_millis(20)));
        let rooms = Arc::new(Rooms::new());
        (
            FilesChannel::new(registry.clone(), rooms.clone()),
            registry,
            rooms,
        )
    }

    #[tokio::test]
    async fn two_connections_share_one_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, registry, _rooms) = setup();
        let (a, _rx_a) = ConnectionHandle::new(ConnectionId::new());
        let (b, _rx_b) = ConnectionHandle::new(ConnectionId::new());
        let params = serde_json::json!({"path": dir.path().to_str().unwrap()});

        let room = channel.subscribe(&a, &params).await.unwrap();
        channel.subscribe(&b, &params).await.unwrap();

        let root = room_root(&room).unwrap();
        assert_eq!(registry.refcount(&root).await, 2);

        channel.unsubscribe(&a, &room).await;
        assert_eq!(registry.refcount(&root).await, 1, "one subscriber left");

        channel.unsubscribe(&b, &room).await;
        assert_eq!(registry.refcount(&root).await, 0, "watcher closed at zero");
    }

    #[tokio::test]
    async fn duplicate_subscribe_does_not_leak_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, registry, _rooms) = setup();
        let (a, _rx) = ConnectionHandle::new(ConnectionId::new());
        let params = serde_json::json!({"path": dir.path().to_str().unwrap()});

        let room = channel.subscribe(&a, &params).await.unwrap();
        channel.subscribe(&a, &params).await.unwrap();

        let root = room_root(&room).unwrap();
        assert_eq!(registry.refcount(&root).await, 1);

        channel.unsubscribe(&a, &room).await;
        assert_eq!(registry.refcount(&root).await, 0);
        // Idempotent: a second unsubscribe is a no-op.
        channel.unsubscribe(&a, &room).await;
        assert_eq!(registry.refcount(&root).await, 0);
    }

    #[tokio::test]
    async fn change_events_reach_the_room() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _registry, _rooms) = setup();
        let (a, mut rx) = ConnectionHandle::new(ConnectionId::new());
        let params = serde_json::json!({"path": dir.path().to_str().unwrap()});
        channel.subscribe(&a, &params).await.unwrap();

        std::fs::write(dir.path().join("changed.txt"), "content").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut saw_change = false;
        while tokio::time::Instant::now() < deadline && !saw_change {
            if let Ok(Some(env)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
            {
                if env.msg_type == "files:change"
                    && env.payload["path"].as_str().unwrap_or("").contains("changed.txt")
                {
                    saw_change = true;
                }
            }
        }
        assert!(saw_change, "expected a files:change for changed.txt");
    }

    #[tokio::test]
    async fn missing_path_is_invalid_payload() {
        let (channel, _registry, _rooms) = setup();
        let (a, _rx) = ConnectionHandle::new(ConnectionId::new());
        let err = channel
            .subscribe(&a, &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn unwatchable_path_is_watch_failed() {
        let (channel, _registry, _rooms) = setup();
        let (a, _rx) = ConnectionHandle::new(ConnectionId::new());
        let err = channel
            .subscribe(&a, &serde_json::json!({"path": "/definitely/not/real"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WATCH_FAILED");
    }

    #[tokio::test]
    async fn rpc_is_unsupported() {
        let (channel, _registry, _rooms) = setup();
        let (a, _rx) = ConnectionHandle::new(ConnectionId::new());
        let err = channel
            .message(&a, "anything", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_MESSAGE");
    }
}
