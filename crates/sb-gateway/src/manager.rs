use crate::channels::Channel;
use crate::error::GatewayError;
use crate::rooms::{ConnectionHandle, ConnectionId, Rooms};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The pub/sub router: channel names → channel instances, plus the record
/// of which rooms each connection subscribed through which channel.
///
/// Disconnect replays that record through each channel's unsubscribe hook.
/// That is the only cleanup path, so hooks stay idempotent.
pub struct ChannelManager {
    channels: HashMap<&'static str, Arc<dyn Channel>>,
    rooms: Arc<Rooms>,
    subscriptions: std::sync::Mutex<HashMap<ConnectionId, HashSet<(String, String)>>>,
}

impl ChannelManager {
    pub fn new(rooms: Arc<Rooms>) -> Self {
        Self {
            channels: HashMap::new(),
            rooms,
            subscriptions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name(), channel);
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.channels.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn channel(&self, name: &str) -> Result<&Arc<dyn Channel>, GatewayError> {
        self.channels
            .get(name)
            .ok_or_else(|| GatewayError::UnknownChannel(name.to_string()))
    }

    pub async fn subscribe(
        &self,
        conn: &ConnectionHandle,
        channel_name: &str,
        params: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let channel = self.channel(channel_name)?;
        let room = channel.subscribe(conn, params).await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conn.id)
            .or_default()
            .insert((channel_name.to_string(), room));
        Ok(())
    }

    /// Leave every room of `channel_name` this connection subscribed to.
    pub async fn unsubscribe(
        &self,
        conn: &ConnectionHandle,
        channel_name: &str,
    ) -> Result<(), GatewayError> {
        let channel = self.channel(channel_name)?;
        let rooms: Vec<String> = {
            let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            match subs.get_mut(&conn.id) {
                Some(recorded) => {
                    let matching: Vec<String> = recorded
                        .iter()
                        .filter(|(name, _)| name == channel_name)
                        .map(|(_, room)| room.clone())
                        .collect();
                    recorded.retain(|(name, _)| name != channel_name);
                    matching
                }
                None => Vec::new(),
            }
        };
        for room in rooms {
            channel.unsubscribe(conn, &room).await;
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        conn: &ConnectionHandle,
        channel_name: &str,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let channel = self.channel(channel_name)?;
        channel.message(conn, action, payload).await
    }

    /// Transport closed: replay recorded subscriptions through each
    /// channel's unsubscribe hook, then drop any stray room membership.
    pub async fn disconnect(&self, conn: &ConnectionHandle) {
        let recorded: Vec<(String, String)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn.id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for (channel_name, room) in recorded {
            if let Ok(channel) = self.channel(&channel_name) {
                channel.unsubscribe(conn, &room).await;
            }
        }
        self.rooms.leave_all(conn.id);
    }
}
