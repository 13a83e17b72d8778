use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::Ordering;

use crate::rooms::{ConnectionHandle, ConnectionId};
use crate::state::AppState;
use crate::ws::messages::{ClientMessage, ServerEnvelope};
use crate::GatewayError;

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    if !state
        .secret
        .authorize_upgrade(&headers, query.token.as_deref())
    {
        tracing::warn!("WebSocket upgrade rejected: authentication failed");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = ConnectionId::new();
    let (handle, mut outbound) = ConnectionHandle::new(id);
    state.connections.fetch_add(1, Ordering::SeqCst);
    tracing::info!(connection = %id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();

    // Writer task: drains the connection's outbound queue. Broadcast is an
    // enqueue here, so channel code never blocks on a slow socket.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let message: ClientMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        handle.send(ServerEnvelope::error(
                            None,
                            "INVALID_MESSAGE",
                            &err.to_string(),
                        ));
                        continue;
                    }
                };
                handle_client_message(&state, &handle, message).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    tracing::info!(connection = %id, "WebSocket connection closed");
    state.channels.disconnect(&handle).await;
    state.connections.fetch_sub(1, Ordering::SeqCst);
    writer.abort();
}

/// Every per-operation failure becomes a scoped error envelope; nothing
/// here tears down the connection.
async fn handle_client_message(state: &AppState, handle: &ConnectionHandle, msg: ClientMessage) {
    let request_id = msg.request_id.clone();

    let result = match msg.msg_type.as_str() {
        "subscribe" => match &msg.channel {
            Some(channel) => state.channels.subscribe(handle, channel, &msg.params).await,
            None => Err(GatewayError::InvalidPayload("missing channel".to_string())),
        },
        "unsubscribe" => match &msg.channel {
            Some(channel) => state.channels.unsubscribe(handle, channel).await,
            None => Err(GatewayError::InvalidPayload("missing channel".to_string())),
        },
        "message" => match (&msg.channel, &msg.action) {
            (Some(channel), Some(action)) => {
                state
                    .channels
                    .dispatch(handle, channel, action, &msg.payload)
                    .await
            }
            _ => Err(GatewayError::InvalidPayload(
                "message requires channel and action".to_string(),
            )),
        },
        other => Err(GatewayError::InvalidPayload(format!(
            "unknown message type: {other}"
        ))),
    };

    if let Err(err) = result {
        tracing::debug!(connection = %handle.id, error = %err, "request failed");
        handle.send(ServerEnvelope::error(request_id, err.code(), &err.to_string()));
    }
}
