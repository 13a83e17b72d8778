use axum::extract::State;
use axum::Json;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Instant;

use crate::state::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Record daemon start time; call once at startup.
pub fn init_start_time() {
    let _ = START_TIME.set(Instant::now());
}

fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "uptime_secs": uptime_secs(),
        "channels": state.channels.channel_names(),
        "connections": state.connections.load(Ordering::SeqCst),
    }))
}
