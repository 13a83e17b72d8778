pub mod auth;
pub mod channels;
pub mod desktop;
pub mod error;
pub mod manager;
pub mod rest;
pub mod rooms;
pub mod router;
pub mod state;
pub mod tunnel;
pub mod ws;

pub use error::GatewayError;
pub use manager::ChannelManager;
pub use rooms::{ConnectionHandle, ConnectionId, Rooms};
pub use router::build_router;
pub use state::AppState;
