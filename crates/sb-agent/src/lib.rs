pub mod buffer;
pub mod cancel;
pub mod chat;
pub mod claude;
pub mod event;
pub mod pipeline;
pub mod scripted;
pub mod session;
pub mod store;

pub use cancel::CancelToken;
pub use chat::{ChatManager, ChatSettings, ChatUpdate, UpdateSink};
pub use claude::ClaudePipeline;
pub use event::{AgentEvent, EventKind};
pub use pipeline::{AgentPipeline, PipelineError, PipelineRequest};
pub use scripted::ScriptedPipeline;
pub use session::{ChatReplay, ChatState, ChatSummary};
pub use store::SessionStore;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Session not found: {0}")]
    SessionNotFound(uuid::Uuid),
    #[error("Session already running: {0}")]
    AlreadyRunning(uuid::Uuid),
    #[error("Session store error: {0}")]
    Store(String),
}
