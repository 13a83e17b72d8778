use crate::cancel::CancelToken;
use crate::event::AgentEvent;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Input for one run of the external reasoning pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub message: String,
    pub cwd: PathBuf,
    /// Opaque token from a previous run's `init` event; continues the same
    /// underlying conversation.
    pub resume_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),
    #[error("Agent pipeline failed: {0}")]
    Failed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Narrow interface to the external agent pipeline.
///
/// Implementations emit typed events onto `events` in order, observe
/// `cancel` between units of work, and return once the stream ends. A closed
/// `events` receiver or a triggered `cancel` are both normal exits, not
/// errors.
#[async_trait]
pub trait AgentPipeline: Send + Sync {
    async fn run(
        &self,
        request: PipelineRequest,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancelToken,
    ) -> Result<(), PipelineError>;
}
