use crate::cancel::CancelToken;
use crate::event::AgentEvent;
use crate::pipeline::{AgentPipeline, PipelineError, PipelineRequest};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pipeline double that plays a fixed event sequence.
///
/// Injected wherever a real agent would be too slow or nondeterministic:
/// channel tests, FSM tests, and local development without the agent CLI
/// installed.
pub struct ScriptedPipeline {
    events: Vec<AgentEvent>,
    delay: Duration,
    failure: Option<String>,
}

impl ScriptedPipeline {
    pub fn new(events: Vec<AgentEvent>) -> Self {
        Self {
            events,
            delay: Duration::ZERO,
            failure: None,
        }
    }

    /// Sleep between events, giving tests a window to abort mid-stream.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail with `message` after the scripted events have been emitted.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }
}

#[async_trait]
impl AgentPipeline for ScriptedPipeline {
    async fn run(
        &self,
        _request: PipelineRequest,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancelToken,
    ) -> Result<(), PipelineError> {
        for event in self.events.iter().cloned() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        match &self.failure {
            Some(message) => Err(PipelineError::Failed(message.clone())),
            None => Ok(()),
        }
    }
}
