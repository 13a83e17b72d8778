use crate::cancel::CancelToken;
use crate::event::{AgentEvent, EventKind};
use crate::pipeline::{AgentPipeline, PipelineError, PipelineRequest};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Drives the `claude` CLI in non-interactive streaming mode.
///
/// One invocation per run: `claude -p <message> --output-format stream-json
/// --verbose`, plus `--resume <token>` when continuing a conversation. Each
/// stdout line is one JSON object mapped to zero or more typed events.
pub struct ClaudePipeline {
    command: String,
}

impl ClaudePipeline {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentPipeline for ClaudePipeline {
    async fn run(
        &self,
        request: PipelineRequest,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancelToken,
    ) -> Result<(), PipelineError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg(&request.message)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &request.resume_token {
            cmd.arg("--resume").arg(token);
        }

        let mut child = cmd.spawn().map_err(|e| PipelineError::Spawn(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Spawn("agent process has no stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[agent stderr] {}", line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("agent run cancelled, killing process");
                    let _ = child.kill().await;
                    return Ok(());
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        for event in map_stream_line(&line) {
                            if events.send(event).await.is_err() {
                                let _ = child.kill().await;
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = child.kill().await;
                        return Err(err.into());
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(PipelineError::Failed(format!(
                "agent process exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Maps one stream-json stdout line to typed events. Unknown or malformed
/// lines map to nothing.
fn map_stream_line(line: &str) -> Vec<AgentEvent> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        tracing::trace!(line, "skipping non-JSON agent output");
        return Vec::new();
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("system") if value.get("subtype").and_then(|s| s.as_str()) == Some("init") => {
            vec![AgentEvent::new(EventKind::Init, value)]
        }
        Some("assistant") => map_content_blocks(&value),
        Some("user") => map_tool_results(&value),
        Some("stream_event") => map_stream_event(&value),
        Some("status") => vec![AgentEvent::new(EventKind::Status, value)],
        Some("tool_progress") => vec![AgentEvent::new(EventKind::ToolProgress, value)],
        Some("result") => {
            let cost_usd = value
                .get("total_cost_usd")
                .or_else(|| value.get("cost_usd"))
                .and_then(|v| v.as_f64());
            let duration_ms = value.get("duration_ms").and_then(|v| v.as_u64());
            let is_error = value
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            vec![AgentEvent::new(
                EventKind::Result,
                serde_json::json!({
                    "cost_usd": cost_usd,
                    "duration_ms": duration_ms,
                    "is_error": is_error,
                    "result": value.get("result").cloned().unwrap_or(serde_json::Value::Null),
                }),
            )]
        }
        _ => {
            tracing::trace!(line, "unmapped agent output line");
            Vec::new()
        }
    }
}

fn map_content_blocks(value: &serde_json::Value) -> Vec<AgentEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => events.push(AgentEvent::new(
                EventKind::Text,
                serde_json::json!({ "text": block.get("text").cloned() }),
            )),
            Some("thinking") => events.push(AgentEvent::new(
                EventKind::Thinking,
                serde_json::json!({ "thinking": block.get("thinking").cloned() }),
            )),
            Some("tool_use") => {
                events.push(AgentEvent::new(
                    EventKind::ToolStart,
                    serde_json::json!({
                        "id": block.get("id").cloned(),
                        "name": block.get("name").cloned(),
                    }),
                ));
                events.push(AgentEvent::new(
                    EventKind::ToolInput,
                    serde_json::json!({
                        "id": block.get("id").cloned(),
                        "input": block.get("input").cloned(),
                    }),
                ));
            }
            _ => {}
        }
    }
    events
}

fn map_tool_results(value: &serde_json::Value) -> Vec<AgentEvent> {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };

    blocks
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .map(|block| {
            AgentEvent::new(
                EventKind::ToolResult,
                serde_json::json!({
                    "tool_use_id": block.get("tool_use_id").cloned(),
                    "content": block.get("content").cloned(),
                    "is_error": block.get("is_error").cloned(),
                }),
            )
        })
        .collect()
}

fn map_stream_event(value: &serde_json::Value) -> Vec<AgentEvent> {
    let kind = match value.pointer("/event/type").and_then(|t| t.as_str()) {
        Some("message_start") => EventKind::MessageStart,
        Some("message_stop") => EventKind::MessageStop,
        Some("content_block_stop") => EventKind::BlockStop,
        Some("content_block_start") => {
            if value.pointer("/event/content_block/type").and_then(|t| t.as_str())
                == Some("thinking")
            {
                EventKind::ThinkingStart
            } else {
                return Vec::new();
            }
        }
        _ => return Vec::new(),
    };
    vec![AgentEvent::new(
        kind,
        value.get("event").cloned().unwrap_or(serde_json::Value::Null),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_line_maps_to_init_with_resume_token() {
        let line = r#"{"type":"system","subtype":"init","session_id":"conv-9","model":"m"}"#;
        let events = map_stream_line(line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Init);
        assert_eq!(events[0].resume_token(), Some("conv-9"));
    }

    #[test]
    fn assistant_text_maps_to_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let events = map_stream_line(line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Text);
        assert_eq!(events[0].data["text"], "hi");
    }

    #[test]
    fn assistant_tool_use_maps_to_start_and_input() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let events = map_stream_line(line);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::ToolStart);
        assert_eq!(events[0].data["name"], "Bash");
        assert_eq!(events[1].kind, EventKind::ToolInput);
        assert_eq!(events[1].data["input"]["command"], "ls");
    }

    #[test]
    fn assistant_thinking_maps_to_thinking() {
        let line =
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#;
        let events = map_stream_line(line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Thinking);
    }

    #[test]
    fn user_tool_result_maps_to_tool_result() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}}"#;
        let events = map_stream_line(line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ToolResult);
        assert_eq!(events[0].data["tool_use_id"], "t1");
    }

    #[test]
    fn result_line_normalizes_usage() {
        let line = r#"{"type":"result","total_cost_usd":0.31,"duration_ms":4200,"is_error":false,"result":"done"}"#;
        let events = map_stream_line(line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Result);
        assert_eq!(events[0].data["cost_usd"], 0.31);
        assert_eq!(events[0].data["duration_ms"], 4200);
        assert_eq!(events[0].data["result"], "done");
    }

    #[test]
    fn stream_events_map_to_boundary_markers() {
        assert_eq!(
            map_stream_line(r#"{"type":"stream_event","event":{"type":"message_start"}}"#)[0].kind,
            EventKind::MessageStart
        );
        assert_eq!(
            map_stream_line(r#"{"type":"stream_event","event":{"type":"message_stop"}}"#)[0].kind,
            EventKind::MessageStop
        );
        assert_eq!(
            map_stream_line(r#"{"type":"stream_event","event":{"type":"content_block_stop"}}"#)[0]
                .kind,
            EventKind::BlockStop
        );
        assert_eq!(
            map_stream_line(
                r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"thinking"}}}"#
            )[0]
            .kind,
            EventKind::ThinkingStart
        );
    }

    #[test]
    fn text_content_block_start_is_skipped() {
        let events = map_stream_line(
            r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"text"}}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn garbage_lines_map_to_nothing() {
        assert!(map_stream_line("not json at all").is_empty());
        assert!(map_stream_line(r#"{"type":"unknown_kind"}"#).is_empty());
        assert!(map_stream_line("{}").is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let pipeline = ClaudePipeline::new("definitely-not-a-real-agent-binary");
        let (tx, _rx) = mpsc::channel(4);
        let err = pipeline
            .run(
                PipelineRequest {
                    message: "hi".to_string(),
                    cwd: std::env::temp_dir(),
                    resume_token: None,
                },
                tx,
                CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Spawn(_)));
    }
}
