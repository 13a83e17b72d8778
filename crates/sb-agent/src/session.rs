use crate::buffer::EventBuffer;
use crate::cancel::CancelToken;
use crate::event::AgentEvent;
use crate::store::ChatRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub(crate) const TITLE_MAX_CHARS: usize = 64;

/// Lifecycle of a chat session. The three terminal states are absorbing: a
/// finished session is only continued by a new run against its stored
/// resume token, never re-entered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Running,
    Completed,
    Error,
    Aborted,
}

impl ChatState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChatState::Running)
    }
}

/// One agent conversation: lifecycle state, usage, and the bounded event
/// history that replay serves to reconnecting subscribers.
pub struct ChatSession {
    pub id: Uuid,
    pub title: String,
    pub cwd: PathBuf,
    pub resume_token: Option<String>,
    pub state: ChatState,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub buffer: EventBuffer,
    pub cancel: CancelToken,
}

/// Serializable view for session lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub session_id: Uuid,
    pub title: String,
    pub state: ChatState,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub events: usize,
}

/// Snapshot handed to a (re)joining connection before any live event.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReplay {
    pub summary: ChatSummary,
    pub events: Vec<AgentEvent>,
}

impl ChatSession {
    pub fn new(id: Uuid, first_message: &str, cwd: PathBuf, buffer_capacity: usize) -> Self {
        Self {
            id,
            title: derive_title(first_message),
            cwd,
            resume_token: None,
            state: ChatState::Running,
            started_at: chrono::Utc::now(),
            ended_at: None,
            cost_usd: None,
            duration_ms: None,
            last_error: None,
            buffer: EventBuffer::new(buffer_capacity),
            cancel: CancelToken::new(),
        }
    }

    /// Rebuild an evicted session from its on-disk record so a resume can
    /// continue the conversation with its recent history intact.
    pub fn from_record(record: ChatRecord, buffer_capacity: usize) -> Self {
        let mut buffer = EventBuffer::new(buffer_capacity);
        for event in record.events {
            buffer.push(event);
        }
        Self {
            id: record.session_id,
            title: record.title,
            cwd: record.cwd,
            resume_token: record.resume_token,
            state: record.state,
            started_at: record.started_at,
            ended_at: record.ended_at,
            cost_usd: record.cost_usd,
            duration_ms: record.duration_ms,
            last_error: record.last_error,
            buffer,
            cancel: CancelToken::new(),
        }
    }

    /// Enter a new run: only valid when not `running`.
    pub fn begin_run(&mut self) {
        self.state = ChatState::Running;
        self.ended_at = None;
        self.last_error = None;
        self.cancel = CancelToken::new();
    }

    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            session_id: self.id,
            title: self.title.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            events: self.buffer.len(),
        }
    }

    pub fn replay(&self) -> ChatReplay {
        ChatReplay {
            summary: self.summary(),
            events: self.buffer.snapshot(),
        }
    }

    pub fn to_record(&self, persist_limit: usize) -> ChatRecord {
        ChatRecord {
            session_id: self.id,
            title: self.title.clone(),
            cwd: self.cwd.clone(),
            resume_token: self.resume_token.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            last_error: self.last_error.clone(),
            events: self.buffer.tail(persist_limit),
        }
    }
}

/// Human-readable title from the first message: first line, trimmed,
/// capped at a display-friendly length.
pub(crate) fn derive_title(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Untitled session".to_string();
    }
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_terminality() {
        assert!(!ChatState::Running.is_terminal());
        assert!(ChatState::Completed.is_terminal());
        assert!(ChatState::Error.is_terminal());
        assert!(ChatState::Aborted.is_terminal());
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChatState::Aborted).unwrap(),
            "\"aborted\""
        );
    }

    #[test]
    fn derive_title_takes_first_line() {
        assert_eq!(derive_title("fix the bug\nin detail..."), "fix the bug");
    }

    #[test]
    fn derive_title_trims_and_caps() {
        let long = "x".repeat(200);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn derive_title_empty_message() {
        assert_eq!(derive_title("   \n"), "Untitled session");
    }

    #[test]
    fn new_session_starts_running() {
        let session = ChatSession::new(Uuid::new_v4(), "hello", PathBuf::from("/tmp"), 100);
        assert_eq!(session.state, ChatState::Running);
        assert_eq!(session.title, "hello");
        assert!(session.buffer.is_empty());
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn record_roundtrip_preserves_identity_and_tail() {
        let mut session = ChatSession::new(Uuid::new_v4(), "hello", PathBuf::from("/tmp"), 100);
        session.resume_token = Some("tok-1".to_string());
        for i in 0..20 {
            session.buffer.push(AgentEvent::text(&format!("e{i}")));
        }
        session.state = ChatState::Completed;
        session.ended_at = Some(chrono::Utc::now());
        session.cost_usd = Some(0.5);

        let record = session.to_record(5);
        assert_eq!(record.events.len(), 5);
        assert_eq!(record.events[0].data["text"], "e15");

        let restored = ChatSession::from_record(record, 100);
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.resume_token.as_deref(), Some("tok-1"));
        assert_eq!(restored.state, ChatState::Completed);
        assert_eq!(restored.buffer.len(), 5);
    }

    #[test]
    fn begin_run_resets_terminal_state() {
        let mut session = ChatSession::new(Uuid::new_v4(), "hi", PathBuf::from("/tmp"), 10);
        session.state = ChatState::Aborted;
        session.ended_at = Some(chrono::Utc::now());
        session.cancel.cancel();

        session.begin_run();
        assert_eq!(session.state, ChatState::Running);
        assert!(session.ended_at.is_none());
        assert!(!session.cancel.is_cancelled());
    }

    #[test]
    fn replay_contains_summary_and_all_buffered_events() {
        let mut session = ChatSession::new(Uuid::new_v4(), "hi", PathBuf::from("/tmp"), 10);
        session.buffer.push(AgentEvent::init("t"));
        session.buffer.push(AgentEvent::text("a"));
        let replay = session.replay();
        assert_eq!(replay.events.len(), 2);
        assert_eq!(replay.summary.events, 2);
        assert_eq!(replay.summary.session_id, session.id);
    }
}
