use crate::event::AgentEvent;
use crate::session::{ChatState, ChatSummary};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// On-disk record of a chat session: one JSON file per session under the
/// config directory.
///
/// Policy: the record keeps only the most recent `persist_events`
/// (default 100) of the up-to-5000 in-memory events. It is a recovery
/// summary, not a transcript: reconnecting after a daemon restart sees the
/// shorter history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub session_id: Uuid,
    pub title: String,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub state: ChatState,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub events: Vec<AgentEvent>,
}

impl ChatRecord {
    pub fn summary(&self) -> ChatSummary {
        ChatSummary {
            session_id: self.session_id,
            title: self.title.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            events: self.events.len(),
        }
    }
}

/// Directory of per-session JSON records.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> anyhow::Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn save(&self, record: &ChatRecord) -> anyhow::Result<()> {
        let path = self.record_path(&record.session_id);
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&path, json)?;
        tracing::debug!(session_id = %record.session_id, state = ?record.state, "chat record persisted");
        Ok(())
    }

    /// Load one record. A record still marked `running` comes from a process
    /// that died mid-run; it is coerced to `aborted` on the way in.
    pub fn load(&self, id: &Uuid) -> anyhow::Result<Option<ChatRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let mut record: ChatRecord = serde_json::from_str(&content)?;
        if record.state == ChatState::Running {
            record.state = ChatState::Aborted;
        }
        Ok(Some(record))
    }

    pub fn remove(&self, id: &Uuid) {
        let _ = std::fs::remove_file(self.record_path(id));
    }

    /// All persisted records, unreadable files skipped with a warning.
    pub fn list(&self) -> Vec<ChatRecord> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match self.load(&id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(session_id = %id, error = %err, "skipping unreadable chat record");
                }
            }
        }
        records.sort_by_key(|r| r.started_at);
        records
    }
}
