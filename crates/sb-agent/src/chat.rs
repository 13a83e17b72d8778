use crate::event::{AgentEvent, EventKind};
use crate::pipeline::{AgentPipeline, PipelineRequest};
use crate::session::{ChatReplay, ChatSession, ChatState, ChatSummary};
use crate::store::{ChatRecord, SessionStore};
use crate::AgentError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Fan-out callback injected by the gateway: called synchronously, in
/// emission order, under the owning session's lock for per-session updates.
pub type UpdateSink = Arc<dyn Fn(&ChatUpdate) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ChatUpdate {
    Started {
        session_id: Uuid,
        summary: ChatSummary,
    },
    Event {
        session_id: Uuid,
        event: AgentEvent,
    },
    Completed {
        session_id: Uuid,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    Aborted {
        session_id: Uuid,
    },
    Error {
        session_id: Uuid,
        message: String,
    },
    SessionsChanged {
        sessions: Vec<ChatSummary>,
    },
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub buffer_capacity: usize,
    pub persist_limit: usize,
    pub evict_delay: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 5000,
            persist_limit: 100,
            evict_delay: Duration::from_secs(30 * 60),
        }
    }
}

struct ChatShared {
    sessions: std::sync::RwLock<HashMap<Uuid, Arc<std::sync::Mutex<ChatSession>>>>,
    store: SessionStore,
    sink: std::sync::RwLock<Option<UpdateSink>>,
    settings: ChatSettings,
}

/// Registry and lifecycle driver for chat sessions.
///
/// Constructor-injected everywhere (no globals) so tests instantiate
/// isolated registries with a scripted pipeline.
pub struct ChatManager {
    pipeline: Arc<dyn AgentPipeline>,
    shared: Arc<ChatShared>,
}

impl ChatManager {
    pub fn new(
        pipeline: Arc<dyn AgentPipeline>,
        store: SessionStore,
        settings: ChatSettings,
    ) -> Self {
        Self {
            pipeline,
            shared: Arc::new(ChatShared {
                sessions: std::sync::RwLock::new(HashMap::new()),
                store,
                sink: std::sync::RwLock::new(None),
                settings,
            }),
        }
    }

    /// Wire the outbound fan-out. Updates published before this is set are
    /// dropped (nothing is subscribed yet).
    pub fn set_sink(&self, sink: UpdateSink) {
        *self.shared.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Start a new run. `resume_id` continues an existing session (rejected
    /// while it is still running); otherwise a fresh session is allocated.
    pub fn start(
        &self,
        message: String,
        resume_id: Option<Uuid>,
        cwd: PathBuf,
    ) -> Result<Uuid, AgentError> {
        let id = resume_id.unwrap_or_else(Uuid::new_v4);

        // Disk read happens before the map lock; the entry check afterwards
        // makes a concurrent start for the same id lose cleanly.
        let preloaded = if resume_id.is_some() && !self.shared.is_resident(&id) {
            self.shared.store.load(&id).ok().flatten()
        } else {
            None
        };
        if resume_id.is_some() && preloaded.is_none() && !self.shared.is_resident(&id) {
            return Err(AgentError::SessionNotFound(id));
        }

        let capacity = self.shared.settings.buffer_capacity;
        let entry = {
            let mut sessions = self
                .shared
                .sessions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            match sessions.entry(id) {
                std::collections::hash_map::Entry::Occupied(occupied) => {
                    let entry = occupied.get().clone();
                    {
                        let mut session = entry.lock().unwrap_or_else(|e| e.into_inner());
                        if session.state == ChatState::Running {
                            return Err(AgentError::AlreadyRunning(id));
                        }
                        session.begin_run();
                    }
                    entry
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let session = match preloaded {
                        Some(record) => {
                            let mut session = ChatSession::from_record(record, capacity);
                            session.begin_run();
                            session
                        }
                        None => ChatSession::new(id, &message, cwd.clone(), capacity),
                    };
                    vacant
                        .insert(Arc::new(std::sync::Mutex::new(session)))
                        .clone()
                }
            }
        };

        let (cancel, resume_token, record, summary) = {
            let session = entry.lock().unwrap_or_else(|e| e.into_inner());
            (
                session.cancel.clone(),
                session.resume_token.clone(),
                session.to_record(self.shared.settings.persist_limit),
                session.summary(),
            )
        };

        if let Err(err) = self.shared.store.save(&record) {
            tracing::warn!(session_id = %id, error = %err, "failed to persist chat record");
        }
        self.shared.publish(&ChatUpdate::Started {
            session_id: id,
            summary,
        });
        self.shared.publish_sessions_changed();

        tracing::info!(session_id = %id, resumed = resume_token.is_some(), "chat run started");

        let shared = self.shared.clone();
        let pipeline = self.pipeline.clone();
        let request = PipelineRequest {
            message,
            cwd,
            resume_token,
        };
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(64);
            let runner = tokio::spawn({
                let cancel = cancel.clone();
                async move { pipeline.run(request, tx, cancel).await }
            });

            while let Some(event) = rx.recv().await {
                shared.apply_event(id, event);
            }

            let outcome = match runner.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(join_err) => Err(join_err.to_string()),
            };
            if shared.finish_run(id, outcome) {
                schedule_eviction(shared.clone(), id);
            }
        });

        Ok(id)
    }

    /// Trigger cooperative cancellation. Returns `false` (a no-op) when the
    /// session already reached a terminal state.
    pub fn abort(&self, id: Uuid) -> Result<bool, AgentError> {
        let entry = self
            .shared
            .session(&id)
            .ok_or(AgentError::SessionNotFound(id))?;

        let record = {
            let mut session = entry.lock().unwrap_or_else(|e| e.into_inner());
            if session.state != ChatState::Running {
                return Ok(false);
            }
            session.cancel.cancel();
            session.state = ChatState::Aborted;
            session.ended_at = Some(chrono::Utc::now());
            self.shared
                .publish(&ChatUpdate::Aborted { session_id: id });
            session.to_record(self.shared.settings.persist_limit)
        };

        if let Err(err) = self.shared.store.save(&record) {
            tracing::warn!(session_id = %id, error = %err, "failed to persist chat record");
        }
        self.shared.publish_sessions_changed();
        schedule_eviction(self.shared.clone(), id);
        tracing::info!(session_id = %id, "chat run aborted");
        Ok(true)
    }

    /// Replay hook for a (re)joining connection. `deliver` runs under the
    /// session lock, so no event can be published while it executes: join
    /// the room and enqueue the snapshot inside it.
    pub fn subscribe_session<F>(&self, id: Uuid, deliver: F) -> Result<(), AgentError>
    where
        F: FnOnce(&ChatReplay),
    {
        let entry = self
            .shared
            .session(&id)
            .ok_or(AgentError::SessionNotFound(id))?;
        let session = entry.lock().unwrap_or_else(|e| e.into_inner());
        deliver(&session.replay());
        Ok(())
    }

    /// Full conversation payload for a session, preferring live state and
    /// falling back to the on-disk record.
    pub fn load_conversation(&self, id: Uuid) -> Result<ChatRecord, AgentError> {
        if let Some(entry) = self.shared.session(&id) {
            let session = entry.lock().unwrap_or_else(|e| e.into_inner());
            return Ok(session.to_record(usize::MAX));
        }
        match self.shared.store.load(&id) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(AgentError::SessionNotFound(id)),
            Err(err) => Err(AgentError::Store(err.to_string())),
        }
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.shared.summaries()
    }

    pub fn state(&self, id: &Uuid) -> Option<ChatState> {
        let entry = self.shared.session(id)?;
        let session = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(session.state)
    }

    /// Whether the session is currently held in memory (replayable at full
    /// buffer depth).
    pub fn is_resident(&self, id: &Uuid) -> bool {
        self.shared.is_resident(id)
    }

    /// Abort every running session and persist. Called once at daemon
    /// shutdown; sessions that never reached a terminal state are recorded
    /// as `aborted`.
    pub fn shutdown(&self) {
        let entries: Vec<(Uuid, Arc<std::sync::Mutex<ChatSession>>)> = {
            let sessions = self
                .shared
                .sessions
                .read()
                .unwrap_or_else(|e| e.into_inner());
            sessions.iter().map(|(id, e)| (*id, e.clone())).collect()
        };

        let mut records = Vec::new();
        for (id, entry) in entries {
            let mut session = entry.lock().unwrap_or_else(|e| e.into_inner());
            if session.state != ChatState::Running {
                continue;
            }
            session.cancel.cancel();
            session.state = ChatState::Aborted;
            session.ended_at = Some(chrono::Utc::now());
            self.shared
                .publish(&ChatUpdate::Aborted { session_id: id });
            records.push(session.to_record(self.shared.settings.persist_limit));
        }

        for record in records {
            if let Err(err) = self.shared.store.save(&record) {
                tracing::warn!(session_id = %record.session_id, error = %err, "failed to persist chat record");
            }
        }
    }
}

impl ChatShared {
    fn session(&self, id: &Uuid) -> Option<Arc<std::sync::Mutex<ChatSession>>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn is_resident(&self, id: &Uuid) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    fn publish(&self, update: &ChatUpdate) {
        let sink = self.sink.read().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = sink.as_ref() {
            sink(update);
        }
    }

    fn summaries(&self) -> Vec<ChatSummary> {
        let mut summaries: Vec<ChatSummary> = Vec::new();
        let resident: Vec<Uuid> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            for entry in sessions.values() {
                let session = entry.lock().unwrap_or_else(|e| e.into_inner());
                summaries.push(session.summary());
            }
            sessions.keys().copied().collect()
        };

        for record in self.store.list() {
            if !resident.contains(&record.session_id) {
                summaries.push(record.summary());
            }
        }
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    fn publish_sessions_changed(&self) {
        let sessions = self.summaries();
        self.publish(&ChatUpdate::SessionsChanged { sessions });
    }

    /// Append one pipeline event, discarding it when the session already
    /// left `running` (a late event never re-opens a session).
    fn apply_event(&self, id: Uuid, event: AgentEvent) {
        let Some(entry) = self.session(&id) else {
            return;
        };
        let mut session = entry.lock().unwrap_or_else(|e| e.into_inner());
        if session.state != ChatState::Running {
            tracing::debug!(session_id = %id, kind = ?event.kind, "discarding late agent event");
            return;
        }

        if let Some(token) = event.resume_token() {
            session.resume_token = Some(token.to_string());
        }
        if event.kind == EventKind::Result {
            session.cost_usd = event.data.get("cost_usd").and_then(|v| v.as_f64());
            session.duration_ms = event.data.get("duration_ms").and_then(|v| v.as_u64());
        }

        session.buffer.push(event.clone());
        self.publish(&ChatUpdate::Event {
            session_id: id,
            event,
        });
    }

    /// Terminal transition after the pipeline stream ends. Returns whether
    /// a transition happened here (an earlier abort already owns it
    /// otherwise).
    fn finish_run(&self, id: Uuid, outcome: Result<(), String>) -> bool {
        let Some(entry) = self.session(&id) else {
            return false;
        };

        let record = {
            let mut session = entry.lock().unwrap_or_else(|e| e.into_inner());
            if session.state != ChatState::Running {
                return false;
            }

            let update = if session.cancel.is_cancelled() {
                session.state = ChatState::Aborted;
                ChatUpdate::Aborted { session_id: id }
            } else {
                match outcome {
                    Ok(()) => {
                        session.state = ChatState::Completed;
                        ChatUpdate::Completed {
                            session_id: id,
                            cost_usd: session.cost_usd,
                            duration_ms: session.duration_ms,
                        }
                    }
                    Err(message) => {
                        session.state = ChatState::Error;
                        session.last_error = Some(message.clone());
                        ChatUpdate::Error {
                            session_id: id,
                            message,
                        }
                    }
                }
            };
            session.ended_at = Some(chrono::Utc::now());
            self.publish(&update);
            tracing::info!(session_id = %id, state = ?session.state, "chat run finished");
            session.to_record(self.settings.persist_limit)
        };

        if let Err(err) = self.store.save(&record) {
            tracing::warn!(session_id = %id, error = %err, "failed to persist chat record");
        }
        self.publish_sessions_changed();
        true
    }
}

/// Drop a terminal session from memory after the configured delay; the
/// on-disk record remains. A resume in the meantime keeps it resident.
fn schedule_eviction(shared: Arc<ChatShared>, id: Uuid) {
    tokio::spawn(async move {
        tokio::time::sleep(shared.settings.evict_delay).await;
        let mut sessions = shared.sessions.write().unwrap_or_else(|e| e.into_inner());
        let still_terminal = sessions
            .get(&id)
            .map(|entry| {
                let session = entry.lock().unwrap_or_else(|e| e.into_inner());
                session.state.is_terminal()
            })
            .unwrap_or(false);
        if still_terminal {
            sessions.remove(&id);
            tracing::debug!(session_id = %id, "evicted idle terminal chat session");
        }
    });
}
