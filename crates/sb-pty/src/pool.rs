use crate::session::TermSession;
use crate::PtyError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Serializable view of a session for list refreshes.
#[derive(Debug, Clone, Serialize)]
pub struct TermSummary {
    pub session_id: Uuid,
    pub title: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Registry of live terminal sessions, capped at `max_sessions`.
pub struct TermPool {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<TermSession>>>>,
    max_sessions: usize,
    scrollback_bytes: usize,
    shell: String,
}

impl TermPool {
    pub fn new(max_sessions: usize, scrollback_bytes: usize, shell: String) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            scrollback_bytes,
            shell,
        }
    }

    pub async fn create(
        &self,
        title: String,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TermSession>, PtyError> {
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.max_sessions {
                return Err(PtyError::SessionLimit(self.max_sessions));
            }
        }

        let session = TermSession::spawn(
            Uuid::new_v4(),
            &self.shell,
            working_dir,
            title,
            cols,
            rows,
            self.scrollback_bytes,
        )?;
        let id = session.id;
        let session = Arc::new(session);
        self.sessions.write().await.insert(id, session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &Uuid) -> Result<Arc<TermSession>, PtyError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(PtyError::SessionNotFound(*id))
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<TermSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<Arc<TermSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn summaries(&self) -> Vec<TermSummary> {
        let mut out: Vec<TermSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| {
                let (cols, rows) = s.size();
                TermSummary {
                    session_id: s.id,
                    title: s.title(),
                    cwd: s.cwd.display().to_string(),
                    cols,
                    rows,
                    created_at: s.created_at,
                }
            })
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn kill_all(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = session.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(max: usize) -> TermPool {
        TermPool::new(max, 64 * 1024, "/bin/sh".to_string())
    }

    #[tokio::test]
    async fn create_and_get() {
        let pool = test_pool(4);
        let session = pool
            .create("one".to_string(), Path::new("/tmp"), 80, 24)
            .await
            .unwrap();
        let fetched = pool.get(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
        pool.kill_all().await;
    }

    #[tokio::test]
    async fn get_unknown_is_session_not_found() {
        let pool = test_pool(4);
        let err = pool.get(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PtyError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn create_above_cap_is_rejected() {
        let pool = test_pool(2);
        let a = pool
            .create("a".to_string(), Path::new("/tmp"), 80, 24)
            .await
            .unwrap();
        let b = pool
            .create("b".to_string(), Path::new("/tmp"), 80, 24)
            .await
            .unwrap();
        let err = pool
            .create("c".to_string(), Path::new("/tmp"), 80, 24)
            .await
            .unwrap_err();
        assert!(matches!(err, PtyError::SessionLimit(2)));
        let _ = (a.kill().await, b.kill().await);
    }

    #[tokio::test]
    async fn remove_frees_a_slot() {
        let pool = test_pool(1);
        let session = pool
            .create("a".to_string(), Path::new("/tmp"), 80, 24)
            .await
            .unwrap();
        session.kill().await.unwrap();
        pool.remove(&session.id).await;
        assert_eq!(pool.count().await, 0);
        let replacement = pool
            .create("b".to_string(), Path::new("/tmp"), 80, 24)
            .await
            .unwrap();
        replacement.kill().await.unwrap();
    }

    #[tokio::test]
    async fn summaries_reflect_title_and_size() {
        let pool = test_pool(4);
        let session = pool
            .create("shell".to_string(), Path::new("/tmp"), 100, 30)
            .await
            .unwrap();
        let summaries = pool.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].session_id, session.id);
        assert_eq!(summaries[0].title, "shell");
        assert_eq!((summaries[0].cols, summaries[0].rows), (100, 30));
        session.kill().await.unwrap();
    }
}
