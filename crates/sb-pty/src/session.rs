use crate::reader::{spawn_reader_thread, PtyOutput, ReaderContext};
use crate::scrollback::Scrollback;
use portable_pty::{native_pty_system, Child, MasterPty, PtySize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// One pseudo-terminal process and its bounded output history.
///
/// Output flows through a single ordered queue (`take_output`) drained by
/// exactly one consumer; the scrollback buffer is shared so a joining
/// connection can snapshot history while the consumer keeps appending.
pub struct TermSession {
    pub id: Uuid,
    pub cwd: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub child_pid: Option<u32>,
    title: std::sync::Mutex<String>,
    size: std::sync::Mutex<(u16, u16)>,
    last_activity: std::sync::Mutex<Instant>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,
    output_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PtyOutput>>>,
    scrollback: Arc<std::sync::Mutex<Scrollback>>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl std::fmt::Debug for TermSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermSession")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("created_at", &self.created_at)
            .field("child_pid", &self.child_pid)
            .finish_non_exhaustive()
    }
}

impl TermSession {
    pub fn spawn(
        session_id: Uuid,
        shell: &str,
        working_dir: &Path,
        title: String,
        cols: u16,
        rows: u16,
        scrollback_bytes: usize,
    ) -> Result<Self, crate::PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| crate::PtyError::Pty(e.to_string()))?;

        let mut cmd = portable_pty::CommandBuilder::new(shell);
        cmd.cwd(working_dir);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| crate::PtyError::Pty(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| crate::PtyError::Pty(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| crate::PtyError::Pty(e.to_string()))?;

        let child_pid = child.process_id();
        let child = Arc::new(std::sync::Mutex::new(child));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        spawn_reader_thread(ReaderContext {
            reader,
            output_tx,
            stopped: stopped.clone(),
            child: Some(child.clone()),
            session_id,
        });

        tracing::info!(session_id = %session_id, shell, cols, rows, "terminal session spawned");

        Ok(Self {
            id: session_id,
            cwd: working_dir.to_path_buf(),
            created_at: chrono::Utc::now(),
            child_pid,
            title: std::sync::Mutex::new(title),
            size: std::sync::Mutex::new((cols, rows)),
            last_activity: std::sync::Mutex::new(Instant::now()),
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child,
            output_rx: std::sync::Mutex::new(Some(output_rx)),
            scrollback: Arc::new(std::sync::Mutex::new(Scrollback::new(scrollback_bytes))),
            stopped,
        })
    }

    /// Hands the session's output queue to its single consumer.
    /// Returns `None` if it has already been taken.
    pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<PtyOutput>> {
        self.output_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Shared scrollback handle; the pump appends under this mutex and a
    /// joining connection snapshots under the same mutex.
    pub fn scrollback(&self) -> Arc<std::sync::Mutex<Scrollback>> {
        self.scrollback.clone()
    }

    pub fn scrollback_snapshot(&self) -> Vec<u8> {
        match self.scrollback.lock() {
            Ok(sb) => sb.snapshot(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), crate::PtyError> {
        tracing::trace!(session_id = %self.id, len = data.len(), "writing to PTY");
        let mut writer = self.writer.lock().await;
        writer.write_all(data)?;
        self.touch();
        Ok(())
    }

    /// Writes `command` followed by a newline, for programmatic execution.
    pub async fn inject(&self, command: &str) -> Result<(), crate::PtyError> {
        let mut line = command.as_bytes().to_vec();
        line.push(b'\n');
        self.write(&line).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), crate::PtyError> {
        tracing::debug!(session_id = %self.id, cols, rows, "resizing PTY");
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| crate::PtyError::Pty(e.to_string()))?;
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = (cols, rows);
        Ok(())
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn title(&self) -> String {
        self.title.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_title(&self, title: String) {
        *self.title.lock().unwrap_or_else(|e| e.into_inner()) = title;
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub async fn kill(&self) -> Result<(), crate::PtyError> {
        if self.is_stopped() {
            return Ok(());
        }

        tracing::info!(session_id = %self.id, "killing terminal session");

        {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            child
                .kill()
                .map_err(|e| crate::PtyError::Pty(e.to_string()))?;
        }

        self.stopped
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh() -> TermSession {
        TermSession::spawn(
            Uuid::new_v4(),
            "/bin/sh",
            Path::new("/tmp"),
            "test".to_string(),
            80,
            24,
            64 * 1024,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn echo_output_arrives_on_queue() {
        let session = spawn_sh();
        let mut rx = session.take_output().unwrap();
        session.inject("echo sb_marker").await.unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(PtyOutput::Data(data))) => {
                    collected.extend_from_slice(&data);
                    if String::from_utf8_lossy(&collected).contains("sb_marker") {
                        break;
                    }
                }
                Ok(Some(PtyOutput::Exit(_))) | Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("sb_marker"));
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn take_output_is_single_consumer() {
        let session = spawn_sh();
        assert!(session.take_output().is_some());
        assert!(session.take_output().is_none());
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn resize_records_size() {
        let session = spawn_sh();
        session.resize(120, 40).await.unwrap();
        assert_eq!(session.size(), (120, 40));
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let session = spawn_sh();
        session.kill().await.unwrap();
        assert!(session.is_stopped());
        session.kill().await.unwrap();
    }

    #[tokio::test]
    async fn rename_changes_title() {
        let session = spawn_sh();
        assert_eq!(session.title(), "test");
        session.set_title("renamed".to_string());
        assert_eq!(session.title(), "renamed");
        session.kill().await.unwrap();
    }
}
