use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Directories that are never worth notifying about.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "vendor",
    "__pycache__",
];

#[derive(Debug, Clone, Serialize)]
pub struct FsEvent {
    #[serde(rename = "type")]
    pub kind: FsEventKind,
    /// Path relative to the watched root.
    pub path: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Create,
    Modify,
    Delete,
}

struct WatchEntry {
    _watcher: RecommendedWatcher,
    tx: broadcast::Sender<FsEvent>,
    refcount: usize,
}

/// One underlying watcher per distinct root path, shared by refcount.
///
/// Raw notify events are filtered through ignore rules and debounced per
/// `(kind, relative path)` key before being broadcast.
pub struct WatchRegistry {
    watches: Arc<RwLock<HashMap<PathBuf, WatchEntry>>>,
    window: Duration,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::with_window(DEBOUNCE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            watches: Arc::new(RwLock::new(HashMap::new())),
            window,
        }
    }

    /// Start (or share) a watcher for `root`. Returns the canonical root
    /// (the registry key to pass back to `unwatch`), a receiver of debounced
    /// events, and whether this call created the underlying watcher.
    pub async fn watch(
        &self,
        root: &Path,
    ) -> anyhow::Result<(PathBuf, broadcast::Receiver<FsEvent>, bool)> {
        let canonical = root.canonicalize()?;

        let mut watches = self.watches.write().await;
        if let Some(entry) = watches.get_mut(&canonical) {
            entry.refcount += 1;
            tracing::debug!(root = %canonical.display(), refcount = entry.refcount, "sharing watcher");
            return Ok((canonical, entry.tx.subscribe(), false));
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let callback_root = canonical.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let kind = match event.kind {
                        EventKind::Create(_) => FsEventKind::Create,
                        EventKind::Modify(_) => FsEventKind::Modify,
                        EventKind::Remove(_) => FsEventKind::Delete,
                        _ => return,
                    };
                    for path in &event.paths {
                        let relative = path.strip_prefix(&callback_root).unwrap_or(path);
                        if is_ignored(relative) {
                            continue;
                        }
                        let _ = raw_tx.send((kind, relative.to_string_lossy().to_string()));
                    }
                }
            },
            Config::default(),
        )?;

        watcher.watch(&canonical, RecursiveMode::Recursive)?;

        let (tx, rx) = broadcast::channel(256);
        tokio::spawn(run_debounce(raw_rx, tx.clone(), self.window));

        tracing::info!(root = %canonical.display(), "filesystem watcher started");
        watches.insert(
            canonical.clone(),
            WatchEntry {
                _watcher: watcher,
                tx,
                refcount: 1,
            },
        );

        Ok((canonical, rx, true))
    }

    /// Drop one reference to the watcher for `root` (the canonical key
    /// returned by `watch`). The watcher closes when the count reaches zero.
    pub async fn unwatch(&self, root: &Path) {
        let mut watches = self.watches.write().await;
        if let Some(entry) = watches.get_mut(root) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                watches.remove(root);
                tracing::info!(root = %root.display(), "filesystem watcher closed");
            }
        }
    }

    pub async fn refcount(&self, root: &Path) -> usize {
        self.watches
            .read()
            .await
            .get(root)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Coalesces raw events per `(kind, path)` key: each arrival resets the
/// key's deadline, and a key is broadcast once its window elapses quietly.
/// Ends when the watcher (and with it the raw sender) is dropped.
async fn run_debounce(
    mut raw_rx: mpsc::UnboundedReceiver<(FsEventKind, String)>,
    tx: broadcast::Sender<FsEvent>,
    window: Duration,
) {
    let mut pending: HashMap<(FsEventKind, String), Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().min().copied();
        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some((kind, path)) => {
                    pending.insert((kind, path), Instant::now() + window);
                }
                None => break,
            },
            _ = sleep_until_or_forever(next_deadline) => {
                let now = Instant::now();
                let due: Vec<(FsEventKind, String)> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for (kind, path) in due {
                    pending.remove(&(kind, path.clone()));
                    let _ = tx.send(FsEvent {
                        kind,
                        path,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_ignored(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
        }
        _ => false,
    })
}
