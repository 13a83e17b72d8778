use crate::auth::SharedSecret;
use crate::channels::chat::chat_update_sink;
use crate::channels::{ChatChannel, FilesChannel, TerminalChannel};
use crate::desktop::DesktopSupervisor;
use crate::manager::ChannelManager;
use crate::rooms::Rooms;
use sb_agent::{AgentPipeline, ChatManager, ChatSettings, ClaudePipeline, SessionStore};
use sb_config::DaemonConfig;
use sb_fs::WatchRegistry;
use sb_pty::TermPool;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub config: DaemonConfig,
    pub secret: Arc<SharedSecret>,
    pub rooms: Arc<Rooms>,
    pub channels: Arc<ChannelManager>,
    pub chat: Arc<ChatManager>,
    pub terminals: Arc<TermPool>,
    pub desktop: Arc<DesktopSupervisor>,
    pub connections: Arc<AtomicUsize>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let pipeline: Arc<dyn AgentPipeline> =
            Arc::new(ClaudePipeline::new(config.chat.agent_command.clone()));
        Self::with_pipeline(config, pipeline)
    }

    /// Test seam: the agent pipeline is the only external dependency, so
    /// swapping it for a scripted one makes the whole gateway testable.
    pub fn with_pipeline(
        config: DaemonConfig,
        pipeline: Arc<dyn AgentPipeline>,
    ) -> anyhow::Result<Self> {
        let paths = config.paths()?;
        paths.ensure_config_dir()?;

        let rooms = Arc::new(Rooms::new());
        let secret = Arc::new(SharedSecret::new(config.auth_secret.as_deref()));

        let store = SessionStore::new(paths.chat_sessions_dir())?;
        let chat = Arc::new(ChatManager::new(
            pipeline,
            store,
            ChatSettings {
                buffer_capacity: config.chat.buffer_events,
                persist_limit: config.chat.persist_events,
                evict_delay: Duration::from_secs(config.chat.evict_secs),
            },
        ));
        chat.set_sink(chat_update_sink(rooms.clone()));

        let terminals = Arc::new(TermPool::new(
            config.terminal.max_sessions,
            config.terminal.scrollback_bytes,
            config.terminal.shell.clone(),
        ));
        let registry = Arc::new(WatchRegistry::new());
        let desktop = Arc::new(DesktopSupervisor::new(config.desktop.clone()));

        let default_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        let mut manager = ChannelManager::new(rooms.clone());
        manager.register(Arc::new(ChatChannel::new(
            chat.clone(),
            rooms.clone(),
            default_cwd.clone(),
        )));
        manager.register(Arc::new(TerminalChannel::new(
            terminals.clone(),
            rooms.clone(),
            default_cwd,
        )));
        manager.register(Arc::new(FilesChannel::new(registry, rooms.clone())));

        TerminalChannel::spawn_idle_sweep(
            terminals.clone(),
            rooms.clone(),
            Duration::from_secs(config.terminal.idle_timeout_secs),
            IDLE_SWEEP_PERIOD,
        );

        Ok(Self {
            config,
            secret,
            rooms,
            channels: Arc::new(manager),
            chat,
            terminals,
            desktop,
            connections: Arc::new(AtomicUsize::new(0)),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    /// Graceful teardown: abort running chats (persisting their records),
    /// kill every PTY, stop desktop subprocesses.
    pub async fn shutdown(&self) {
        self.chat.shutdown();
        self.terminals.kill_all().await;
        self.desktop.shutdown().await;
    }
}
