use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::paths::ConfigPaths;

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    7870
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

fn default_max_sessions() -> usize {
    10
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

fn default_scrollback_bytes() -> usize {
    100 * 1024
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

fn default_buffer_events() -> usize {
    5000
}

fn default_persist_events() -> usize {
    100
}

fn default_evict_secs() -> u64 {
    30 * 60
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_display() -> String {
    ":99".to_string()
}

fn default_vnc_port() -> u16 {
    5901
}

fn default_geometry() -> String {
    "1280x800x24".to_string()
}

fn default_dev_port() -> u16 {
    5173
}

/// Terminal session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Zero-subscriber sessions idle longer than this are reaped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            scrollback_bytes: default_scrollback_bytes(),
            shell: default_shell(),
        }
    }
}

/// Chat session buffering and eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// In-memory ring buffer capacity, in events.
    #[serde(default = "default_buffer_events")]
    pub buffer_events: usize,
    /// How many trailing events each on-disk record keeps.
    #[serde(default = "default_persist_events")]
    pub persist_events: usize,
    /// Delay before a terminal-state session is dropped from memory.
    #[serde(default = "default_evict_secs")]
    pub evict_secs: u64,
    /// Agent CLI executable driven by the pipeline.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            buffer_events: default_buffer_events(),
            persist_events: default_persist_events(),
            evict_secs: default_evict_secs(),
            agent_command: default_agent_command(),
        }
    }
}

/// Remote-desktop tunnel target and bootstrap parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_display")]
    pub display: String,
    /// TCP port the framebuffer exporter listens on.
    #[serde(default = "default_vnc_port")]
    pub vnc_port: u16,
    #[serde(default = "default_geometry")]
    pub geometry: String,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            display: default_display(),
            vnc_port: default_vnc_port(),
            geometry: default_geometry(),
        }
    }
}

/// Upstream dev server whose upgrade endpoint the gateway relays to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerConfig {
    #[serde(default = "default_dev_port")]
    pub port: u16,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            port: default_dev_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Shared secret for all authenticated surfaces. `None` disables
    /// enforcement entirely (open access).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub desktop: DesktopConfig,
    #[serde(default)]
    pub dev_server: DevServerConfig,
    #[serde(skip)]
    paths: Option<ConfigPaths>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            auth_secret: None,
            terminal: TerminalConfig::default(),
            chat: ChatConfig::default(),
            desktop: DesktopConfig::default(),
            dev_server: DevServerConfig::default(),
            paths: None,
        }
    }
}

impl DaemonConfig {
    /// Returns the `ConfigPaths` for this config. If paths haven't been set,
    /// creates the default paths (may fail if `$HOME` is unset).
    pub fn paths(&self) -> anyhow::Result<ConfigPaths> {
        match &self.paths {
            Some(p) => Ok(p.clone()),
            None => ConfigPaths::new(),
        }
    }

    /// Set a custom `ConfigPaths` (useful for testing or multi-instance).
    pub fn set_paths(&mut self, paths: ConfigPaths) {
        self.paths = Some(paths);
    }

    /// Load config from the default location (`~/.switchboard/config.toml`).
    pub fn load() -> anyhow::Result<Self> {
        let paths = ConfigPaths::new()?;
        Self::load_from(&paths)
    }

    /// Load config from a specific `ConfigPaths`. A missing config file is
    /// not an error; the secret file, when present, supplies `auth_secret`
    /// unless the config already sets one.
    pub fn load_from(paths: &ConfigPaths) -> anyhow::Result<Self> {
        let config_file = paths.config_path();
        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            config
        } else {
            Self::default()
        };
        if config.auth_secret.is_none() {
            if let Ok(secret) = std::fs::read_to_string(paths.secret_path()) {
                let secret = secret.trim().to_string();
                if !secret.is_empty() {
                    config.auth_secret = Some(secret);
                }
            }
        }
        config.paths = Some(paths.clone());
        config.validate()?;
        Ok(config)
    }

    /// Validate config values. Called automatically by `load` / `load_from`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must not be 0");
        }
        if self.terminal.max_sessions == 0 {
            anyhow::bail!("terminal.max_sessions must be greater than 0");
        }
        if self.terminal.scrollback_bytes == 0 {
            anyhow::bail!("terminal.scrollback_bytes must be greater than 0");
        }
        if self.chat.buffer_events == 0 {
            anyhow::bail!("chat.buffer_events must be greater than 0");
        }
        if self.chat.persist_events > self.chat.buffer_events {
            anyhow::bail!("chat.persist_events must not exceed chat.buffer_events");
        }
        if self.desktop.vnc_port == 0 {
            anyhow::bail!("desktop.vnc_port must not be 0");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
