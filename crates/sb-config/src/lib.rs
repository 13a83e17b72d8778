pub mod daemon;
pub mod paths;

pub use daemon::{ChatConfig, DaemonConfig, DesktopConfig, DevServerConfig, TerminalConfig};
pub use paths::ConfigPaths;
