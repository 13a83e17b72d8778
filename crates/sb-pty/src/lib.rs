pub mod pool;
pub mod reader;
pub mod scrollback;
pub mod session;

pub use pool::{TermPool, TermSummary};
pub use reader::PtyOutput;
pub use session::TermSession;

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Session not found: {0}")]
    SessionNotFound(uuid::Uuid),
    #[error("Session limit reached ({0} concurrent sessions)")]
    SessionLimit(usize),
    #[error("PTY error: {0}")]
    Pty(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
