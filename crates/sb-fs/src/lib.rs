pub mod watch;

pub use watch::{FsEvent, FsEventKind, WatchRegistry};
