use portable_pty::Child;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One item on a session's ordered output queue. `Exit` is always the last
/// item the reader produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyOutput {
    Data(Vec<u8>),
    Exit(Option<u32>),
}

/// Context for the blocking reader thread owned by each session.
pub(crate) struct ReaderContext {
    pub reader: Box<dyn Read + Send>,
    pub output_tx: mpsc::UnboundedSender<PtyOutput>,
    pub stopped: Arc<std::sync::atomic::AtomicBool>,
    pub child: Option<Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>>,
    pub session_id: Uuid,
}

pub(crate) fn spawn_reader_thread(ctx: ReaderContext) {
    let thread_name = format!("pty-reader-{}", ctx.session_id);
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            tracing::debug!(session_id = %ctx.session_id, "reader thread started");
            run_reader_loop(ctx);
        })
        .expect("failed to spawn pty reader thread");
}

fn run_reader_loop(ctx: ReaderContext) {
    let ReaderContext {
        mut reader,
        output_tx,
        stopped,
        child,
        session_id,
    } = ctx;

    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let _ = output_tx.send(PtyOutput::Data(buf[..n].to_vec()));
            }
            Err(err) => {
                if err.kind() == std::io::ErrorKind::Interrupted
                    || err.kind() == std::io::ErrorKind::WouldBlock
                {
                    continue;
                }

                if let Some(child) = &child {
                    let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        break;
                    }
                } else {
                    tracing::warn!(session_id = %session_id, error = %err, "reader error");
                    break;
                }
            }
        }
    }

    stopped.store(true, std::sync::atomic::Ordering::SeqCst);

    let exit_code = if let Some(child) = &child {
        let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
        child.wait().ok().map(|s| s.exit_code())
    } else {
        None
    };

    let _ = output_tx.send(PtyOutput::Exit(exit_code));
    tracing::debug!(session_id = %session_id, ?exit_code, "reader thread finished");
}
