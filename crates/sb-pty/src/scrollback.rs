use std::collections::VecDeque;

/// Bounded byte history of a terminal session's output.
///
/// Chunks are appended as they arrive from the reader; when the total size
/// exceeds `max_bytes` the oldest chunks are dropped inside the same call,
/// so a snapshot taken between pushes never observes more than the cap.
pub struct Scrollback {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl Scrollback {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        self.total_bytes = self.total_bytes.saturating_add(data.len());
        self.chunks.push_back(data.to_vec());

        while self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(removed) => {
                    self.total_bytes = self.total_bytes.saturating_sub(removed.len());
                }
                None => break,
            }
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}
