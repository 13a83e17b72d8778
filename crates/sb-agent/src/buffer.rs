use crate::event::AgentEvent;
use std::collections::VecDeque;

/// Bounded ring of a session's emitted events.
///
/// At capacity, each append first evicts the oldest ~10% in the same call,
/// so no reader ever observes more than `capacity` events.
pub struct EventBuffer {
    events: VecDeque<AgentEvent>,
    capacity: usize,
    evicted: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn push(&mut self, event: AgentEvent) {
        if self.events.len() >= self.capacity {
            let drop_count = (self.capacity / 10).max(1);
            for _ in 0..drop_count {
                if self.events.pop_front().is_none() {
                    break;
                }
                self.evicted += 1;
            }
        }
        self.events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.events.iter().cloned().collect()
    }

    /// The trailing `n` events, oldest first. Used for the on-disk record.
    pub fn tail(&self, n: usize) -> Vec<AgentEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// How many events have been truncated from the front over the
    /// session's lifetime.
    pub fn evicted(&self) -> usize {
        self.evicted
    }
}
