//! Human-readable engine log list
//!
//! Observers (a UI, the CLI) see the most recent engine messages here; the
//! same events also go to `tracing`.

use chrono::Local;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::watch;

use crate::constants::LOG_CAPACITY;

/// Bounded list of timestamped messages, oldest evicted first
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
    tx: watch::Sender<Vec<String>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            tx,
        }
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), message.as_ref());
        let snapshot = {
            let mut lines = self.lines.lock();
            lines.push_back(line);
            while lines.len() > self.capacity {
                lines.pop_front();
            }
            lines.iter().cloned().collect::<Vec<_>>()
        };
        self.tx.send_replace(snapshot);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tx.subscribe()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
        self.tx.send_replace(Vec::new());
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let logs = LogBuffer::new(3);
        for i in 0..5 {
            logs.push(format!("line {i}"));
        }
        let lines = logs.snapshot();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line 2"));
        assert!(lines[2].ends_with("line 4"));
    }

    #[test]
    fn test_subscribers_see_updates() {
        let logs = LogBuffer::default();
        let rx = logs.subscribe();
        logs.push("Discovered: 10.0.0.2");
        assert_eq!(rx.borrow().len(), 1);
        assert!(rx.borrow()[0].starts_with('['));
        logs.clear();
        assert!(rx.borrow().is_empty());
    }
}
