//! Ring buffer of delivered log messages.
//!
//! [`LogBuffer`] keeps the most recent `buffer_size` messages a log-stream
//! session has delivered, so a reader that joins late (or re-opens the
//! dashboard panel) can fetch them via `GET /api/logs/stream/{id}/recent`.
//! When full, the oldest entry is evicted.

use std::collections::VecDeque;

use serde::Serialize;

use super::LogMessage;

/// A single sequenced entry.
#[derive(Debug, Clone, Serialize)]
pub struct BufferedLine {
    /// Monotonically increasing sequence number (unique within a session).
    pub seq: u64,
    #[serde(flatten)]
    pub message: LogMessage,
}

pub struct LogBuffer {
    entries: VecDeque<BufferedLine>,
    next_seq: u64,
    max_entries: usize,
}

impl LogBuffer {
    /// Create a new buffer that holds at most `max_entries` items.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries: max_entries.max(1),
        }
    }

    /// Append a message, evicting the oldest if full.
    pub fn push(&mut self, message: LogMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(BufferedLine { seq, message });
    }

    /// All entries with `seq > since`.
    ///
    /// Returns `(entries, dropped_count)` where `dropped_count > 0` if entries
    /// between `since` and the oldest available entry were evicted.
    pub fn read_since(&self, since: u64) -> (Vec<BufferedLine>, u64) {
        let oldest_available = self.entries.front().map_or(self.next_seq, |e| e.seq);
        let dropped = oldest_available.saturating_sub(since.saturating_add(1));
        let entries = self
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();
        (entries, dropped)
    }

    /// Everything currently retained, oldest first.
    pub fn recent(&self) -> Vec<BufferedLine> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number the next pushed entry will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut LogBuffer, n: usize) {
        for i in 0..n {
            buf.push(LogMessage::line(format!("line {i}")));
        }
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut buf = LogBuffer::new(3);
        fill(&mut buf, 5);
        let recent = buf.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message.content, "line 2");
        assert_eq!(recent[2].message.content, "line 4");
        assert_eq!(recent[0].seq, 3);
        assert_eq!(buf.next_seq(), 6);
    }

    #[test]
    fn test_read_since_reports_dropped() {
        let mut buf = LogBuffer::new(3);
        fill(&mut buf, 5);
        // seqs 3..=5 retained; 1 was seen, 2 was evicted
        let (entries, dropped) = buf.read_since(1);
        assert_eq!(dropped, 1);
        assert_eq!(entries.len(), 3);

        let (entries, dropped) = buf.read_since(4);
        assert_eq!(dropped, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.content, "line 4");
    }

    #[test]
    fn test_empty_buffer() {
        let buf = LogBuffer::new(10);
        assert!(buf.is_empty());
        let (entries, dropped) = buf.read_since(0);
        assert!(entries.is_empty());
        assert_eq!(dropped, 0);
    }
}
