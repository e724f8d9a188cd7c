//! Bounded log storage for runnable output.
//!
//! Every runnable owns three ring buffers (stdout, stderr, combined) kept in a
//! shared `LogStore` keyed by runnable id. Keeping logs out of the instance
//! state avoids cyclic ownership between the supervisor and its instances;
//! readers query the store directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// The interleaved stdout+stderr view.
    Combined,
}

/// A fixed-capacity ring buffer of log lines, oldest-drop.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl RingBuffer {
    /// Creates a new buffer with the given maximum capacity.
    ///
    /// A capacity of zero discards every push.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Adds a line, dropping the oldest if the buffer is full.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Removes all stored lines.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Returns the number of stored lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns every stored line in insertion order.
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Returns the most recent `min(n, len)` lines in insertion order.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug)]
struct RunnableLogs {
    stdout: RingBuffer,
    stderr: RingBuffer,
    combined: RingBuffer,
}

impl RunnableLogs {
    fn new(capacity: usize) -> Self {
        Self {
            stdout: RingBuffer::new(capacity),
            stderr: RingBuffer::new(capacity),
            combined: RingBuffer::new(capacity),
        }
    }

    fn buffer(&self, stream: StreamKind) -> &RingBuffer {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
            StreamKind::Combined => &self.combined,
        }
    }
}

/// Shared log storage for all runnables.
///
/// `push` and the query methods are externally consistent: a line appended
/// before a query is observed by that query. One pipe reader writes per
/// stream, so lines within a stream are never interleaved.
#[derive(Debug)]
pub struct LogStore {
    capacity: usize,
    logs: Mutex<HashMap<String, RunnableLogs>>,
}

impl LogStore {
    /// Creates a store whose per-stream buffers hold `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a line to the stream-specific buffer and the combined buffer.
    pub fn push(&self, id: &str, line: String, stream: StreamKind) {
        let mut logs = self.logs.lock().unwrap();
        let entry = logs
            .entry(id.to_string())
            .or_insert_with(|| RunnableLogs::new(self.capacity));
        match stream {
            StreamKind::Stdout => entry.stdout.push(line.clone()),
            StreamKind::Stderr => entry.stderr.push(line.clone()),
            StreamKind::Combined => {}
        }
        entry.combined.push(line);
    }

    /// Drops all three buffers for the id.
    pub fn clear(&self, id: &str) {
        let mut logs = self.logs.lock().unwrap();
        if let Some(entry) = logs.get_mut(id) {
            entry.stdout.clear();
            entry.stderr.clear();
            entry.combined.clear();
        }
    }

    /// Returns every stored line for the stream in insertion order.
    pub fn to_vec(&self, id: &str, stream: StreamKind) -> Vec<String> {
        let logs = self.logs.lock().unwrap();
        logs.get(id)
            .map(|entry| entry.buffer(stream).to_vec())
            .unwrap_or_default()
    }

    /// Returns the most recent `n` lines for the stream in insertion order.
    pub fn tail(&self, id: &str, stream: StreamKind, n: usize) -> Vec<String> {
        let logs = self.logs.lock().unwrap();
        logs.get(id)
            .map(|entry| entry.buffer(stream).tail(n))
            .unwrap_or_default()
    }

    /// Returns the number of stored lines for the stream.
    pub fn len(&self, id: &str, stream: StreamKind) -> usize {
        let logs = self.logs.lock().unwrap();
        logs.get(id).map(|entry| entry.buffer(stream).len()).unwrap_or(0)
    }
}

/// Removes ANSI escape sequences, replacing invalid UTF-8.
pub fn strip_ansi(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut buffer = RingBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.to_vec(), vec!["b", "c"]);
    }

    #[test]
    fn ring_buffer_zero_capacity_discards() {
        let mut buffer = RingBuffer::new(0);
        buffer.push("a".into());
        buffer.push("b".into());
        assert!(buffer.is_empty());
        assert!(buffer.to_vec().is_empty());
        assert!(buffer.tail(10).is_empty());
    }

    #[test]
    fn ring_buffer_tail_returns_most_recent_in_order() {
        let mut buffer = RingBuffer::new(10);
        for i in 0..5 {
            buffer.push(format!("line{}", i));
        }
        assert_eq!(buffer.tail(2), vec!["line3", "line4"]);
        assert_eq!(buffer.tail(100).len(), 5);
    }

    #[test]
    fn store_routes_streams_and_combines() {
        let store = LogStore::new(100);
        store.push("api", "out".into(), StreamKind::Stdout);
        store.push("api", "err".into(), StreamKind::Stderr);
        assert_eq!(store.to_vec("api", StreamKind::Stdout), vec!["out"]);
        assert_eq!(store.to_vec("api", StreamKind::Stderr), vec!["err"]);
        assert_eq!(store.to_vec("api", StreamKind::Combined), vec!["out", "err"]);
        assert_eq!(store.len("api", StreamKind::Combined), 2);
    }

    #[test]
    fn store_clear_empties_all_streams() {
        let store = LogStore::new(100);
        store.push("api", "out".into(), StreamKind::Stdout);
        store.push("api", "err".into(), StreamKind::Stderr);
        store.clear("api");
        assert_eq!(store.len("api", StreamKind::Stdout), 0);
        assert_eq!(store.len("api", StreamKind::Stderr), 0);
        assert_eq!(store.len("api", StreamKind::Combined), 0);
    }

    #[test]
    fn store_unknown_id_is_empty() {
        let store = LogStore::new(100);
        assert!(store.to_vec("ghost", StreamKind::Combined).is_empty());
        assert_eq!(store.len("ghost", StreamKind::Stdout), 0);
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        let colored = "\u{1b}[32mlistening\u{1b}[0m on 5432";
        assert_eq!(strip_ansi(colored), "listening on 5432");
    }
}
