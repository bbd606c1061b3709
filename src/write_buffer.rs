//! Buffered plaintext writes and the byte accounting that drives writability.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::completion::Completion;

pub struct PendingWrite {
    pub data: Bytes,
    pub completion: Option<Completion>,
}

/// Ordered queue of writes with a flush mark.
///
/// Only the first `marked` entries may be drained; anything pushed after the
/// last `mark()` waits for the next flush.
#[derive(Default)]
pub struct BufferedWrites {
    queue: VecDeque<PendingWrite>,
    marked: usize,
}

impl BufferedWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: Bytes, completion: Option<Completion>) {
        self.queue.push_back(PendingWrite { data, completion });
    }

    /// Moves the flush mark to the end of the queue.
    pub fn mark(&mut self) {
        self.marked = self.queue.len();
    }

    pub fn has_marked(&self) -> bool {
        self.marked > 0
    }

    pub fn pop_marked(&mut self) -> Option<PendingWrite> {
        if self.marked == 0 {
            return None;
        }
        self.marked -= 1;
        self.queue.pop_front()
    }

    /// Puts back a write taken with `pop_marked` that could not be encoded yet.
    pub fn push_front_marked(&mut self, write: PendingWrite) {
        self.queue.push_front(write);
        self.marked += 1;
    }

    /// Removes every buffered write regardless of the mark.
    pub fn drain_all(&mut self) -> Vec<PendingWrite> {
        self.marked = 0;
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Cloneable read-only view of a channel's writability.
#[derive(Debug, Clone)]
pub struct WritabilityHandle(Arc<AtomicBool>);

impl WritabilityHandle {
    pub fn is_writable(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counts plaintext bytes that were written but whose completion has not fired.
///
/// Crossing above `high_watermark` turns writability off, dropping below
/// `low_watermark` turns it back on. Each crossing is reported once.
#[derive(Debug)]
pub struct WriteAccounting {
    pending_bytes: usize,
    low_watermark: usize,
    high_watermark: usize,
    writable: Arc<AtomicBool>,
}

impl WriteAccounting {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            pending_bytes: 0,
            low_watermark,
            high_watermark,
            writable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> WritabilityHandle {
        WritabilityHandle(self.writable.clone())
    }

    /// Returns `Some(false)` if this addition made the channel unwritable.
    pub fn add(&mut self, len: usize) -> Option<bool> {
        self.pending_bytes += len;
        if self.pending_bytes > self.high_watermark && self.is_writable() {
            self.writable.store(false, Ordering::Release);
            return Some(false);
        }
        None
    }

    /// Returns `Some(true)` if this removal made the channel writable again.
    pub fn remove(&mut self, len: usize) -> Option<bool> {
        self.pending_bytes = self.pending_bytes.saturating_sub(len);
        if self.pending_bytes < self.low_watermark && !self.is_writable() {
            self.writable.store(true, Ordering::Release);
            return Some(true);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_limits_drain() {
        let mut writes = BufferedWrites::new();
        writes.push(Bytes::from_static(b"a"), None);
        writes.push(Bytes::from_static(b"b"), None);
        writes.mark();
        writes.push(Bytes::from_static(b"c"), None);

        assert_eq!(writes.pop_marked().unwrap().data, Bytes::from_static(b"a"));
        assert_eq!(writes.pop_marked().unwrap().data, Bytes::from_static(b"b"));
        assert!(writes.pop_marked().is_none());
        assert_eq!(writes.len(), 1);

        writes.mark();
        assert_eq!(writes.pop_marked().unwrap().data, Bytes::from_static(b"c"));
        assert!(writes.is_empty());
    }

    #[test]
    fn test_push_front_marked() {
        let mut writes = BufferedWrites::new();
        writes.push(Bytes::from_static(b"a"), None);
        writes.mark();
        let first = writes.pop_marked().unwrap();
        writes.push_front_marked(first);
        assert!(writes.has_marked());
        assert_eq!(writes.drain_all().len(), 1);
        assert!(!writes.has_marked());
    }

    #[test]
    fn test_watermark_transitions() {
        let mut accounting = WriteAccounting::new(2, 2048);
        let handle = accounting.handle();

        assert_eq!(accounting.add(1024), None);
        assert_eq!(accounting.add(1024), None);
        assert_eq!(accounting.add(1), Some(false));
        assert!(!handle.is_writable());
        assert_eq!(accounting.add(10), None);

        assert_eq!(accounting.remove(2000), None);
        assert_eq!(accounting.remove(57), None);
        assert_eq!(accounting.remove(2), Some(true));
        assert!(handle.is_writable());
        assert_eq!(accounting.pending_bytes(), 0);
    }
}
