//! Per-core ordered set of ready threads.

use arrayvec::ArrayVec;
use rtk_params::MAX_THREADS;

use crate::{Priority, thread::ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub(crate) id: ThreadId,
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
    pub(crate) pinned: bool,
}

impl ReadyEntry {
    fn key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }
}

/// Ready threads sorted by priority, then by insertion stamp.
///
/// The head is the thread to run next.
#[derive(Debug)]
pub(crate) struct ReadyQueue {
    entries: ArrayVec<ReadyEntry, MAX_THREADS>,
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// # Panics
    ///
    /// Panics if the queue is full. Every thread occupies a table slot, so
    /// that cannot happen with consistent bookkeeping.
    pub(crate) fn insert(&mut self, entry: ReadyEntry) {
        debug_assert!(!self.contains(entry.id), "{:?} queued twice", entry.id);
        let pos = self.entries.partition_point(|e| e.key() <= entry.key());
        if let Err(err) = self.entries.try_insert(pos, entry) {
            panic!("ready queue overflow: {err}");
        }
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<ReadyEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn peek(&self) -> Option<&ReadyEntry> {
        self.entries.first()
    }

    pub(crate) fn pop(&mut self) -> Option<ReadyEntry> {
        self.entries.pop_at(0)
    }

    /// Highest-ranked entry that may run on other cores.
    pub(crate) fn best_floating(&self) -> Option<&ReadyEntry> {
        self.entries.iter().find(|e| !e.pinned)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ReadyEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;

    fn entry(index: usize, priority: Priority, seq: u64, pinned: bool) -> ReadyEntry {
        ReadyEntry {
            id: ThreadId::idle(index),
            priority,
            seq,
            pinned,
        }
    }

    fn order(q: &ReadyQueue) -> Vec<usize> {
        q.iter().map(|e| e.id.index()).collect()
    }

    #[test]
    fn priority_then_fifo() {
        let mut q = ReadyQueue::new();
        q.insert(entry(0, 7, 1, false));
        q.insert(entry(1, 5, 2, false));
        q.insert(entry(2, 7, 3, false));
        q.insert(entry(3, 5, 4, false));
        assert_eq!(order(&q), [1, 3, 0, 2]);

        assert_eq!(q.pop().map(|e| e.id.index()), Some(1));
        assert_eq!(q.peek().map(|e| e.id.index()), Some(3));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn older_stamp_goes_first() {
        let mut q = ReadyQueue::new();
        q.insert(entry(0, 3, 10, false));
        // a migrated thread keeps its older stamp
        q.insert(entry(1, 3, 2, false));
        assert_eq!(order(&q), [1, 0]);
    }

    #[test]
    fn remove_and_floating_lookup() {
        let mut q = ReadyQueue::new();
        q.insert(entry(0, 1, 1, true));
        q.insert(entry(1, 2, 2, false));
        q.insert(entry(2, 3, 3, false));

        assert_eq!(q.best_floating().map(|e| e.id.index()), Some(1));
        assert!(q.remove(ThreadId::idle(1)).is_some());
        assert!(q.remove(ThreadId::idle(1)).is_none());
        assert_eq!(q.best_floating().map(|e| e.id.index()), Some(2));
        assert!(q.remove(ThreadId::idle(2)).is_some());
        assert!(q.best_floating().is_none());
        assert!(!q.is_empty());
    }
}
