// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Min-heap time queue with cancellation by handle.
//!
//! Entries are ordered by `(deadline, insertion sequence)`, so ties on the deadline
//! fire in insertion order. Cancellation is by [`TimerHandle`]: the heap entry is
//! tombstoned and skipped lazily when it reaches the top, which keeps both
//! [`TimeQueue::enqueue`] and [`TimeQueue::cancel`] at `O(log n)` amortized.
//!
//! The queue is generic over the callback type so it can be exercised without a
//! reactor; the reactor instantiates it with boxed `FnOnce(&mut Reactor)` callbacks
//! and pops one due entry at a time, re-reading the top between invocations so that
//! callbacks may themselves enqueue or cancel.

use std::{collections::BinaryHeap, time::Instant};

use rustc_hash::FxHashSet;

/// Opaque, stable identifier for a queued timer. Cancelling a handle that already
/// fired (or was already cancelled) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct TimeQueueEntry<C> {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
    callback: C,
}

impl<C> PartialEq for TimeQueueEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<C> Eq for TimeQueueEntry<C> {}

impl<C> PartialOrd for TimeQueueEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for TimeQueueEntry<C> {
    /// Inverted so the std max-heap pops the earliest deadline (ties: lowest seq).
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Min-heap of `(deadline, callback)` pairs. See the [module docs](self).
pub struct TimeQueue<C> {
    heap: BinaryHeap<TimeQueueEntry<C>>,
    /// Handles enqueued and not yet fired or cancelled.
    live: FxHashSet<u64>,
    /// Handles cancelled while still in the heap; purged lazily.
    cancelled: FxHashSet<u64>,
    next_seq: u64,
    next_handle: u64,
}

impl<C> Default for TimeQueue<C> {
    fn default() -> Self { Self::new() }
}

impl<C> std::fmt::Debug for TimeQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeQueue")
            .field("len", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl<C> TimeQueue<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: FxHashSet::default(),
            cancelled: FxHashSet::default(),
            next_seq: 0,
            next_handle: 0,
        }
    }

    /// Inserts a callback to run at `deadline`. A deadline already in the past is
    /// legal; the entry fires on the next sweep.
    pub fn enqueue(&mut self, deadline: Instant, callback: C) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(handle.0);
        self.heap.push(TimeQueueEntry {
            deadline,
            seq,
            handle,
            callback,
        });
        handle
    }

    /// Cancels a queued entry. Idempotent: unknown, fired, and already-cancelled
    /// handles are ignored.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if self.live.remove(&handle.0) {
            self.cancelled.insert(handle.0);
        }
    }

    /// Earliest pending deadline, if any. `O(1)` modulo lazy tombstone purging.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.purge_top();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the earliest entry whose deadline is at or before `now`. The caller
    /// invokes the callback and then calls this again, which is what lets callbacks
    /// enqueue or cancel further entries mid-sweep.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, C)> {
        self.purge_top();
        if self.heap.peek().is_some_and(|top| top.deadline <= now) {
            let entry = self.heap.pop()?;
            self.live.remove(&entry.handle.0);
            return Some((entry.handle, entry.callback));
        }
        None
    }

    /// Number of live (not yet fired, not cancelled) entries.
    #[must_use]
    pub fn len(&self) -> usize { self.live.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.live.is_empty() }

    /// Drops tombstoned entries sitting on top of the heap.
    fn purge_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.handle.0) {
                drop(self.heap.pop());
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    type Queue = TimeQueue<&'static str>;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut q = Queue::new();
        let now = Instant::now();
        q.enqueue(now + Duration::from_millis(50), "a");
        q.enqueue(now + Duration::from_millis(10), "b");
        q.enqueue(now + Duration::from_millis(30), "c");

        let late = now + Duration::from_millis(60);
        let mut fired = vec![];
        while let Some((_, cb)) = q.pop_due(late) {
            fired.push(cb);
        }
        assert_eq!(fired, vec!["b", "c", "a"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let mut q = Queue::new();
        let now = Instant::now();
        let deadline = now + Duration::from_millis(10);
        q.enqueue(deadline, "first");
        q.enqueue(deadline, "second");
        q.enqueue(deadline, "third");

        let mut fired = vec![];
        while let Some((_, cb)) = q.pop_due(deadline) {
            fired.push(cb);
        }
        assert_eq!(fired, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_past_deadline_fires_on_next_sweep() {
        let mut q = Queue::new();
        let now = Instant::now();
        q.enqueue(now - Duration::from_millis(5), "past");
        assert_eq!(q.pop_due(now).map(|(_, cb)| cb), Some("past"));
    }

    #[test]
    fn test_cancel_is_idempotent_and_skips_entry() {
        let mut q = Queue::new();
        let now = Instant::now();
        let keep = q.enqueue(now, "keep");
        let drop_it = q.enqueue(now, "drop");
        q.cancel(drop_it);
        q.cancel(drop_it);
        assert_eq!(q.len(), 1);

        let mut fired = vec![];
        while let Some((handle, cb)) = q.pop_due(now) {
            assert_eq!(handle, keep);
            fired.push(cb);
        }
        assert_eq!(fired, vec!["keep"]);

        // Cancelling a fired handle is inert.
        q.cancel(keep);
        assert!(q.is_empty());
    }

    #[test]
    fn test_next_deadline_skips_cancelled_top() {
        let mut q = Queue::new();
        let now = Instant::now();
        let soon = q.enqueue(now + Duration::from_millis(1), "soon");
        q.enqueue(now + Duration::from_millis(100), "later");
        q.cancel(soon);
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_not_due_yet_returns_none() {
        let mut q = Queue::new();
        let now = Instant::now();
        q.enqueue(now + Duration::from_secs(60), "far");
        assert!(q.pop_due(now).is_none());
        assert_eq!(q.len(), 1);
    }
}
