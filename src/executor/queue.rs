//! Ordered holding area for units that could not run yet.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// An item tagged with its submission order.
#[derive(Debug)]
pub struct Pending<T> {
    pub seq: u64,
    pub item: T,
}

/// Verdict of one readiness evaluation during a scan.
#[derive(Debug)]
pub enum Verdict<R> {
    /// Remove and hand to the caller for dispatch.
    Ready,
    /// Leave in place.
    Wait,
    /// Remove without dispatching, carrying the reason.
    Evict(R),
}

/// Result of a single pass over the queue.
#[derive(Debug)]
pub struct Scan<T, R> {
    /// Entries found ready, in submission order.
    pub ready: Vec<Pending<T>>,
    /// Entries removed without dispatch.
    pub evicted: Vec<(Pending<T>, R)>,
    /// Entries inspected.
    pub scanned: usize,
    /// Entries still queued after the pass.
    pub remaining: usize,
}

struct Inner<T> {
    entries: VecDeque<Pending<T>>,
    next_seq: u64,
}

/// FIFO of parked items with a single-pass readiness scan.
///
/// The sequence number is assigned under the same lock that orders the
/// deque, so iteration order always equals submission order.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Append an item; returns its sequence number.
    pub fn push(&self, item: T) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push_back(Pending { seq, item });
        seq
    }

    /// Append unless the queue already holds `max` items; gives the item back
    /// together with the current length when full.
    pub fn push_bounded(&self, item: T, max: Option<usize>) -> Result<u64, (T, usize)> {
        let mut inner = self.inner.lock();
        if let Some(max) = max {
            if inner.entries.len() >= max {
                let len = inner.entries.len();
                return Err((item, len));
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push_back(Pending { seq, item });
        Ok(seq)
    }

    /// Evaluate every entry once, removing the ones `check` selects.
    ///
    /// The lock is held for the whole pass: a concurrent push lands entirely
    /// before or after it.
    pub fn scan<R, F>(&self, mut check: F) -> Scan<T, R>
    where
        F: FnMut(&T) -> Verdict<R>,
    {
        let mut inner = self.inner.lock();
        let scanned = inner.entries.len();
        let mut kept = VecDeque::with_capacity(scanned);
        let mut ready = Vec::new();
        let mut evicted = Vec::new();

        for entry in inner.entries.drain(..) {
            match check(&entry.item) {
                Verdict::Ready => ready.push(entry),
                Verdict::Wait => kept.push_back(entry),
                Verdict::Evict(reason) => evicted.push((entry, reason)),
            }
        }

        let remaining = kept.len();
        inner.entries = kept;
        Scan {
            ready,
            evicted,
            scanned,
            remaining,
        }
    }

    /// Put entries back at their original positions.
    pub fn reinsert(&self, entries: Vec<Pending<T>>) {
        if entries.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.entries.extend(entries);
        inner.entries.make_contiguous().sort_by_key(|e| e.seq);
    }

    /// Remove everything, in submission order.
    pub fn drain_all(&self) -> Vec<Pending<T>> {
        self.inner.lock().entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}
