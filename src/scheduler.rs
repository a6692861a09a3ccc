//! Deadline-ordered timer queue
//!
//! A single min-heap of expiry instants shared by everything an actor needs to
//! time out: claim auto-releases in the hub, run deadlines in the orchestrator.
//! Inserting is O(log n); cancelling is O(1) and lazy (the heap entry is
//! skipped when it surfaces).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

/// Handle returned by [`DeadlineScheduler::schedule`], used to cancel a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct DeadlineScheduler<K> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, K>,
    next_id: u64,
}

impl<K> Default for DeadlineScheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DeadlineScheduler<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Arm a timer that yields `key` once `deadline` has passed
    pub fn schedule(&mut self, deadline: Instant, key: K) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, key);
        TimerId(id)
    }

    /// Disarm a timer. Returns the key if the timer was still pending.
    pub fn cancel(&mut self, timer: TimerId) -> Option<K> {
        self.entries.remove(&timer.0)
    }

    pub fn is_pending(&self, timer: TimerId) -> bool {
        self.entries.contains_key(&timer.0)
    }

    /// Earliest live deadline, discarding cancelled heads on the way
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// in deadline order
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(key) = self.entries.remove(&id) {
                expired.push(key);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sleep until the given deadline, or forever when there is none.
///
/// Meant for `tokio::select!` arms in actor loops.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
