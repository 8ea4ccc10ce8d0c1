//! Priority Scheduling
//!
//! A two-level priority queue shared by the task processor and the outbound
//! message queue. `High` always drains before `Normal`; within a level items
//! come out in enqueue order. Items can also be parked until a deadline
//! (used for retry backoff) and are promoted into the ready heap once their
//! deadline passes.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Delivery/dispatch priority
///
/// Declaration order matters: `Normal < High`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Regular notifications and submissions
    #[default]
    Normal,
    /// Results the client is actively waiting on
    High,
}

impl Priority {
    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

struct Slot<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    // Max-heap: higher priority first, then lower sequence (earlier enqueue) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Parked<T> {
    ready_at: Instant,
    priority: Priority,
    item: T,
}

/// Priority queue with FIFO tie-break and deadline-parked items
pub struct PriorityQueue<T> {
    ready: BinaryHeap<Slot<T>>,
    parked: Vec<Parked<T>>,
    next_seq: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            parked: Vec::new(),
            next_seq: 0,
        }
    }

    /// Push an item that is ready immediately
    pub fn push(&mut self, item: T, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Slot {
            priority,
            seq,
            item,
        });
    }

    /// Park an item until `ready_at`
    ///
    /// Once promoted it queues behind everything already ready at its level.
    pub fn push_at(&mut self, item: T, priority: Priority, ready_at: Instant) {
        self.parked.push(Parked {
            ready_at,
            priority,
            item,
        });
    }

    /// Pop the highest-priority, earliest-enqueued ready item
    pub fn pop(&mut self) -> Option<T> {
        self.promote(Instant::now());
        self.ready.pop().map(|slot| slot.item)
    }

    /// Move every parked item whose deadline has passed into the ready heap
    fn promote(&mut self, now: Instant) {
        if self.parked.is_empty() {
            return;
        }
        let mut index = 0;
        while index < self.parked.len() {
            if self.parked[index].ready_at <= now {
                let parked = self.parked.swap_remove(index);
                self.push(parked.item, parked.priority);
            } else {
                index += 1;
            }
        }
    }

    /// Earliest deadline among parked items
    #[must_use]
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.parked.iter().map(|p| p.ready_at).min()
    }

    /// Total items, ready and parked
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len() + self.parked.len()
    }

    /// Items parked awaiting their deadline
    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Whether the queue holds nothing at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
