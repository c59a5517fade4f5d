//! Deadline-ordered list of deferred work.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::lane::CpuQid;
use crate::work::WorkItem;

struct TimedEntry {
    deadline_ms: u64,
    seq: u64,
    qid: CpuQid,
    item: WorkItem,
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest deadline, ties in insertion order.
impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timed work waiting for its deadline.
#[derive(Default)]
pub struct TimedQueue {
    heap: BinaryHeap<TimedEntry>,
    next_seq: u64,
}

impl TimedQueue {
    /// Creates an empty timed queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an item due at `deadline_ms`, to be run on `qid`.
    pub fn insert(&mut self, deadline_ms: u64, qid: CpuQid, mut item: WorkItem) {
        item.dispatch_after_ms = Some(deadline_ms);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimedEntry {
            deadline_ms,
            seq,
            qid,
            item,
        });
    }

    /// Time until the earliest deadline, `Duration::ZERO` if already due,
    /// `None` when nothing is scheduled.
    pub fn time_till_first(&self, now_ms: u64) -> Option<Duration> {
        self.heap
            .peek()
            .map(|e| Duration::from_millis(e.deadline_ms.saturating_sub(now_ms)))
    }

    /// Removes every item due at or before `now_ms`, earliest first.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<(CpuQid, WorkItem)> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline_ms > now_ms {
                break;
            }
            if let Some(e) = self.heap.pop() {
                due.push((e.qid, e.item));
            }
        }
        due
    }

    /// Number of pending timed items.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
