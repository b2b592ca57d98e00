use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::handle::TaskHandle;

/// Ordering key for one armed timer. Keys order by due time, then by arm
/// sequence, so entries with equal due times fire in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub due: Instant,
    pub seq: u64,
    pub handle: TaskHandle,
}

/// Min-heap of armed timers. Cancellation and re-arming are lazy: a popped
/// key whose handle no longer resolves to a slot armed with the same
/// sequence is dead and gets dropped by the loop.
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerKey>>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Arm `handle` at `due`. Returns the sequence issued for this key,
    /// which the handle table records for staleness checks.
    pub fn push(&mut self, due: Instant, handle: TaskHandle) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(TimerKey { due, seq, handle }));
        seq
    }

    pub fn peek(&self) -> Option<TimerKey> {
        self.heap.peek().map(|Reverse(key)| *key)
    }

    pub fn pop(&mut self) -> Option<TimerKey> {
        self.heap.pop().map(|Reverse(key)| key)
    }
}
