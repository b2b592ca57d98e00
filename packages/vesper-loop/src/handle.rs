use std::time::{Duration, Instant};

use slotmap::{SlotMap, new_key_type};

use crate::task::Task;

new_key_type! {
    /// Opaque cancellation handle returned by every registration call.
    /// Slot index plus generation, so a handle kept past its entry's
    /// lifetime can never reach a newer entry that reused the slot.
    pub struct TaskHandle;
}

pub(crate) struct TimerSlot {
    /// Taken out for the duration of the callback's execution; restored
    /// when a recurring entry re-arms.
    callback: Option<Task>,
    due: Instant,
    period: Option<Duration>,
    /// Sequence of the live heap key for this slot. Heap keys carrying an
    /// older sequence are stale and get skipped.
    seq: u64,
}

/// Location descriptor for one live handle: which structure owns the entry
/// and what is needed to run or drop it.
pub(crate) enum TaskSlot {
    Timer(TimerSlot),
    Immediate { callback: Task },
}

/// Single source of truth for every live handle. Cancellation resolves
/// here in O(1); the timer heap and immediate queue are cleaned up lazily
/// when their entries surface.
pub(crate) struct HandleTable {
    slots: SlotMap<TaskHandle, TaskSlot>,
    live_timers: usize,
    live_immediates: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            live_timers: 0,
            live_immediates: 0,
        }
    }

    pub fn insert_timer(
        &mut self,
        callback: Task,
        due: Instant,
        period: Option<Duration>,
    ) -> TaskHandle {
        self.live_timers += 1;
        self.slots.insert(TaskSlot::Timer(TimerSlot {
            callback: Some(callback),
            due,
            period,
            seq: u64::MAX,
        }))
    }

    pub fn insert_immediate(&mut self, callback: Task) -> TaskHandle {
        self.live_immediates += 1;
        self.slots.insert(TaskSlot::Immediate { callback })
    }

    /// Record the heap key sequence under which the timer is armed.
    pub fn arm_timer(&mut self, handle: TaskHandle, seq: u64) {
        if let Some(TaskSlot::Timer(slot)) = self.slots.get_mut(handle) {
            slot.seq = seq;
        }
    }

    /// Idempotent cancel. Unknown, fired, and already-removed handles
    /// resolve to nothing and return `false`.
    pub fn remove(&mut self, handle: TaskHandle) -> bool {
        match self.slots.remove(handle) {
            Some(TaskSlot::Timer(_)) => {
                self.live_timers -= 1;
                true
            }
            Some(TaskSlot::Immediate { .. }) => {
                self.live_immediates -= 1;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.slots.contains_key(handle)
    }

    /// A heap key is current only while its handle resolves to a timer
    /// slot armed with the same sequence.
    pub fn is_armed(&self, handle: TaskHandle, seq: u64) -> bool {
        matches!(self.slots.get(handle), Some(TaskSlot::Timer(slot)) if slot.seq == seq)
    }

    /// Retire an immediate entry and hand its callback out, or nothing if
    /// the handle was cleared after being queued.
    pub fn take_immediate(&mut self, handle: TaskHandle) -> Option<Task> {
        if !matches!(self.slots.get(handle), Some(TaskSlot::Immediate { .. })) {
            return None;
        }
        let Some(TaskSlot::Immediate { callback }) = self.slots.remove(handle) else {
            return None;
        };
        self.live_immediates -= 1;
        Some(callback)
    }

    /// Begin firing a timer: take the callback out but keep the slot
    /// resolvable, so the callback can clear its own handle and a
    /// recurring entry can re-arm afterwards. Returns the callback, the
    /// period, and the due time the entry fired at.
    pub fn begin_timer_fire(
        &mut self,
        handle: TaskHandle,
    ) -> Option<(Task, Option<Duration>, Instant)> {
        match self.slots.get_mut(handle) {
            Some(TaskSlot::Timer(slot)) => slot
                .callback
                .take()
                .map(|task| (task, slot.period, slot.due)),
            _ => None,
        }
    }

    /// Restore a recurring entry after its callback ran and it was pushed
    /// back onto the heap.
    pub fn finish_timer_fire(&mut self, handle: TaskHandle, callback: Task, due: Instant, seq: u64) {
        if let Some(TaskSlot::Timer(slot)) = self.slots.get_mut(handle) {
            slot.callback = Some(callback);
            slot.due = due;
            slot.seq = seq;
        }
    }

    pub fn live_timers(&self) -> usize {
        self.live_timers
    }

    pub fn live_immediates(&self) -> usize {
        self.live_immediates
    }
}
