use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ErrorSink, LoopError, TracingSink};
use crate::handle::{HandleTable, TaskHandle};
use crate::queue::{ImmediateQueue, MicrotaskQueue};
use crate::task::{Microtask, Task, TaskResult};
use crate::timer::TimerHeap;

/// How long one park lasts while only external keep-alive holds remain and
/// there is no deadline to wait for.
const KEEP_ALIVE_SLICE: Duration = Duration::from_millis(1);

/// Phase the loop is currently in. `Stopped` is terminal for a
/// `run_until_idle` drive; it is reached on natural exhaustion of work or
/// an explicit `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    ImmediatePhase,
    TimerPhase,
    Stopped,
}

/// Counters a host can export for diagnostics.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub timers_fired: u64,
    pub immediates_fired: u64,
    pub microtasks_run: u64,
    pub tasks_failed: u64,
}

/// Keeps the loop alive while external asynchronous work the host drives
/// (I/O completions, worker results) is outstanding. Dropping the guard
/// releases the hold; once the last one is gone, natural exhaustion can
/// end the run.
pub struct KeepAlive {
    holds: Rc<Cell<usize>>,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.holds.set(self.holds.get() - 1);
    }
}

/// The scheduler context for one host runtime: created at bootstrap,
/// dropped at clean exit, never shared across threads. All methods take
/// `&self`, so callbacks holding an `Rc<EventLoop>` can register and
/// cancel work while the loop is running them.
pub struct EventLoop {
    table: RefCell<HandleTable>,
    timers: RefCell<TimerHeap>,
    immediates: RefCell<ImmediateQueue>,
    microtasks: MicrotaskQueue,
    clock: Rc<dyn Clock>,
    sink: Rc<dyn ErrorSink>,
    state: Cell<LoopState>,
    stop_requested: Cell<bool>,
    holds: Rc<Cell<usize>>,
    stats: RefCell<LoopStats>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_parts(Rc::new(MonotonicClock), Rc::new(TracingSink))
    }

    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Self::with_parts(clock, Rc::new(TracingSink))
    }

    pub fn with_parts(clock: Rc<dyn Clock>, sink: Rc<dyn ErrorSink>) -> Self {
        Self {
            table: RefCell::new(HandleTable::new()),
            timers: RefCell::new(TimerHeap::new()),
            immediates: RefCell::new(ImmediateQueue::new()),
            microtasks: MicrotaskQueue::new(),
            clock,
            sink,
            state: Cell::new(LoopState::Idle),
            stop_requested: Cell::new(false),
            holds: Rc::new(Cell::new(0)),
            stats: RefCell::new(LoopStats::default()),
        }
    }

    /// Schedule `task` to run once, `delay` after now. A zero delay fires
    /// on the next tick, never synchronously from inside this call.
    pub fn set_timeout<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnMut() -> TaskResult + 'static,
    {
        self.insert_timer(delay, None, Box::new(task))
    }

    /// Schedule `task` to run every `period`, first firing one `period`
    /// from now. The entry stays armed until cleared.
    pub fn set_interval<F>(&self, period: Duration, task: F) -> TaskHandle
    where
        F: FnMut() -> TaskResult + 'static,
    {
        self.insert_timer(period, Some(period), Box::new(task))
    }

    /// Schedule `task` for the next immediate phase, ahead of any timer
    /// due on that tick.
    pub fn set_immediate<F>(&self, task: F) -> TaskHandle
    where
        F: FnMut() -> TaskResult + 'static,
    {
        let handle = self.table.borrow_mut().insert_immediate(Box::new(task));
        self.immediates.borrow_mut().push(handle);
        tracing::trace!(?handle, "immediate registered");
        handle
    }

    fn insert_timer(&self, delay: Duration, period: Option<Duration>, task: Task) -> TaskHandle {
        let now = self.clock.now();
        let Some(due) = now.checked_add(delay) else {
            // A delay beyond the clock's range can never come due. Drop
            // the entry, report, and hand back a dead handle so clearing
            // it stays a defined no-op.
            self.sink.report(LoopError::Clock {
                reason: format!("delay of {delay:?} overflows the monotonic clock"),
            });
            let handle = self.table.borrow_mut().insert_timer(task, now, period);
            self.table.borrow_mut().remove(handle);
            return handle;
        };
        let handle = self.table.borrow_mut().insert_timer(task, due, period);
        let seq = self.timers.borrow_mut().push(due, handle);
        self.table.borrow_mut().arm_timer(handle, seq);
        tracing::trace!(?handle, ?delay, recurring = period.is_some(), "timer registered");
        handle
    }

    /// Cancel a pending timeout. Unknown, already-fired, and
    /// already-cleared handles are silently ignored.
    pub fn clear_timeout(&self, handle: TaskHandle) {
        self.clear(handle);
    }

    /// Cancel a recurring timer. Same no-op guarantees as
    /// [`clear_timeout`](Self::clear_timeout).
    pub fn clear_interval(&self, handle: TaskHandle) {
        self.clear(handle);
    }

    /// Cancel a queued immediate. Same no-op guarantees as
    /// [`clear_timeout`](Self::clear_timeout).
    pub fn clear_immediate(&self, handle: TaskHandle) {
        self.clear(handle);
    }

    fn clear(&self, handle: TaskHandle) {
        if self.table.borrow_mut().remove(handle) {
            tracing::trace!(?handle, "handle cleared");
        }
    }

    /// Queue a promise continuation. Continuations drain to exhaustion
    /// after every macrotask and once before the first one.
    pub fn enqueue_microtask<F>(&self, task: F)
    where
        F: FnOnce() -> TaskResult + 'static,
    {
        self.microtasks.push(Box::new(task));
    }

    /// Take a keep-alive hold on the loop for external asynchronous work.
    pub fn hold(&self) -> KeepAlive {
        self.holds.set(self.holds.get() + 1);
        KeepAlive {
            holds: Rc::clone(&self.holds),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.borrow().clone()
    }

    /// True when no timers, immediates, microtasks, or keep-alive holds
    /// remain.
    pub fn is_idle(&self) -> bool {
        !self.has_pending_work()
    }

    fn has_pending_work(&self) -> bool {
        let table = self.table.borrow();
        table.live_timers() > 0
            || table.live_immediates() > 0
            || !self.microtasks.is_empty()
            || self.holds.get() > 0
    }

    /// Earliest instant at which pending work becomes runnable: now if any
    /// immediate or microtask is queued, else the earliest live timer
    /// deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.table.borrow().live_immediates() > 0 || !self.microtasks.is_empty() {
            return Some(self.clock.now());
        }
        self.prune_timers();
        self.timers.borrow().peek().map(|key| key.due)
    }

    /// One pass of the tick algorithm: drain continuations queued since
    /// the last tick, run the immediate phase, then fire at most one due
    /// timer, draining continuations after every callback. Returns whether
    /// pending work remains. Calling `tick` from inside a running callback
    /// is a no-op.
    pub fn tick(&self) -> bool {
        match self.state.get() {
            LoopState::ImmediatePhase | LoopState::TimerPhase => {
                return self.has_pending_work();
            }
            LoopState::Idle | LoopState::Stopped => {}
        }
        let now = self.clock.now();
        self.stats.borrow_mut().ticks += 1;

        self.drain_microtasks();

        self.state.set(LoopState::ImmediatePhase);
        self.run_immediate_phase();

        self.state.set(LoopState::TimerPhase);
        self.run_timer_phase(now);

        self.state.set(LoopState::Idle);
        self.has_pending_work()
    }

    /// Drive the loop until no pending work of any kind remains or
    /// `stop()` is requested. Reentrant calls from inside a callback are
    /// no-ops.
    pub fn run_until_idle(&self) {
        if matches!(
            self.state.get(),
            LoopState::ImmediatePhase | LoopState::TimerPhase
        ) {
            return;
        }
        tracing::debug!("event loop running");
        self.stop_requested.set(false);
        self.state.set(LoopState::Idle);
        loop {
            if self.stop_requested.get() || !self.has_pending_work() {
                break;
            }
            self.tick();
            if self.stop_requested.get() || !self.has_pending_work() {
                break;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    if deadline > self.clock.now() {
                        self.clock.park_until(deadline);
                    }
                }
                // Only keep-alive holds remain: park briefly, then poll
                // for work the host handed over.
                None => {
                    self.clock.park_until(self.clock.now() + KEEP_ALIVE_SLICE);
                }
            }
        }
        self.state.set(LoopState::Stopped);
        tracing::debug!(stats = ?self.stats.borrow(), "event loop stopped");
    }

    /// Ask `run_until_idle` to return after the current tick. Safe to call
    /// from inside a callback.
    pub fn stop(&self) {
        self.stop_requested.set(true);
    }

    fn run_immediate_phase(&self) {
        // Snapshot the queue: immediates pushed while one runs belong to
        // the next tick's phase, so self-rescheduling immediates cannot
        // starve the timer phase.
        let batch: SmallVec<[TaskHandle; 8]> = {
            let mut queue = self.immediates.borrow_mut();
            std::iter::from_fn(|| queue.pop_front()).collect()
        };
        for handle in batch {
            let taken = self.table.borrow_mut().take_immediate(handle);
            let Some(mut task) = taken else {
                // Cleared between queueing and this phase.
                continue;
            };
            self.stats.borrow_mut().immediates_fired += 1;
            self.run_task(&mut task);
            self.drain_microtasks();
        }
    }

    fn run_timer_phase(&self, now: Instant) {
        self.prune_timers();
        let due = {
            let timers = self.timers.borrow();
            timers.peek().filter(|key| key.due <= now)
        };
        let Some(key) = due else {
            return;
        };
        self.timers.borrow_mut().pop();

        let begun = self.table.borrow_mut().begin_timer_fire(key.handle);
        let Some((mut task, period, fired_at)) = begun else {
            return;
        };
        if period.is_none() {
            // One-shot entries retire before the callback runs, so
            // clearing the handle from inside it is already a no-op.
            self.table.borrow_mut().remove(key.handle);
        }
        self.stats.borrow_mut().timers_fired += 1;
        self.run_task(&mut task);
        if let Some(period) = period {
            self.rearm(key.handle, fired_at, period, task);
        }
        self.drain_microtasks();
    }

    fn rearm(&self, handle: TaskHandle, fired_at: Instant, period: Duration, task: Task) {
        if !self.table.borrow().contains(handle) {
            // Cleared from inside its own callback.
            return;
        }
        // Next due time counts from the scheduled fire time, not from now,
        // so processing delay does not accumulate as drift.
        match fired_at.checked_add(period) {
            Some(due) => {
                // A due time already in the past fires once on an upcoming
                // tick; missed periods are not replayed.
                let due = due.max(self.clock.now());
                let seq = self.timers.borrow_mut().push(due, handle);
                self.table
                    .borrow_mut()
                    .finish_timer_fire(handle, task, due, seq);
            }
            None => {
                self.table.borrow_mut().remove(handle);
                self.sink.report(LoopError::Clock {
                    reason: format!("interval of {period:?} overflows the monotonic clock"),
                });
            }
        }
    }

    /// Drop heap keys whose handle was cleared or re-armed since they were
    /// pushed.
    fn prune_timers(&self) {
        let table = self.table.borrow();
        let mut timers = self.timers.borrow_mut();
        while let Some(key) = timers.peek() {
            if table.is_armed(key.handle, key.seq) {
                break;
            }
            timers.pop();
        }
    }

    fn run_task(&self, task: &mut Task) {
        if let Err(error) = task() {
            self.stats.borrow_mut().tasks_failed += 1;
            self.sink.report(LoopError::Task(error));
        }
    }

    fn drain_microtasks(&self) {
        // Continuations enqueued by a running continuation drain in the
        // same pass, so promise chains settle fully before the next
        // macrotask.
        while let Some(task) = self.microtasks.pop() {
            self.stats.borrow_mut().microtasks_run += 1;
            if let Err(error) = task() {
                self.stats.borrow_mut().tasks_failed += 1;
                self.sink.report(LoopError::Task(error));
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::MicrotaskSink for EventLoop {
    fn enqueue_microtask(&self, task: Microtask) {
        self.microtasks.push(task);
    }
}
