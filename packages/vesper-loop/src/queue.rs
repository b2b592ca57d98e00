use std::cell::RefCell;
use std::collections::VecDeque;

use crate::handle::TaskHandle;
use crate::task::Microtask;

/// FIFO of handles waiting for the next immediate phase. The callbacks
/// themselves live in the handle table, which keeps cancellation O(1) and
/// lets the queue hold plain copyable keys.
#[derive(Default)]
pub(crate) struct ImmediateQueue {
    queue: VecDeque<TaskHandle>,
}

impl ImmediateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: TaskHandle) {
        self.queue.push_back(handle);
    }

    pub fn pop_front(&mut self) -> Option<TaskHandle> {
        self.queue.pop_front()
    }
}

/// Promise-continuation queue. Single-threaded, so `RefCell<VecDeque>` is
/// all the synchronization there is. Entries carry no handle and cannot be
/// cancelled.
#[derive(Default)]
pub(crate) struct MicrotaskQueue {
    queue: RefCell<VecDeque<Microtask>>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Microtask) {
        self.queue.borrow_mut().push_back(task);
    }

    pub fn pop(&self) -> Option<Microtask> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}
