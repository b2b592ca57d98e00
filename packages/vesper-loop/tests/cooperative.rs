use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use vesper_loop::{
    ErrorSink, EventLoop, LoopError, LoopState, ManualClock, MicrotaskSink, TaskError,
};

fn test_loop() -> (Rc<EventLoop>, Rc<ManualClock>) {
    let clock = Rc::new(ManualClock::new());
    let ev = Rc::new(EventLoop::with_clock(clock.clone()));
    (ev, clock)
}

#[derive(Default)]
struct CollectingSink {
    errors: RefCell<Vec<LoopError>>,
}

impl ErrorSink for CollectingSink {
    fn report(&self, error: LoopError) {
        self.errors.borrow_mut().push(error);
    }
}

#[test]
fn tick_reports_pending_work() {
    let (ev, _clock) = test_loop();

    // Initially idle.
    assert!(ev.is_idle());
    assert!(!ev.tick());

    ev.enqueue_microtask(|| Ok(()));
    assert!(!ev.is_idle());

    // Tick drains it; nothing remains.
    assert!(!ev.tick());
    assert!(ev.is_idle());

    // A timer that is not due yet still counts as pending work.
    ev.set_timeout(Duration::from_millis(50), || Ok(()));
    assert!(ev.tick());
}

#[test]
fn stop_breaks_the_drive() {
    let (ev, _clock) = test_loop();
    let count = Rc::new(Cell::new(0u32));

    {
        let count = count.clone();
        ev.set_interval(Duration::from_millis(10), move || {
            count.set(count.get() + 1);
            Ok(())
        });
    }
    {
        let ev2 = ev.clone();
        ev.set_timeout(Duration::from_millis(55), move || {
            ev2.stop();
            Ok(())
        });
    }

    // Without the stop the interval would keep the loop alive forever.
    ev.run_until_idle();

    assert_eq!(ev.state(), LoopState::Stopped);
    assert_eq!(count.get(), 5);
}

#[test]
fn failing_task_does_not_stop_unrelated_work() {
    let clock = Rc::new(ManualClock::new());
    let sink = Rc::new(CollectingSink::default());
    let ev = Rc::new(EventLoop::with_parts(clock, sink.clone()));
    let log = Rc::new(RefCell::new(Vec::new()));

    ev.set_immediate(|| Err(TaskError::new("boom")));
    {
        let log = log.clone();
        ev.set_immediate(move || {
            log.borrow_mut().push("survivor");
            Ok(())
        });
    }

    ev.run_until_idle();

    assert_eq!(*log.borrow(), vec!["survivor"]);
    let errors = sink.errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], LoopError::Task(_)));
    assert_eq!(ev.stats().tasks_failed, 1);
}

#[test]
fn keep_alive_hold_defers_termination() {
    let (ev, _clock) = test_loop();

    let guard = ev.hold();
    assert!(!ev.is_idle());
    drop(guard);
    assert!(ev.is_idle());

    // A hold released by a callback lets the drive end naturally.
    let mut guard = Some(ev.hold());
    ev.set_timeout(Duration::from_millis(5), move || {
        guard.take();
        Ok(())
    });
    ev.run_until_idle();
    assert!(ev.is_idle());
}

#[test]
fn reentrant_tick_from_callback_is_noop() {
    let (ev, _clock) = test_loop();
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        let ev2 = ev.clone();
        ev.set_immediate(move || {
            log.borrow_mut().push("first");
            // Reentering the tick must not run the second immediate early
            // or double-run anything.
            ev2.tick();
            Ok(())
        });
    }
    {
        let log = log.clone();
        ev.set_immediate(move || {
            log.borrow_mut().push("second");
            Ok(())
        });
    }

    ev.tick();

    assert_eq!(*log.borrow(), vec!["first", "second"]);
    assert_eq!(ev.stats().ticks, 1);
}

#[test]
fn states_are_observable_from_callbacks() {
    let (ev, clock) = test_loop();
    let seen_immediate = Rc::new(Cell::new(None));
    let seen_timer = Rc::new(Cell::new(None));

    assert_eq!(ev.state(), LoopState::Idle);

    {
        let seen = seen_immediate.clone();
        let ev2 = ev.clone();
        ev.set_immediate(move || {
            seen.set(Some(ev2.state()));
            Ok(())
        });
    }
    {
        let seen = seen_timer.clone();
        let ev2 = ev.clone();
        ev.set_timeout(Duration::from_millis(1), move || {
            seen.set(Some(ev2.state()));
            Ok(())
        });
    }

    clock.advance(Duration::from_millis(1));
    ev.run_until_idle();

    assert_eq!(seen_immediate.get(), Some(LoopState::ImmediatePhase));
    assert_eq!(seen_timer.get(), Some(LoopState::TimerPhase));
    assert_eq!(ev.state(), LoopState::Stopped);
}

#[test]
fn stats_count_each_kind_of_work() {
    let (ev, clock) = test_loop();

    ev.set_immediate(|| Ok(()));
    ev.set_timeout(Duration::from_millis(1), || Ok(()));
    ev.enqueue_microtask(|| Ok(()));

    clock.advance(Duration::from_millis(1));
    ev.run_until_idle();

    let stats = ev.stats();
    assert_eq!(stats.immediates_fired, 1);
    assert_eq!(stats.timers_fired, 1);
    assert_eq!(stats.microtasks_run, 1);
    assert_eq!(stats.tasks_failed, 0);
    assert!(stats.ticks >= 1);
}

#[test]
fn microtask_sink_feeds_the_same_queue() {
    let (ev, _clock) = test_loop();
    let log = Rc::new(RefCell::new(Vec::new()));

    // The promise engine sees the loop only as a `MicrotaskSink`.
    let sink: Rc<dyn MicrotaskSink> = ev.clone();
    {
        let log = log.clone();
        sink.enqueue_microtask(Box::new(move || {
            log.borrow_mut().push("continuation");
            Ok(())
        }));
    }

    ev.tick();
    assert_eq!(*log.borrow(), vec!["continuation"]);
}
