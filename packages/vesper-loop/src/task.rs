use crate::error::TaskError;

/// Outcome of one callback invocation. `Err` is how the host signals that
/// the script callback raised; the loop reports it and keeps going.
pub type TaskResult = Result<(), TaskError>;

/// A schedulable unit of work handed over by the host runtime. Timers and
/// immediates use `FnMut` because interval entries fire more than once.
pub type Task = Box<dyn FnMut() -> TaskResult>;

/// A promise-continuation callback. One-shot by construction.
pub type Microtask = Box<dyn FnOnce() -> TaskResult>;
