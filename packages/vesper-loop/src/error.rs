use thiserror::Error;

/// Failure raised by a script callback. The host builds this from whatever
/// exception value the script threw; the scheduler only carries it to the
/// error sink.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Everything the loop can report to the host. None of these stop the
/// loop: a failing callback never takes unrelated scheduled work down
/// with it.
#[derive(Debug, Error)]
pub enum LoopError {
    /// A callback raised. Remaining work proceeds on the next phase.
    #[error("uncaught error in scheduled task: {0}")]
    Task(#[from] TaskError),

    /// The monotonic clock could not produce a valid due time. The entry
    /// involved is dropped rather than retried forever.
    #[error("clock anomaly: {reason}")]
    Clock { reason: String },
}

/// Where uncaught failures go. The host typically routes these to its
/// console or an `uncaughtException`-style handler.
pub trait ErrorSink {
    fn report(&self, error: LoopError);
}

/// Default sink: forward everything to `tracing`.
#[derive(Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, error: LoopError) {
        tracing::error!("{error}");
    }
}
