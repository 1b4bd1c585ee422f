//! Scheduler error taxonomy.
//!
//! Timeouts are deliberately not represented here; a bounded wait that
//! elapses returns [`crate::WaitOutcome::TimedOut`] and leaves no side
//! effects on command state.

use parking_lot::Mutex;
use thiserror::Error;

/// Errors surfaced by the command execution scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedError {
    /// The hardware or the native queue rejected a submission. Manager
    /// bookkeeping for the command has been rolled back.
    #[error("command submission failed: {0}")]
    Submit(String),

    /// The selected queue back end cannot perform the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A monitor thread died. The owning manager remains allocated but
    /// will never deliver another notification.
    #[error("command monitor failed: {0}")]
    MonitorFatal(String),

    /// A state-machine invariant was violated (for example a compute unit
    /// reporting more completions than starts, or scheduler shutdown with
    /// commands still queued).
    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),

    /// The device/driver layer reported a failure.
    #[error("device error: {0}")]
    Device(String),

    /// The process-wide scheduler context is being torn down.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// No hardware queue could be opened for the device/context pair.
    #[error("no execution queue for device {0}")]
    NoQueue(u32),

    /// Configuration file could not be read or parsed.
    #[error("bad configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;

/// Process-wide slot for fatal errors raised on background threads.
///
/// Monitor and scheduler threads have no caller to return to, so their
/// fatal errors are recorded here and exposed through
/// [`crate::last_fatal`]. The slot keeps the most recent error.
#[derive(Default)]
pub struct FatalSlot {
    slot: Mutex<Option<SchedError>>,
}

impl FatalSlot {
    pub fn record(&self, err: SchedError) {
        log::error!("fatal scheduler error: {err}");
        *self.slot.lock() = Some(err);
    }

    pub fn get(&self) -> Option<SchedError> {
        self.slot.lock().clone()
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}
