//! Accelerator command execution scheduler.
//!
//! Takes opaque units of work ([`Command`]) destined for a hardware
//! accelerator, submits them through one of several execution back ends,
//! tracks their lifecycle, and notifies callers of completion.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Caller (host API: kernels, buffers, contexts)             │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ managed_start / unmanaged_start / wait
//! ┌──────────────▼─────────────────────────────────────────────┐
//! │  HwQueue  (one per device+context, process-wide registry)  │
//! │   ├─ native back end: device-provided queue object         │
//! │   └─ legacy back end: exec_buf + shared exec_wait,         │
//! │      multiplexed through ExecWaitMux                       │
//! │  CommandManager (pooled monitor threads, callback path)    │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ exec_buf / exec_wait (no hardware queue)
//! ┌──────────────▼─────────────────────────────────────────────┐
//! │  Software compute scheduler: one global thread, per-device │
//! │  execution cores (submission slots + compute-unit models)  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Submission is thread-safe from arbitrarily many threads; blocking
//! waits are multiplexed so only one thread ever sits in the device's
//! blocking primitive. Timeouts are normal outcomes
//! ([`WaitOutcome::TimedOut`]), never errors.

use std::sync::Arc;
use std::time::Duration;

pub mod command;
pub mod config;
mod context;
pub mod device;
pub mod error;
pub mod exec_wait;
pub mod hwqueue;
pub mod manager;
pub mod soft;

pub use command::{Command, CommandState, CuMask, ExecPacket, NotifyFn, MAX_UNITS};
pub use config::SchedConfig;
pub use device::{
    CtxId, Device, DeviceId, DeviceOps, Fence, NativeQueueOps, PollState, SyncHandle, WaitOutcome,
};
pub use error::{Result, SchedError};
pub use exec_wait::{ExecWaitMux, MuxOutcome};
pub use hwqueue::{HwQueue, QueueCaps, QueueKey};
pub use manager::CommandManager;
pub use soft::{ExecCore, Scheduler, SoftDevice};

/// Initialize the scheduler with default configuration. Idempotent.
pub fn start() -> Result<()> {
    context::context().start(SchedConfig::default())
}

/// Initialize the scheduler with an explicit configuration. Idempotent;
/// a second call leaves the first configuration in place.
pub fn start_with_config(config: SchedConfig) -> Result<()> {
    context::context().start(config)
}

/// Tear the scheduler down: wait up to the configured grace period for
/// outstanding work to drain, then forcibly drop per-device state and
/// join every background thread. Safe to call from a single library
/// shutdown path; never from a monitor thread.
pub fn stop() -> Result<()> {
    context::context().stop()
}

/// Start a command under managed execution: its notification callback
/// fires from a monitor thread once the command reaches a terminal state.
pub fn managed_start(cmd: &Arc<Command>) -> Result<()> {
    let queue = context::context().hw_queue(cmd.device(), cmd.ctx())?;
    queue.managed_start(cmd)
}

/// Submit a command directly; the caller polls or waits for completion.
pub fn unmanaged_start(cmd: &Arc<Command>) -> Result<()> {
    let queue = context::context().hw_queue(cmd.device(), cmd.ctx())?;
    queue.unmanaged_start(cmd)
}

/// Wait for an unmanaged command. `None` blocks until the command reaches
/// a terminal state.
pub fn unmanaged_wait(cmd: &Arc<Command>, timeout: Option<Duration>) -> Result<WaitOutcome> {
    let queue = context::context().hw_queue(cmd.device(), cmd.ctx())?;
    queue.wait(cmd, timeout)
}

/// Device-wide "wait for anything to complete", multiplexed through the
/// device's shared blocking primitive. Returns the number of completions
/// the underlying call reported; 0 either means the timeout elapsed or
/// that another caller's wait already covered this epoch, so callers
/// re-check their commands' status either way.
pub fn exec_wait(device: &Arc<Device>, timeout: Duration) -> Result<usize> {
    let mux = context::context().mux(device.id());
    let ops = device.ops().clone();
    match mux.wait(Some(timeout), |t| ops.exec_wait(t.unwrap_or(timeout)))? {
        MuxOutcome::Drove(n) => Ok(n),
        MuxOutcome::Covered | MuxOutcome::TimedOut => Ok(0),
    }
}

/// Deregister a device's queues and software execution core. Used during
/// device teardown.
pub fn finish(device: &Arc<Device>) -> Result<()> {
    context::context().finish(device.id())
}

/// The most recent fatal error raised on a background scheduler thread,
/// if any. Such errors cannot be returned to any caller and are recorded
/// process-wide instead.
pub fn last_fatal() -> Option<SchedError> {
    context::context().last_fatal()
}

/// Create a simulated device executed by the global software scheduler.
/// Used when no hardware queue device is available.
pub fn simulated_device(
    id: DeviceId,
    slots: usize,
    units: usize,
    busy_polls: u32,
) -> Arc<Device> {
    let scheduler = context::context().scheduler();
    soft::open_simulated(&scheduler, id, slots, units, busy_polls)
}
