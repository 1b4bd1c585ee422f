//! External interfaces consumed from the device/driver and context layers.
//!
//! The scheduler never talks to hardware directly; it goes through
//! [`DeviceOps`] (raw register/DMA primitives used by the legacy back end)
//! and [`NativeQueueOps`] (a device-provided queue object, when the device
//! supports one per execution context).

use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, ExecPacket};
use crate::error::Result;

pub type DeviceId = u32;
pub type CtxId = u32;

/// Low-level synchronization-object handle, resolved from a [`Fence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHandle(pub u64);

/// Cross-command synchronization object.
///
/// Owned by the context/object layer; the scheduler only resolves it to the
/// low-level handle a native queue understands.
#[derive(Debug)]
pub struct Fence {
    id: u64,
    handle: SyncHandle,
}

impl Fence {
    pub fn new(id: u64, handle: SyncHandle) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resolve(&self) -> SyncHandle {
        self.handle
    }
}

/// Result of a non-blocking completion poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Completion may have occurred; the caller must check command status.
    CheckStatus,
    /// The command is definitely not finished.
    NotReady,
    /// The back end cannot poll.
    Unsupported,
}

/// Result of a bounded or unbounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

/// Device-provided queue object for contexts with native queue support.
pub trait NativeQueueOps: Send + Sync {
    fn submit_command(&self, cmd: &Arc<Command>) -> Result<()>;

    /// Block until the command reaches a terminal state or the timeout
    /// elapses. Returns `false` on timeout. `None` waits unbounded.
    fn wait_command(&self, cmd: &Arc<Command>, timeout: Option<Duration>) -> Result<bool>;

    fn poll_command(&self, cmd: &Arc<Command>) -> Result<PollState>;

    /// Enqueue a hardware-level dependency edge: execution waits for the
    /// synchronization object before subsequent commands run.
    fn submit_wait(&self, sync: SyncHandle) -> Result<()>;

    /// Enqueue a signal of the synchronization object.
    fn submit_signal(&self, sync: SyncHandle) -> Result<()>;

    /// Whether the queue can deliver asynchronous completion callbacks
    /// (required for managed execution).
    fn supports_callbacks(&self) -> bool {
        true
    }
}

/// Raw device/driver primitives.
pub trait DeviceOps: Send + Sync {
    /// Open a native queue for the context, or `None` when the device has
    /// no native queue support and must fall back to the legacy path.
    fn create_queue(&self, _ctx: CtxId) -> Option<Arc<dyn NativeQueueOps>> {
        None
    }

    /// Raw DMA submission of the command buffer (legacy path).
    fn exec_buf(&self, cmd: &Arc<Command>) -> Result<()>;

    /// Block until any command on the device completes, bounded by the
    /// timeout. Returns the number of newly completed commands (0 on
    /// timeout). Only one thread may be inside this call at a time; the
    /// legacy back end multiplexes callers through
    /// [`crate::exec_wait::ExecWaitMux`].
    fn exec_wait(&self, timeout: Duration) -> Result<usize>;

    /// Read a device register (compute-unit control registers).
    fn read_register(&self, addr: u64) -> Result<u32>;

    /// Write a device register.
    fn write_register(&self, addr: u64, value: u32) -> Result<()>;
}

/// An accelerator device handle: identity plus its driver entry points.
pub struct Device {
    id: DeviceId,
    ops: Arc<dyn DeviceOps>,
}

impl Device {
    pub fn new(id: DeviceId, ops: Arc<dyn DeviceOps>) -> Arc<Self> {
        Arc::new(Self { id, ops })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn ops(&self) -> &Arc<dyn DeviceOps> {
        &self.ops
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("id", &self.id).finish()
    }
}

#[allow(unused)]
#[cfg(test)]
pub(crate) mod testutil {
    //! Fake devices shared across module tests.

    use super::*;
    use crate::command::CommandState;
    use parking_lot::{Condvar, Mutex};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Device whose primitives all succeed without doing anything.
    pub struct NullOps;

    impl DeviceOps for NullOps {
        fn exec_buf(&self, _cmd: &Arc<Command>) -> Result<()> {
            Ok(())
        }

        fn exec_wait(&self, timeout: Duration) -> Result<usize> {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            Ok(0)
        }

        fn read_register(&self, _addr: u64) -> Result<u32> {
            Ok(0)
        }

        fn write_register(&self, _addr: u64, _value: u32) -> Result<()> {
            Ok(())
        }
    }

    pub fn null_device(id: DeviceId) -> Arc<Device> {
        Device::new(id, Arc::new(NullOps))
    }

    /// Legacy-path device whose completions are driven by the test.
    ///
    /// `exec_buf` records the submission (or fails once when armed);
    /// `complete` marks a command done and wakes `exec_wait` callers.
    #[derive(Default)]
    pub struct ManualOps {
        submitted: Mutex<Vec<u64>>,
        fail_next_submit: AtomicBool,
        completions: Mutex<u64>,
        cond: Condvar,
        pub exec_wait_calls: AtomicUsize,
    }

    impl ManualOps {
        pub fn arm_submit_failure(&self) {
            self.fail_next_submit.store(true, Ordering::SeqCst);
        }

        pub fn submitted_ids(&self) -> Vec<u64> {
            self.submitted.lock().clone()
        }

        pub fn complete(&self, cmd: &Command, state: CommandState) {
            cmd.set_state(state);
            let mut n = self.completions.lock();
            *n += 1;
            self.cond.notify_all();
        }
    }

    impl DeviceOps for ManualOps {
        fn exec_buf(&self, cmd: &Arc<Command>) -> Result<()> {
            if self.fail_next_submit.swap(false, Ordering::SeqCst) {
                return Err(crate::error::SchedError::Submit(
                    "injected submission failure".into(),
                ));
            }
            self.submitted.lock().push(cmd.id());
            Ok(())
        }

        fn exec_wait(&self, timeout: Duration) -> Result<usize> {
            self.exec_wait_calls.fetch_add(1, Ordering::SeqCst);
            let mut n = self.completions.lock();
            let seen = *n;
            self.cond.wait_for(&mut n, timeout);
            Ok((*n - seen) as usize)
        }

        fn read_register(&self, _addr: u64) -> Result<u32> {
            Ok(0)
        }

        fn write_register(&self, _addr: u64, _value: u32) -> Result<()> {
            Ok(())
        }
    }

    pub fn manual_device(id: DeviceId) -> (Arc<Device>, Arc<ManualOps>) {
        let ops = Arc::new(ManualOps::default());
        (
            Device::new(
                id,
                ops.clone() as Arc<dyn DeviceOps>,
            ),
            ops,
        )
    }

    /// Native queue fake: waits block on the command's own status word.
    pub struct FakeNativeQueue {
        submitted: Mutex<Vec<u64>>,
        fences: Mutex<Vec<(SyncHandle, bool)>>,
        state: Mutex<()>,
        cond: Condvar,
        callbacks: bool,
    }

    impl FakeNativeQueue {
        pub fn new(callbacks: bool) -> Arc<Self> {
            Arc::new(Self {
                submitted: Mutex::new(Vec::new()),
                fences: Mutex::new(Vec::new()),
                state: Mutex::new(()),
                cond: Condvar::new(),
                callbacks,
            })
        }

        pub fn submitted_ids(&self) -> Vec<u64> {
            self.submitted.lock().clone()
        }

        pub fn fences(&self) -> Vec<(SyncHandle, bool)> {
            self.fences.lock().clone()
        }

        pub fn complete(&self, cmd: &Command, state: CommandState) {
            cmd.set_state(state);
            let _g = self.state.lock();
            self.cond.notify_all();
        }
    }

    impl NativeQueueOps for FakeNativeQueue {
        fn submit_command(&self, cmd: &Arc<Command>) -> Result<()> {
            self.submitted.lock().push(cmd.id());
            Ok(())
        }

        fn wait_command(&self, cmd: &Arc<Command>, timeout: Option<Duration>) -> Result<bool> {
            let deadline = timeout.map(|t| std::time::Instant::now() + t);
            let mut g = self.state.lock();
            loop {
                if cmd.state().is_terminal() {
                    return Ok(true);
                }
                match deadline {
                    Some(d) => {
                        let now = std::time::Instant::now();
                        if now >= d {
                            return Ok(false);
                        }
                        self.cond.wait_for(&mut g, d - now);
                    }
                    None => self.cond.wait(&mut g),
                }
            }
        }

        fn poll_command(&self, cmd: &Arc<Command>) -> Result<PollState> {
            if cmd.state().is_terminal() {
                Ok(PollState::CheckStatus)
            } else {
                Ok(PollState::NotReady)
            }
        }

        fn submit_wait(&self, sync: SyncHandle) -> Result<()> {
            self.fences.lock().push((sync, false));
            Ok(())
        }

        fn submit_signal(&self, sync: SyncHandle) -> Result<()> {
            self.fences.lock().push((sync, true));
            Ok(())
        }

        fn supports_callbacks(&self) -> bool {
            self.callbacks
        }
    }

    /// Device that hands out one shared [`FakeNativeQueue`] per context.
    pub struct NativeOps {
        pub queue: Arc<FakeNativeQueue>,
    }

    impl DeviceOps for NativeOps {
        fn create_queue(&self, _ctx: CtxId) -> Option<Arc<dyn NativeQueueOps>> {
            Some(self.queue.clone())
        }

        fn exec_buf(&self, _cmd: &Arc<Command>) -> Result<()> {
            Ok(())
        }

        fn exec_wait(&self, timeout: Duration) -> Result<usize> {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            Ok(0)
        }

        fn read_register(&self, _addr: u64) -> Result<u32> {
            Ok(0)
        }

        fn write_register(&self, _addr: u64, _value: u32) -> Result<()> {
            Ok(())
        }
    }

    pub fn native_device(id: DeviceId, callbacks: bool) -> (Arc<Device>, Arc<FakeNativeQueue>) {
        let queue = FakeNativeQueue::new(callbacks);
        let dev = Device::new(
            id,
            Arc::new(NativeOps {
                queue: queue.clone(),
            }) as Arc<dyn DeviceOps>,
        );
        (dev, queue)
    }
}
