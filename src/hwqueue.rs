//! Hardware queue abstraction.
//!
//! One [`HwQueue`] exists per (device, execution-context) pair, looked up
//! through the process-wide registry in [`crate::context`]. Two back ends
//! implement the same capability surface: a *native* back end delegating
//! to a device-provided queue object, and a *legacy* back end that submits
//! through raw `exec_buf` and funnels every wait through the per-device
//! [`ExecWaitMux`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::command::{Command, CommandState};
use crate::device::{CtxId, Device, DeviceId, Fence, NativeQueueOps, PollState, WaitOutcome};
use crate::error::{Result, SchedError};
use crate::exec_wait::ExecWaitMux;
use crate::manager::CommandManager;

bitflags! {
    /// What a queue back end can do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueCaps: u32 {
        /// True non-blocking completion polling.
        const POLL = 1 << 0;
        /// Asynchronous callback delivery (managed execution).
        const MANAGED = 1 << 1;
        /// Hardware-level dependency edges (`submit_wait`/`submit_signal`).
        const DEPENDENCY = 1 << 2;
    }
}

/// Registry key for a queue: the (device, context) pair it serves. A
/// `None` context is the per-device legacy queue all contexts without
/// native queue support collapse onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub device: DeviceId,
    pub ctx: Option<CtxId>,
}

enum Backend {
    Native { queue: Arc<dyn NativeQueueOps> },
    Legacy { mux: Arc<ExecWaitMux> },
}

/// Per-(device, context) submission and wait object.
pub struct HwQueue {
    key: QueueKey,
    device: Arc<Device>,
    backend: Backend,
    /// Lazily attached on the first managed submission.
    manager: Mutex<Option<Arc<CommandManager>>>,
    wait_slice: Duration,
}

impl HwQueue {
    pub(crate) fn new_native(
        key: QueueKey,
        device: Arc<Device>,
        queue: Arc<dyn NativeQueueOps>,
        wait_slice: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            device,
            backend: Backend::Native { queue },
            manager: Mutex::new(None),
            wait_slice,
        })
    }

    pub(crate) fn new_legacy(
        key: QueueKey,
        device: Arc<Device>,
        mux: Arc<ExecWaitMux>,
        wait_slice: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            device,
            backend: Backend::Legacy { mux },
            manager: Mutex::new(None),
            wait_slice,
        })
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn caps(&self) -> QueueCaps {
        match &self.backend {
            Backend::Native { queue } => {
                let mut caps = QueueCaps::POLL | QueueCaps::DEPENDENCY;
                if queue.supports_callbacks() {
                    caps |= QueueCaps::MANAGED;
                }
                caps
            }
            Backend::Legacy { .. } => QueueCaps::MANAGED,
        }
    }

    /// Enqueue the command for execution.
    pub fn submit(&self, cmd: &Arc<Command>) -> Result<()> {
        match &self.backend {
            Backend::Native { queue } => queue.submit_command(cmd),
            Backend::Legacy { .. } => self.device.ops().exec_buf(cmd),
        }
    }

    /// Block until the command reaches a terminal state or the timeout
    /// elapses. `None` waits unbounded.
    pub fn wait(&self, cmd: &Arc<Command>, timeout: Option<Duration>) -> Result<WaitOutcome> {
        match &self.backend {
            Backend::Native { queue } => {
                if queue.wait_command(cmd, timeout)? {
                    Ok(WaitOutcome::Completed)
                } else {
                    Ok(WaitOutcome::TimedOut)
                }
            }
            Backend::Legacy { mux } => {
                // Completion is observed as a side effect of the shared
                // exec_wait primitive; unbounded waits loop with a fixed
                // sub-timeout.
                let deadline = timeout.map(|t| Instant::now() + t);
                loop {
                    if cmd.state().is_terminal() {
                        return Ok(WaitOutcome::Completed);
                    }
                    let slice = match deadline {
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                return Ok(WaitOutcome::TimedOut);
                            }
                            (d - now).min(self.wait_slice)
                        }
                        None => self.wait_slice,
                    };
                    let ops = self.device.ops().clone();
                    mux.wait(Some(slice), |t| ops.exec_wait(t.unwrap_or(slice)))?;
                }
            }
        }
    }

    /// Non-blocking completion check.
    pub fn poll(&self, cmd: &Arc<Command>) -> Result<PollState> {
        match &self.backend {
            Backend::Native { queue } => queue.poll_command(cmd),
            // The legacy back end cannot poll; completion shows up on the
            // status packet as a side effect of somebody's exec_wait.
            Backend::Legacy { .. } => Ok(PollState::CheckStatus),
        }
    }

    /// One bounded pass through the back end's wait primitive, used by the
    /// command monitor. Returns without waiting when there is nothing
    /// running yet.
    pub(crate) fn monitor_wait(&self, head: Option<&Arc<Command>>) -> Result<()> {
        match &self.backend {
            Backend::Native { queue } => {
                if let Some(cmd) = head {
                    let _ = queue.wait_command(cmd, Some(self.wait_slice))?;
                }
                Ok(())
            }
            Backend::Legacy { mux } => {
                if head.is_none() {
                    return Ok(());
                }
                let ops = self.device.ops().clone();
                let slice = self.wait_slice;
                mux.wait(Some(slice), |t| ops.exec_wait(t.unwrap_or(slice)))?;
                Ok(())
            }
        }
    }

    /// Start the command under managed execution: completion will be
    /// delivered through its notification callback by the monitor thread.
    pub fn managed_start(self: &Arc<Self>, cmd: &Arc<Command>) -> Result<()> {
        if !self.caps().contains(QueueCaps::MANAGED) {
            return Err(SchedError::Unsupported(
                "queue back end cannot deliver asynchronous completion callbacks",
            ));
        }
        let manager = self.manager();
        manager.launch(self, cmd)
    }

    /// Submit directly; the caller polls or waits for completion.
    pub fn unmanaged_start(&self, cmd: &Arc<Command>) -> Result<()> {
        cmd.set_state(CommandState::Submitted);
        if let Err(e) = self.submit(cmd) {
            cmd.set_state(CommandState::New);
            return Err(e);
        }
        Ok(())
    }

    /// Enqueue a dependency wait on the synchronization object.
    pub fn submit_wait(&self, fence: &Fence) -> Result<()> {
        match &self.backend {
            Backend::Native { queue } => queue.submit_wait(fence.resolve()),
            Backend::Legacy { .. } => Err(SchedError::Unsupported(
                "legacy queues cannot encode dependency waits",
            )),
        }
    }

    /// Enqueue a signal of the synchronization object.
    pub fn submit_signal(&self, fence: &Fence) -> Result<()> {
        match &self.backend {
            Backend::Native { queue } => queue.submit_signal(fence.resolve()),
            Backend::Legacy { .. } => Err(SchedError::Unsupported(
                "legacy queues cannot signal synchronization objects",
            )),
        }
    }

    fn manager(self: &Arc<Self>) -> Arc<CommandManager> {
        let mut slot = self.manager.lock();
        if let Some(m) = slot.as_ref() {
            return m.clone();
        }
        let manager = crate::context::context().acquire_manager();
        manager.attach(self);
        *slot = Some(manager.clone());
        manager
    }
}

impl Drop for HwQueue {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.get_mut().take() {
            manager.detach();
            crate::context::context().release_manager(manager);
        }
        crate::context::context().release_queue(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::{manual_device, native_device};
    use crate::device::SyncHandle;
    use crate::command::{CuMask, ExecPacket};
    use std::thread;

    fn cmd_on(device: &Arc<Device>) -> Arc<Command> {
        Command::new(
            device.clone(),
            None,
            ExecPacket::new(0, CuMask::all(), 0),
        )
    }

    fn slice() -> Duration {
        Duration::from_millis(20)
    }

    #[test]
    fn test_native_queue_caps_and_poll() {
        let (device, queue) = native_device(10, true);
        let key = QueueKey {
            device: 10,
            ctx: Some(0),
        };
        let nq = device.ops().create_queue(0).unwrap();
        let hwq = HwQueue::new_native(key, device.clone(), nq, slice());

        assert!(hwq.caps().contains(QueueCaps::POLL | QueueCaps::DEPENDENCY));

        let cmd = cmd_on(&device);
        hwq.unmanaged_start(&cmd).unwrap();
        assert_eq!(queue.submitted_ids(), vec![cmd.id()]);
        assert_eq!(hwq.poll(&cmd).unwrap(), PollState::NotReady);

        queue.complete(&cmd, CommandState::Completed);
        assert_eq!(hwq.poll(&cmd).unwrap(), PollState::CheckStatus);
        assert_eq!(
            hwq.wait(&cmd, Some(Duration::from_millis(10))).unwrap(),
            WaitOutcome::Completed
        );
    }

    #[test]
    fn test_native_dependency_edges() {
        let (device, queue) = native_device(11, true);
        let nq = device.ops().create_queue(0).unwrap();
        let hwq = HwQueue::new_native(
            QueueKey {
                device: 11,
                ctx: Some(0),
            },
            device,
            nq,
            slice(),
        );

        let fence = Fence::new(1, SyncHandle(0xf00));
        hwq.submit_wait(&fence).unwrap();
        hwq.submit_signal(&fence).unwrap();
        assert_eq!(
            queue.fences(),
            vec![(SyncHandle(0xf00), false), (SyncHandle(0xf00), true)]
        );
    }

    #[test]
    fn test_native_without_callbacks_refuses_managed() {
        let (device, _queue) = native_device(12, false);
        let nq = device.ops().create_queue(0).unwrap();
        let hwq = HwQueue::new_native(
            QueueKey {
                device: 12,
                ctx: Some(0),
            },
            device.clone(),
            nq,
            slice(),
        );

        let cmd = cmd_on(&device);
        assert!(matches!(
            hwq.managed_start(&cmd),
            Err(SchedError::Unsupported(_))
        ));
        // No partial state change.
        assert_eq!(cmd.state(), CommandState::New);
    }

    #[test]
    fn test_legacy_caps_poll_and_dependencies() {
        let (device, _ops) = manual_device(13);
        let hwq = HwQueue::new_legacy(
            QueueKey {
                device: 13,
                ctx: None,
            },
            device.clone(),
            Arc::new(ExecWaitMux::new()),
            slice(),
        );

        assert_eq!(hwq.caps(), QueueCaps::MANAGED);
        let cmd = cmd_on(&device);
        assert_eq!(hwq.poll(&cmd).unwrap(), PollState::CheckStatus);

        let fence = Fence::new(2, SyncHandle(1));
        assert!(matches!(
            hwq.submit_wait(&fence),
            Err(SchedError::Unsupported(_))
        ));
        assert!(matches!(
            hwq.submit_signal(&fence),
            Err(SchedError::Unsupported(_))
        ));
    }

    #[test]
    fn test_legacy_wait_timeout_then_completion() {
        let (device, ops) = manual_device(14);
        let hwq = HwQueue::new_legacy(
            QueueKey {
                device: 14,
                ctx: None,
            },
            device.clone(),
            Arc::new(ExecWaitMux::new()),
            slice(),
        );

        let cmd = cmd_on(&device);
        hwq.unmanaged_start(&cmd).unwrap();
        assert_eq!(ops.submitted_ids(), vec![cmd.id()]);

        // Timeout is a normal outcome, not an error, with no side effects
        // on command state.
        assert_eq!(
            hwq.wait(&cmd, Some(Duration::from_millis(30))).unwrap(),
            WaitOutcome::TimedOut
        );
        assert_eq!(cmd.state(), CommandState::Submitted);

        let c = cmd.clone();
        let o = ops.clone();
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            o.complete(&c, CommandState::Completed);
        });

        assert_eq!(hwq.wait(&cmd, None).unwrap(), WaitOutcome::Completed);
        completer.join().unwrap();
    }

    #[test]
    fn test_unmanaged_start_rolls_back_on_submit_failure() {
        let (device, ops) = manual_device(15);
        let hwq = HwQueue::new_legacy(
            QueueKey {
                device: 15,
                ctx: None,
            },
            device.clone(),
            Arc::new(ExecWaitMux::new()),
            slice(),
        );

        let cmd = cmd_on(&device);
        ops.arm_submit_failure();
        assert!(matches!(
            hwq.unmanaged_start(&cmd),
            Err(SchedError::Submit(_))
        ));
        assert_eq!(cmd.state(), CommandState::New);

        hwq.unmanaged_start(&cmd).unwrap();
        assert_eq!(ops.submitted_ids(), vec![cmd.id()]);
    }
}
