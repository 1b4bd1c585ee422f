//! Process-wide scheduler context.
//!
//! Explicit owner of all shared mutable state: the (device, context) to
//! queue registry, the pool of detachable command managers, the per-device
//! wait multiplexers, the software scheduler handle and the last-fatal
//! slot. The registry and pool mutexes are distinct from every per-queue
//! lock so registry churn never blocks steady-state waits. Every access
//! checks the is-shutting-down flag before touching state that teardown
//! may be dropping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::config::SchedConfig;
use crate::device::{CtxId, Device, DeviceId};
use crate::error::{FatalSlot, Result, SchedError};
use crate::exec_wait::ExecWaitMux;
use crate::hwqueue::{HwQueue, QueueKey};
use crate::manager::CommandManager;
use crate::soft::Scheduler;

pub(crate) struct SchedContext {
    config: RwLock<SchedConfig>,
    queues: Mutex<HashMap<QueueKey, Weak<HwQueue>>>,
    muxes: Mutex<HashMap<DeviceId, Arc<ExecWaitMux>>>,
    /// Detached managers ready for reattachment.
    free_managers: SegQueue<Arc<CommandManager>>,
    /// Every manager ever created, for the final joins at shutdown.
    all_managers: Mutex<Vec<Arc<CommandManager>>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    fatal: Arc<FatalSlot>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

static CONTEXT: OnceLock<SchedContext> = OnceLock::new();

pub(crate) fn context() -> &'static SchedContext {
    CONTEXT.get_or_init(|| SchedContext {
        config: RwLock::new(SchedConfig::default()),
        queues: Mutex::new(HashMap::new()),
        muxes: Mutex::new(HashMap::new()),
        free_managers: SegQueue::new(),
        all_managers: Mutex::new(Vec::new()),
        scheduler: Mutex::new(None),
        fatal: Arc::new(FatalSlot::default()),
        started: AtomicBool::new(false),
        shutting_down: AtomicBool::new(false),
    })
}

impl SchedContext {
    pub(crate) fn start(&self, config: SchedConfig) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SchedError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.config.write() = config;
        self.fatal.clear();
        log::info!("command execution scheduler started");
        Ok(())
    }

    pub(crate) fn config(&self) -> SchedConfig {
        self.config.read().clone()
    }

    pub(crate) fn last_fatal(&self) -> Option<SchedError> {
        self.fatal.get()
    }

    pub(crate) fn fatal_slot(&self) -> Arc<FatalSlot> {
        self.fatal.clone()
    }

    /// Look up or construct the queue serving (device, ctx).
    ///
    /// A context with native queue support gets its own queue; every
    /// context without it collapses onto the device's single legacy queue.
    pub(crate) fn hw_queue(
        &self,
        device: &Arc<Device>,
        ctx: Option<CtxId>,
    ) -> Result<Arc<HwQueue>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SchedError::ShuttingDown);
        }
        let wait_slice = self.config.read().wait_slice();
        let mut queues = self.queues.lock();

        if let Some(c) = ctx {
            let key = QueueKey {
                device: device.id(),
                ctx: Some(c),
            };
            if let Some(q) = queues.get(&key).and_then(Weak::upgrade) {
                return Ok(q);
            }
            if let Some(native) = device.ops().create_queue(c) {
                log::debug!("opening native queue for device {} ctx {c}", device.id());
                let queue = HwQueue::new_native(key, device.clone(), native, wait_slice);
                queues.insert(key, Arc::downgrade(&queue));
                return Ok(queue);
            }
        }

        let key = QueueKey {
            device: device.id(),
            ctx: None,
        };
        if let Some(q) = queues.get(&key).and_then(Weak::upgrade) {
            return Ok(q);
        }
        log::debug!("opening legacy queue for device {}", device.id());
        let queue = HwQueue::new_legacy(key, device.clone(), self.mux(device.id()), wait_slice);
        queues.insert(key, Arc::downgrade(&queue));
        Ok(queue)
    }

    /// Drop the registry entry for a reclaimed queue.
    pub(crate) fn release_queue(&self, key: QueueKey) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let mut queues = self.queues.lock();
        if let Some(entry) = queues.get(&key) {
            if entry.strong_count() == 0 {
                queues.remove(&key);
            }
        }
    }

    /// The per-device arbiter for the blocking exec_wait primitive.
    pub(crate) fn mux(&self, device: DeviceId) -> Arc<ExecWaitMux> {
        self.muxes
            .lock()
            .entry(device)
            .or_insert_with(|| Arc::new(ExecWaitMux::new()))
            .clone()
    }

    /// Take a detached manager from the pool, or spawn a fresh one.
    pub(crate) fn acquire_manager(&self) -> Arc<CommandManager> {
        while let Some(manager) = self.free_managers.pop() {
            if !manager.is_stopped() {
                return manager;
            }
        }
        let manager =
            CommandManager::new(self.config.read().wait_slice(), self.fatal.clone());
        self.all_managers.lock().push(manager.clone());
        manager
    }

    /// Park a detached manager for reuse. Stopped managers are not pooled;
    /// they are joined by `stop()` through the all-managers list.
    pub(crate) fn release_manager(&self, manager: Arc<CommandManager>) {
        if self.shutting_down.load(Ordering::Acquire) || manager.is_stopped() {
            return;
        }
        self.free_managers.push(manager);
    }

    /// The lazily spawned global software scheduler.
    pub(crate) fn scheduler(&self) -> Arc<Scheduler> {
        let mut slot = self.scheduler.lock();
        if let Some(s) = slot.as_ref() {
            return s.clone();
        }
        let sched = Scheduler::new(&self.config.read(), self.fatal.clone());
        *slot = Some(sched.clone());
        sched
    }

    /// Deregister a device's queues and software core (device teardown).
    pub(crate) fn finish(&self, device: DeviceId) -> Result<()> {
        self.queues.lock().retain(|key, _| key.device != device);
        self.muxes.lock().remove(&device);
        if let Some(sched) = self.scheduler.lock().as_ref() {
            if let Err(e) = sched.remove_core(device) {
                log::warn!("finish({device}): {e}; dropping core anyway");
                sched.remove_core_forced(device);
            }
        }
        Ok(())
    }

    /// Best-effort teardown: wait up to the configured grace period for
    /// per-device state to clear, then forcibly drop it. Joining of all
    /// monitor threads happens here, on the caller's (non-monitor) thread.
    pub(crate) fn stop(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.shutting_down.store(true, Ordering::Release);

        let grace = self.config.read().shutdown_grace();
        let deadline = Instant::now() + grace;
        loop {
            let queues_live = self
                .queues
                .lock()
                .values()
                .any(|weak| weak.strong_count() > 0);
            let sched_busy = self
                .scheduler
                .lock()
                .as_ref()
                .map_or(false, |s| !s.idle());
            if !queues_live && !sched_busy {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("shutdown grace period expired with work outstanding");
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }

        self.queues.lock().clear();
        self.muxes.lock().clear();
        if let Some(sched) = self.scheduler.lock().take() {
            sched.stop();
        }
        while self.free_managers.pop().is_some() {}
        let managers = std::mem::take(&mut *self.all_managers.lock());
        for manager in managers {
            manager.stop();
        }

        self.shutting_down.store(false, Ordering::Release);
        self.started.store(false, Ordering::Release);
        log::info!("command execution scheduler stopped");
        Ok(())
    }
}

/// Serializes tests that touch the global manager pool or start/stop the
/// whole context, so parallel test threads do not observe each other's
/// pool churn.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());
