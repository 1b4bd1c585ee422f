//! Register-file-backed simulated device.
//!
//! This is the "no hardware queue" engine: `exec_buf` feeds the global
//! software scheduler and `exec_wait` blocks on its per-device completion
//! counter. Compute-unit control registers live in a shared register file
//! written on start and advanced on every read, so a started unit shows
//! busy for a configurable number of polls before reporting done.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::Command;
use crate::device::{DeviceId, DeviceOps};
use crate::error::{Result, SchedError};
use crate::soft::core::{AP_DONE, AP_IDLE, AP_START};
use crate::soft::scheduler::Scheduler;

/// Control-register base address for compute unit `index`.
pub fn cu_base(index: usize) -> u64 {
    0x0010_0000 + (index as u64) * 0x1000
}

#[derive(Clone, Copy)]
struct RegModel {
    value: u32,
    /// Remaining busy polls before a started unit reports done.
    countdown: u32,
}

impl Default for RegModel {
    fn default() -> Self {
        Self {
            value: AP_IDLE,
            countdown: 0,
        }
    }
}

/// Simulated accelerator device.
pub struct SoftDevice {
    id: DeviceId,
    busy_polls: u32,
    regs: Mutex<HashMap<u64, RegModel>>,
    scheduler: Mutex<Weak<Scheduler>>,
}

impl SoftDevice {
    /// `busy_polls` is how many register reads a started unit stays busy
    /// before its done bit appears; 0 completes on the first poll.
    pub fn new(id: DeviceId, busy_polls: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            busy_polls,
            regs: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(Weak::new()),
        })
    }

    /// Point the device at the global scheduler that executes its work.
    pub fn bind(&self, scheduler: &Arc<Scheduler>) {
        *self.scheduler.lock() = Arc::downgrade(scheduler);
    }

    fn sched(&self) -> Result<Arc<Scheduler>> {
        self.scheduler
            .lock()
            .upgrade()
            .ok_or_else(|| SchedError::Device("software scheduler not bound".into()))
    }
}

impl DeviceOps for SoftDevice {
    fn exec_buf(&self, cmd: &Arc<Command>) -> Result<()> {
        self.sched()?.add_command(cmd.clone())
    }

    fn exec_wait(&self, timeout: Duration) -> Result<usize> {
        self.sched()?.exec_wait(self.id, timeout)
    }

    fn read_register(&self, addr: u64) -> Result<u32> {
        let mut regs = self.regs.lock();
        let reg = regs.entry(addr).or_default();
        if reg.value & AP_START != 0 {
            if reg.countdown > 0 {
                reg.countdown -= 1;
            }
            if reg.countdown == 0 {
                reg.value = AP_DONE | AP_IDLE;
            }
        }
        let value = reg.value;
        // The done bit is clear-on-read.
        reg.value &= !AP_DONE;
        Ok(value)
    }

    fn write_register(&self, addr: u64, value: u32) -> Result<()> {
        let mut regs = self.regs.lock();
        let reg = regs.entry(addr).or_default();
        if value & AP_START != 0 {
            reg.value = AP_START;
            reg.countdown = self.busy_polls;
        } else {
            reg.value = value;
        }
        Ok(())
    }
}
