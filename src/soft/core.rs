//! Execution-core and compute-unit models for the software scheduler.
//!
//! An [`ExecCore`] mirrors one device's hardware submission queue: a
//! fixed-size slot table plus the device's compute units. A
//! [`ComputeUnit`] tracks the commands started on one unit and detects
//! completion by polling the unit's control register.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::command::{Command, MAX_UNITS};
use crate::device::Device;
use crate::error::{Result, SchedError};

/// Control-register bit: unit is executing.
pub const AP_START: u32 = 1 << 0;
/// Control-register bit: one execution finished (clear-on-read).
pub const AP_DONE: u32 = 1 << 1;
/// Control-register bit: unit is idle.
pub const AP_IDLE: u32 = 1 << 2;

/// Model of one compute unit.
pub struct ComputeUnit {
    index: usize,
    base: u64,
    /// Commands started on this unit, oldest first. Completion is strict
    /// FIFO: the unit may not finish command N+1 before command N.
    running: VecDeque<Arc<Command>>,
    /// Cached control-register value.
    ctrl: u32,
    started: u64,
    retired: u64,
    /// Completions observed on the register but not yet retired.
    done_pending: u64,
}

impl ComputeUnit {
    pub fn new(index: usize, base: u64) -> Self {
        Self {
            index,
            base,
            running: VecDeque::new(),
            ctrl: AP_IDLE,
            started: 0,
            retired: 0,
            done_pending: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Affinity test: may this command run here?
    pub fn matches(&self, cmd: &Command) -> bool {
        cmd.packet().cu_mask.test(self.index)
    }

    fn poll(&mut self, device: &Device) -> Result<()> {
        self.ctrl = device.ops().read_register(self.base)?;
        if self.ctrl & AP_DONE != 0 {
            self.ctrl &= !AP_DONE;
            self.done_pending += 1;
            if self.done_pending > self.running.len() as u64 {
                return Err(SchedError::InternalConsistency(format!(
                    "compute unit {} reported more completions than running commands",
                    self.index
                )));
            }
        }
        Ok(())
    }

    /// Whether the unit can accept a new start. A busy unit is polled
    /// first so a prior completion is harvested before the retest.
    pub fn ready(&mut self, device: &Device) -> Result<bool> {
        if self.ctrl & AP_START != 0 {
            self.poll(device)?;
        }
        Ok(self.ctrl & AP_START == 0)
    }

    /// Kick off execution of `cmd` on this unit.
    pub fn start(&mut self, device: &Device, cmd: Arc<Command>) -> Result<()> {
        device.ops().write_register(self.base, AP_START)?;
        self.ctrl |= AP_START;
        self.started += 1;
        self.running.push_back(cmd);
        Ok(())
    }

    /// Retire `cmd_id` if it is the FIFO head and a completion is pending.
    pub fn retire_if_done(&mut self, device: &Device, cmd_id: u64) -> Result<bool> {
        let head = match self.running.front() {
            Some(c) => c.id(),
            None => return Ok(false),
        };
        if head != cmd_id {
            return Ok(false);
        }
        if self.done_pending == 0 {
            self.poll(device)?;
        }
        if self.done_pending == 0 {
            return Ok(false);
        }
        self.done_pending -= 1;
        self.retired += 1;
        self.running.pop_front();
        Ok(true)
    }

    pub fn idle(&self) -> bool {
        self.running.is_empty()
    }

    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn retired(&self) -> u64 {
        self.retired
    }
}

/// Per-device software scheduler state: the submission-slot table and the
/// compute-unit pool.
pub struct ExecCore {
    /// Occupancy bitmask over `num_slots` submission slots.
    slot_mask: u64,
    num_slots: usize,
    units: Vec<ComputeUnit>,
}

impl ExecCore {
    pub fn new(num_slots: usize, cu_bases: &[u64]) -> Self {
        assert!(
            (1..=64).contains(&num_slots),
            "submission slot count must be in 1..=64"
        );
        assert!(cu_bases.len() <= MAX_UNITS, "too many compute units");
        Self {
            slot_mask: 0,
            num_slots,
            units: cu_bases
                .iter()
                .enumerate()
                .map(|(i, &base)| ComputeUnit::new(i, base))
                .collect(),
        }
    }

    /// First-fit slot acquisition, index order. No fairness beyond that.
    pub fn acquire_slot(&mut self) -> Option<usize> {
        for i in 0..self.num_slots {
            if self.slot_mask & (1 << i) == 0 {
                self.slot_mask |= 1 << i;
                return Some(i);
            }
        }
        None
    }

    pub fn release_slot(&mut self, slot: usize) {
        debug_assert!(self.slot_mask & (1 << slot) != 0, "slot not occupied");
        self.slot_mask &= !(1 << slot);
    }

    /// Find a unit whose affinity includes `cmd` and which is not busy.
    pub fn find_ready_unit(&mut self, device: &Device, cmd: &Command) -> Result<Option<usize>> {
        for unit in &mut self.units {
            if unit.matches(cmd) && unit.ready(device)? {
                return Ok(Some(unit.index()));
            }
        }
        Ok(None)
    }

    pub fn unit_mut(&mut self, index: usize) -> &mut ComputeUnit {
        &mut self.units[index]
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// No occupied slots and no command on any unit.
    pub fn idle(&self) -> bool {
        self.slot_mask == 0 && self.units.iter().all(ComputeUnit::idle)
    }
}
