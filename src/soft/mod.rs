//! Software compute scheduler: a fully simulated execution engine used
//! when a device has no hardware queue.

pub mod core;
pub mod device;
pub mod scheduler;

pub use self::core::{ComputeUnit, ExecCore, AP_DONE, AP_IDLE, AP_START};
pub use self::device::{cu_base, SoftDevice};
pub use self::scheduler::Scheduler;

use std::sync::Arc;

use crate::device::{Device, DeviceId, DeviceOps};

/// Build a simulated device with `units` compute units, register its
/// execution core with the scheduler, and return the device handle.
pub fn open_simulated(
    scheduler: &Arc<Scheduler>,
    id: DeviceId,
    slots: usize,
    units: usize,
    busy_polls: u32,
) -> Arc<Device> {
    let ops = SoftDevice::new(id, busy_polls);
    ops.bind(scheduler);
    let device = Device::new(id, ops as Arc<dyn DeviceOps>);
    let bases: Vec<u64> = (0..units).map(cu_base).collect();
    scheduler.add_core(device.clone(), ExecCore::new(slots, &bases));
    device
}
