//! Command objects and their hardware-visible status packets.
//!
//! A [`Command`] is an opaque unit of work destined for an accelerator.
//! Everything downstream of construction handles it through an
//! `Arc<Command>`; the notification callback may be the last reference
//! holder, so destruction from a monitor thread must be (and is) safe.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{CtxId, Device};

/// Maximum number of compute units a device can expose. Affinity masks are
/// fixed-width bitsets indexed by compute-unit id.
pub const MAX_UNITS: usize = 128;

const MASK_WORDS: usize = MAX_UNITS / 64;

/// Compute-unit affinity bitset.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CuMask {
    bits: [u64; MASK_WORDS],
}

impl CuMask {
    /// Mask matching every compute unit.
    pub fn all() -> Self {
        Self {
            bits: [u64::MAX; MASK_WORDS],
        }
    }

    pub fn from_units(units: &[usize]) -> Self {
        let mut mask = Self::default();
        for &u in units {
            mask.set(u);
        }
        mask
    }

    pub fn set(&mut self, unit: usize) {
        assert!(unit < MAX_UNITS, "compute unit index out of range");
        self.bits[unit / 64] |= 1 << (unit % 64);
    }

    pub fn test(&self, unit: usize) -> bool {
        unit < MAX_UNITS && self.bits[unit / 64] & (1 << (unit % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }
}

impl std::fmt::Debug for CuMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CuMask[{:#018x}{:016x}]", self.bits[1], self.bits[0])
    }
}

/// Command execution state as written to the status packet.
///
/// Values are ordered; any state `>= Completed` is terminal.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandState {
    New = 0,
    Queued = 1,
    Submitted = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Aborted = 6,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        self >= CommandState::Completed
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => CommandState::New,
            1 => CommandState::Queued,
            2 => CommandState::Submitted,
            3 => CommandState::Running,
            4 => CommandState::Completed,
            5 => CommandState::Error,
            _ => CommandState::Aborted,
        }
    }
}

/// Hardware-resident status packet.
///
/// The execution-state word is shared between application threads, monitor
/// threads and the software scheduler thread; the remaining fields are the
/// only addressing information the scheduler reads.
#[derive(Debug)]
pub struct ExecPacket {
    state: AtomicU32,
    /// Which compute units may run this command.
    pub cu_mask: CuMask,
    /// Operation selector, opaque to the scheduler.
    pub opcode: u32,
    /// Device address of the command's argument register map.
    pub regmap: u64,
}

impl ExecPacket {
    pub fn new(opcode: u32, cu_mask: CuMask, regmap: u64) -> Self {
        Self {
            state: AtomicU32::new(CommandState::New as u32),
            cu_mask,
            opcode,
            regmap,
        }
    }

    pub fn state(&self) -> CommandState {
        CommandState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: CommandState) {
        self.state.store(state as u32, Ordering::Release);
    }
}

/// Notification entry point invoked once the command reaches a terminal
/// state under managed execution.
pub type NotifyFn = Box<dyn FnOnce(&Command) + Send>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of work submitted for accelerator execution.
pub struct Command {
    id: u64,
    packet: Arc<ExecPacket>,
    device: Arc<Device>,
    ctx: Option<CtxId>,
    notify: Mutex<Option<NotifyFn>>,
}

impl Command {
    pub fn new(device: Arc<Device>, ctx: Option<CtxId>, packet: ExecPacket) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            packet: Arc::new(packet),
            device,
            ctx,
            notify: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn packet(&self) -> &Arc<ExecPacket> {
        &self.packet
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn ctx(&self) -> Option<CtxId> {
        self.ctx
    }

    pub fn state(&self) -> CommandState {
        self.packet.state()
    }

    pub fn set_state(&self, state: CommandState) {
        self.packet.set_state(state);
    }

    /// Register the completion callback. Replaces any previous one.
    pub fn set_notify(&self, f: NotifyFn) {
        *self.notify.lock() = Some(f);
    }

    /// Fire the completion callback. At most one call ever observes the
    /// callback; repeated invocations are no-ops.
    pub(crate) fn notify(&self) {
        let f = self.notify.lock().take();
        if let Some(f) = f {
            f(self);
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("ctx", &self.ctx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::null_device;

    #[test]
    fn test_state_ordering_terminal() {
        assert!(!CommandState::New.is_terminal());
        assert!(!CommandState::Running.is_terminal());
        assert!(CommandState::Completed.is_terminal());
        assert!(CommandState::Error.is_terminal());
        assert!(CommandState::Aborted.is_terminal());
    }

    #[test]
    fn test_cu_mask_membership() {
        let mask = CuMask::from_units(&[0, 63, 64, 127]);
        assert!(mask.test(0));
        assert!(mask.test(63));
        assert!(mask.test(64));
        assert!(mask.test(127));
        assert!(!mask.test(1));
        assert!(!mask.test(128));
        assert!(CuMask::default().is_empty());
        assert!(!CuMask::all().is_empty());
    }

    #[test]
    fn test_command_ids_are_unique() {
        let dev = null_device(0);
        let a = Command::new(dev.clone(), None, ExecPacket::new(0, CuMask::all(), 0));
        let b = Command::new(dev, None, ExecPacket::new(0, CuMask::all(), 0));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_notify_fires_once() {
        use std::sync::atomic::AtomicUsize;

        let dev = null_device(0);
        let cmd = Command::new(dev, None, ExecPacket::new(0, CuMask::all(), 0));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        cmd.set_notify(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        cmd.notify();
        cmd.notify();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
