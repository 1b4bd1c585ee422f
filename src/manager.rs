//! Managed command execution.
//!
//! A [`CommandManager`] owns one background monitor thread and two FIFOs:
//! commands submitted but not yet confirmed past their first wait cycle
//! (pending) and commands known to be in flight (running). The monitor
//! drives the owning queue's wait primitive, scans the running FIFO in
//! insertion order, and fires each completed command's callback.
//!
//! A notification callback may drop the last reference to the queue that
//! owns the very thread running it, so a manager is never destroyed by its
//! queue: it is detached and parked in the process-wide pool, and joined
//! only at process shutdown from a non-monitor thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::command::{Command, CommandState};
use crate::error::{FatalSlot, Result, SchedError};
use crate::hwqueue::HwQueue;

struct MgrState {
    /// Submitted, not yet past the monitor's first wait cycle.
    pending: VecDeque<Arc<Command>>,
    /// In flight, insertion order.
    running: VecDeque<Arc<Command>>,
    /// The queue currently driving this manager, cleared on detach.
    executor: Option<Weak<HwQueue>>,
    stop: bool,
}

/// Monitor-thread owner for managed execution on one queue at a time.
pub struct CommandManager {
    state: Mutex<MgrState>,
    work: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    wait_slice: Duration,
}

impl CommandManager {
    pub(crate) fn new(wait_slice: Duration, fatal: Arc<FatalSlot>) -> Arc<Self> {
        let manager = Arc::new(Self {
            state: Mutex::new(MgrState {
                pending: VecDeque::new(),
                running: VecDeque::new(),
                executor: None,
                stop: false,
            }),
            work: Condvar::new(),
            thread: Mutex::new(None),
            wait_slice,
        });

        let this = manager.clone();
        let handle = thread::Builder::new()
            .name("cmd-monitor".into())
            .spawn(move || {
                match panic::catch_unwind(AssertUnwindSafe(|| this.monitor())) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        fatal.record(SchedError::MonitorFatal(e.to_string()));
                    }
                    Err(payload) => {
                        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = payload.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        fatal.record(SchedError::MonitorFatal(msg));
                    }
                }
            })
            .expect("failed to spawn command monitor thread");
        *manager.thread.lock() = Some(handle);
        manager
    }

    /// Point this manager at the queue it executes for.
    pub(crate) fn attach(&self, queue: &Arc<HwQueue>) {
        let mut st = self.state.lock();
        st.executor = Some(Arc::downgrade(queue));
    }

    /// Clear the executor; the manager goes back to the pool. Outstanding
    /// commands keep being scanned by status and can still notify.
    pub(crate) fn detach(&self) {
        let mut st = self.state.lock();
        if !st.pending.is_empty() || !st.running.is_empty() {
            log::warn!(
                "manager detached with {} pending and {} running commands",
                st.pending.len(),
                st.running.len()
            );
        }
        st.executor = None;
    }

    pub(crate) fn executor(&self) -> Option<Arc<HwQueue>> {
        self.state.lock().executor.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().stop
    }

    /// Submit a command under managed execution.
    ///
    /// The command enters the pending FIFO before the queue submission so
    /// the monitor already knows about it when the shared wait primitive
    /// can first observe its completion; reversing the order loses
    /// notifications. On submission failure the entry is removed again and
    /// the error propagates.
    pub fn launch(&self, queue: &Arc<HwQueue>, cmd: &Arc<Command>) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.stop {
                return Err(SchedError::ShuttingDown);
            }
            cmd.set_state(CommandState::Submitted);
            st.pending.push_back(cmd.clone());
            self.work.notify_one();
        }

        if let Err(e) = queue.submit(cmd) {
            let mut st = self.state.lock();
            st.pending.retain(|c| c.id() != cmd.id());
            st.running.retain(|c| c.id() != cmd.id());
            cmd.set_state(CommandState::New);
            return Err(e);
        }
        Ok(())
    }

    /// Stop the monitor and join it. Must never be called from the monitor
    /// thread itself; final joins happen at process shutdown on a
    /// designated non-monitor thread.
    pub(crate) fn stop(&self) {
        {
            // The stop flag must be raised under the predicate mutex: the
            // wait predicate has three disjuncts and an atomic flag alone
            // can lose the wakeup.
            let mut st = self.state.lock();
            st.stop = true;
            self.work.notify_all();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                log::error!("refusing to join command monitor from its own thread");
                return;
            }
            let _ = handle.join();
        }
    }

    fn monitor(&self) -> Result<()> {
        loop {
            // Sleep until stop is requested or there is work to track.
            let executor = {
                let mut st = self.state.lock();
                self.work.wait_while(&mut st, |s| {
                    !s.stop && s.pending.is_empty() && s.running.is_empty()
                });
                if st.stop {
                    return Ok(());
                }
                st.executor.as_ref().and_then(Weak::upgrade)
            };

            // One bounded pass through the queue's wait primitive, outside
            // the state lock. Completions observed here may belong to
            // commands still sitting in the pending FIFO; they are drained
            // into running afterwards, which is why launch appends before
            // submitting.
            match executor {
                Some(queue) => {
                    let head = self.state.lock().running.front().cloned();
                    queue.monitor_wait(head.as_ref())?;
                }
                // Detached with work outstanding: keep scanning by status.
                None => thread::sleep(self.wait_slice),
            }

            let done: Vec<Arc<Command>> = {
                let mut st = self.state.lock();
                while let Some(cmd) = st.pending.pop_front() {
                    st.running.push_back(cmd);
                }
                let mut done = Vec::new();
                st.running.retain(|cmd| {
                    if cmd.state().is_terminal() {
                        done.push(cmd.clone());
                        false
                    } else {
                        true
                    }
                });
                done
            };

            // Notify outside the lock; a callback may drop the last
            // reference to the command or its queue.
            for cmd in done {
                log::debug!("command {} reached {:?}", cmd.id(), cmd.state());
                cmd.notify();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fifo_lens(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.pending.len(), st.running.len())
    }
}
