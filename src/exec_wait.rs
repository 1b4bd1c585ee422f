//! Synchronized blocking-wait multiplexer.
//!
//! The device's `exec_wait` primitive may only be entered by one thread at
//! a time, yet a call made on behalf of one command can satisfy
//! completions belonging to other threads' commands. [`ExecWaitMux`]
//! arbitrates concurrent callers with a 64-bit completion-generation
//! counter: exactly one thread drives the primitive per generation, every
//! other thread either returns immediately (its last observed generation is
//! stale, so a completion epoch already covered it) or blocks until the
//! generation advances.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// How a multiplexed wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxOutcome {
    /// This thread entered the primitive; carries the completion count it
    /// reported.
    Drove(usize),
    /// Another thread's call covered this thread's epoch; the caller must
    /// re-check command status.
    Covered,
    /// The bounded wait elapsed while another thread was still inside the
    /// primitive.
    TimedOut,
}

struct MuxState {
    generation: u64,
    active: bool,
}

/// Per-device arbiter for the single-threaded blocking-wait primitive.
pub struct ExecWaitMux {
    id: u64,
    state: Mutex<MuxState>,
    cond: Condvar,
}

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Last generation observed by this thread, per mux instance.
    static LAST_GEN: RefCell<HashMap<u64, u64>> = RefCell::new(HashMap::new());
}

impl Default for ExecWaitMux {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecWaitMux {
    pub fn new() -> Self {
        Self {
            id: NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(MuxState {
                generation: 0,
                active: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn observe(&self, generation: u64) {
        LAST_GEN.with(|m| {
            m.borrow_mut().insert(self.id, generation);
        });
    }

    fn last_observed(&self) -> u64 {
        LAST_GEN.with(|m| m.borrow().get(&self.id).copied().unwrap_or(0))
    }

    /// Wait through the shared primitive.
    ///
    /// `primitive` is the real (possibly blocking) wait call; it is invoked
    /// by at most one thread at a time across all callers of this mux. A
    /// `None` timeout blocks until the generation advances.
    pub fn wait<F>(&self, timeout: Option<Duration>, primitive: F) -> Result<MuxOutcome>
    where
        F: FnOnce(Option<Duration>) -> Result<usize>,
    {
        let mut st = self.state.lock();
        let seen = self.last_observed();

        if seen != st.generation {
            // A completion epoch elapsed since this thread last looked.
            let generation = st.generation;
            drop(st);
            self.observe(generation);
            return Ok(MuxOutcome::Covered);
        }

        if st.active {
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Ok(MuxOutcome::TimedOut);
                        }
                        self.cond.wait_for(&mut st, d - now);
                    }
                    None => self.cond.wait(&mut st),
                }
                if st.generation != seen {
                    let generation = st.generation;
                    drop(st);
                    self.observe(generation);
                    return Ok(MuxOutcome::Covered);
                }
            }
        }

        st.active = true;
        drop(st);

        let res = primitive(timeout);

        // Generation advances and waiters wake even when the primitive
        // failed, otherwise blocked threads would never retry.
        let mut st = self.state.lock();
        st.generation += 1;
        st.active = false;
        let generation = st.generation;
        self.cond.notify_all();
        drop(st);
        self.observe(generation);

        Ok(MuxOutcome::Drove(res?))
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}
