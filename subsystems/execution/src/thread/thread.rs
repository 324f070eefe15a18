//! # Thread Structure
//!
//! Core thread data structure.

use super::ThreadState;
use crate::scheduler::SchedEntry;
use crate::ThreadId;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kestrel_core::config::WITNESS_MAX_HELD;
use kestrel_hal::ExecutionContext;

/// Lock classes a thread holds, in acquisition order
pub type HeldLocks = heapless::Vec<&'static str, WITNESS_MAX_HELD>;

/// A kernel thread
pub struct Thread {
    id: ThreadId,
    name: String,
    state: AtomicU32,
    sched: SchedEntry,
    context: Box<dyn ExecutionContext>,
    held: spin::Mutex<HeldLocks>,
}

/// Shared handle to a thread
pub type ThreadRef = Arc<Thread>;

impl Thread {
    pub(crate) fn new(id: ThreadId, name: &str, context: Box<dyn ExecutionContext>) -> Self {
        Self {
            id,
            name: String::from(name),
            state: AtomicU32::new(ThreadState::Setup.as_u32()),
            sched: SchedEntry::new(),
            context,
            held: spin::Mutex::new(HeldLocks::new()),
        }
    }

    /// Get thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Get thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Move to `state`
    ///
    /// Called by the scheduler with the thread's queue lock held.
    pub(crate) fn set_state(&self, state: ThreadState) {
        let old = self.state();
        if !old.can_become(state) {
            log::warn!("{} ({}): unexpected transition {:?} -> {:?}", self.name, self.id, old, state);
        }
        self.state.store(state.as_u32(), Ordering::Release);
    }

    /// Scheduling entry
    pub(crate) fn sched(&self) -> &SchedEntry {
        &self.sched
    }

    /// Saved execution context
    pub(crate) fn context(&self) -> &(dyn ExecutionContext + 'static) {
        &*self.context
    }

    /// Locks this thread holds, as seen by the lock-order verifier
    pub fn held_locks(&self) -> HeldLocks {
        self.held.lock().clone()
    }

    pub(crate) fn held(&self) -> &spin::Mutex<HeldLocks> {
        &self.held
    }

    /// Whether this is a processor's idle thread
    pub fn is_idle(&self) -> bool {
        self.sched.is_idle()
    }

    /// CPU this thread is pinned to, if any
    pub fn pinned_cpu(&self) -> Option<kestrel_hal::CpuId> {
        self.sched.pinned_cpu()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("sched", &self.sched)
            .finish_non_exhaustive()
    }
}
