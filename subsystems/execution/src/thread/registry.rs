//! # Thread Registry
//!
//! Central registry for all live threads in the system.

use super::{Thread, ThreadState};
use crate::{ExecError, ExecResult, ThreadId};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kestrel_hal::CpuId;
use spin::RwLock;

/// Thread registry
#[derive(Debug)]
pub struct ThreadRegistry {
    /// All threads by ID
    threads: RwLock<BTreeMap<ThreadId, Arc<Thread>>>,
}

impl ThreadRegistry {
    /// Create a new registry
    pub const fn new() -> Self {
        Self {
            threads: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a new thread
    pub fn register(&self, thread: Arc<Thread>) -> ExecResult<()> {
        let id = thread.id();
        let mut threads = self.threads.write();
        if threads.contains_key(&id) {
            return Err(ExecError::AlreadyExists);
        }
        threads.insert(id, thread);
        Ok(())
    }

    /// Unregister a thread
    pub fn unregister(&self, id: ThreadId) -> ExecResult<Arc<Thread>> {
        self.threads
            .write()
            .remove(&id)
            .ok_or(ExecError::ThreadNotFound)
    }

    /// Get a thread by ID
    pub fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.read().get(&id).cloned()
    }

    /// Get all threads in a state
    pub fn get_by_state(&self, state: ThreadState) -> Vec<Arc<Thread>> {
        self.threads
            .read()
            .values()
            .filter(|t| t.state() == state)
            .cloned()
            .collect()
    }

    /// Get thread count
    pub fn count(&self) -> usize {
        self.threads.read().len()
    }

    /// Every live thread, in id order
    ///
    /// The registry lock is released before the caller sees the threads.
    pub fn snapshot(&self) -> Vec<Arc<Thread>> {
        self.threads.read().values().cloned().collect()
    }

    /// Threads running on, or last run on, `cpu`
    pub fn on_cpu(&self, cpu: CpuId) -> Vec<Arc<Thread>> {
        self.threads
            .read()
            .values()
            .filter(|t| t.sched().oncpu() == Some(cpu))
            .cloned()
            .collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global thread registry
static REGISTRY: ThreadRegistry = ThreadRegistry::new();

/// Get the thread registry
pub fn registry() -> &'static ThreadRegistry {
    &REGISTRY
}
