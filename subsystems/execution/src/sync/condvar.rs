//! # Condition Variables
//!
//! Wait for a predicate guarded by a [`Mutex`]. The waiter registers on
//! the condition's sleep queue before releasing the mutex, both under the
//! condition's spinlock, so a signal sent by the next mutex holder always
//! finds it.

use super::mutex::Mutex;
use super::sleepq::{self, Cookie};
use alloc::sync::Arc;
use core::fmt;
use kestrel_core::{fatal, Spinlock, SpinlockFlags};

/// A condition variable bound to one mutex
pub struct CondVar {
    lock: Spinlock,
    mutex: Arc<Mutex>,
    cookie: Cookie,
}

impl CondVar {
    /// Create a condition variable over `mutex`
    ///
    /// The inner spinlock carries the mutex's name.
    pub fn new(mutex: Arc<Mutex>) -> Self {
        Self {
            lock: Spinlock::new(mutex.name(), SpinlockFlags::empty()),
            mutex,
            cookie: Cookie::fresh(),
        }
    }

    /// The associated mutex
    pub fn mutex(&self) -> &Arc<Mutex> {
        &self.mutex
    }

    /// Release the mutex, sleep until signalled, then reacquire it
    ///
    /// Wakeups can be spurious; callers re-check their predicate.
    pub fn wait(&self) {
        if !self.mutex.is_owned() {
            fatal!("condvar wait without holding mutex {}", self.mutex.name());
        }
        if self.mutex.nest() > 0 {
            fatal!(
                "condvar wait with mutex {} held recursively",
                self.mutex.name()
            );
        }
        self.lock.lock();
        sleepq::prepare(self.cookie);
        self.mutex.unlock();
        self.lock.unlock();

        sleepq::wait(self.cookie);
        self.mutex.lock();
    }

    /// Wake the longest waiter
    pub fn signal(&self) {
        self.assert_owned("signal");
        self.lock.lock();
        sleepq::signal_one(self.cookie);
        self.lock.unlock();
    }

    /// Wake every waiter
    pub fn signal_broadcast(&self) {
        self.assert_owned("broadcast");
        self.lock.lock();
        sleepq::signal(self.cookie);
        self.lock.unlock();
    }

    fn assert_owned(&self, operation: &str) {
        if !self.mutex.is_owned() {
            fatal!(
                "condvar {} without holding mutex {}",
                operation,
                self.mutex.name()
            );
        }
    }
}

impl fmt::Debug for CondVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("mutex", &self.mutex)
            .field("cookie", &self.cookie)
            .finish()
    }
}
