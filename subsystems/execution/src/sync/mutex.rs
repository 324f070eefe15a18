//! # Mutexes
//!
//! Sleeping locks owned by a thread. Contention is resolved through the
//! sleep queue: a loser registers on the mutex's cookie while still
//! holding the mutex's spinlock, so the owner's unlock cannot slip past
//! it, then sleeps and retries.

use super::sleepq::{self, Cookie};
use super::{current_or_fatal, witness};
use crate::thread::ThreadRef;
use crate::ThreadId;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kestrel_core::{critical, fatal, Spinlock, SpinlockFlags};

bitflags! {
    /// Mutex behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: u32 {
        /// The owner may lock again; each lock needs its own unlock
        const RECURSE = 1 << 0;
    }
}

const NO_OWNER: u64 = u64::MAX;
const NO_COOKIE: u64 = 0;

enum Acquire {
    First,
    Recursed,
    Busy,
}

/// A sleeping mutual-exclusion lock
pub struct Mutex {
    name: &'static str,
    lock: Spinlock,
    owner: AtomicU64,
    nest: AtomicU64,
    flags: MutexFlags,
    cookie: AtomicU64,
    // Whether the current hold is on the owner's witness list
    tracked: AtomicBool,
}

impl Mutex {
    /// Create an unlocked mutex
    ///
    /// `name` is the lock class used by the lock-order verifier and names
    /// the inner spinlock in diagnostics.
    pub const fn new(name: &'static str, flags: MutexFlags) -> Self {
        Self {
            name,
            lock: Spinlock::new(name, SpinlockFlags::empty()),
            owner: AtomicU64::new(NO_OWNER),
            nest: AtomicU64::new(0),
            flags,
            cookie: AtomicU64::new(NO_COOKIE),
            tracked: AtomicBool::new(false),
        }
    }

    /// Lock class name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sleep-queue key of this mutex, assigned on first use
    pub fn cookie(&self) -> Cookie {
        let raw = self.cookie.load(Ordering::Acquire);
        if raw != NO_COOKIE {
            return Cookie::from_raw(raw);
        }
        let fresh = Cookie::fresh().as_u64();
        match self
            .cookie
            .compare_exchange(NO_COOKIE, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Cookie::from_raw(fresh),
            Err(winner) => Cookie::from_raw(winner),
        }
    }

    fn track(&self, me: &ThreadRef) {
        let tracked = witness::record_acquire(me, self.name);
        self.tracked.store(tracked, Ordering::Relaxed);
    }

    // Caller holds `self.lock`.
    fn acquire(&self, me: &ThreadRef) -> Acquire {
        let id = me.id().as_u64();
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => {
                self.owner.store(id, Ordering::Relaxed);
                Acquire::First
            }
            owner if owner == id => {
                if !self.flags.contains(MutexFlags::RECURSE) {
                    fatal!("mutex {} cannot recurse in {}", self.name, me.id());
                }
                self.nest.fetch_add(1, Ordering::Relaxed);
                Acquire::Recursed
            }
            _ => Acquire::Busy,
        }
    }

    /// Acquire the mutex, sleeping while another thread owns it
    pub fn lock(&self) {
        if critical::in_critical() {
            fatal!("mutex {} locked inside a critical section", self.name);
        }
        let me = current_or_fatal("mutex lock");
        witness::check_order(&me, self.name);
        loop {
            self.lock.lock();
            match self.acquire(&me) {
                Acquire::First => {
                    self.lock.unlock();
                    self.track(&me);
                    return;
                }
                Acquire::Recursed => {
                    self.lock.unlock();
                    return;
                }
                Acquire::Busy => {
                    let cookie = self.cookie();
                    sleepq::prepare(cookie);
                    self.lock.unlock();
                    sleepq::wait(cookie);
                }
            }
        }
    }

    /// Acquire the mutex if it is free
    pub fn try_lock(&self) -> bool {
        let me = current_or_fatal("mutex try_lock");
        self.lock.lock();
        let outcome = self.acquire(&me);
        self.lock.unlock();
        match outcome {
            Acquire::First => {
                self.track(&me);
                true
            }
            Acquire::Recursed => true,
            Acquire::Busy => false,
        }
    }

    /// Release the mutex
    ///
    /// Only the owner may unlock. The last unlock of a recursive hold wakes
    /// one waiter.
    pub fn unlock(&self) {
        let me = current_or_fatal("mutex unlock");
        self.lock.lock();
        let owner = self.owner.load(Ordering::Relaxed);
        if owner != me.id().as_u64() {
            fatal!(
                "mutex {} unlocked by {} but owned by {}",
                self.name,
                me.id(),
                Owner(owner)
            );
        }
        if self.nest.load(Ordering::Relaxed) > 0 {
            self.nest.fetch_sub(1, Ordering::Relaxed);
            self.lock.unlock();
            return;
        }
        let tracked = self.tracked.swap(false, Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        sleepq::signal_one(self.cookie());
        self.lock.unlock();
        if tracked {
            witness::record_release(&me, self.name);
        }
    }

    /// Acquire the mutex and release it when the guard drops
    pub fn lock_guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    /// Whether the calling thread owns the mutex
    pub fn is_owned(&self) -> bool {
        crate::scheduler::current_thread()
            .is_some_and(|me| self.owner.load(Ordering::Relaxed) == me.id().as_u64())
    }

    /// Whether any thread owns the mutex
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    /// Owning thread
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    /// Extra acquisitions held by the owner
    pub fn nest(&self) -> u64 {
        self.nest.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("owner", &self.owner())
            .field("nest", &self.nest())
            .field("flags", &self.flags)
            .finish()
    }
}

struct Owner(u64);

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            NO_OWNER => f.write_str("nobody"),
            raw => write!(f, "{}", ThreadId::from_raw(raw)),
        }
    }
}

/// RAII hold of a [`Mutex`]
#[derive(Debug)]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
