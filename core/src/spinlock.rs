//! # Spinlocks
//!
//! Busy-wait mutual exclusion between processors. A held spinlock keeps
//! its owner CPU inside a critical section, so an interrupt handler on the
//! same CPU can never spin on a lock its own CPU holds.
//!
//! The owner is a CPU, not a thread. This is what lets the scheduler lock a
//! run queue in one thread and release it in the thread it switched to.
//!
//! Before per-CPU state exists every operation is a no-op: early boot runs
//! on a single CPU with interrupts masked.

use crate::critical::{self, CriticalToken};
use crate::{fatal, hal, percpu};
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kestrel_hal::CpuId;

bitflags! {
    /// Spinlock behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpinlockFlags: u32 {
        /// The owning CPU may lock again; each lock needs its own unlock
        const RECURSE = 1 << 0;
    }
}

const NO_OWNER: u32 = u32::MAX;

/// A raw spinlock
pub struct Spinlock {
    name: &'static str,
    owner: AtomicU32,
    nest: AtomicU64,
    flags: SpinlockFlags,
    token: UnsafeCell<Option<CriticalToken>>,
}

// SAFETY: `token` is only touched by the CPU that owns the lock
unsafe impl Sync for Spinlock {}
unsafe impl Send for Spinlock {}

impl Spinlock {
    /// Create an unlocked spinlock
    pub const fn new(name: &'static str, flags: SpinlockFlags) -> Self {
        Self {
            name,
            owner: AtomicU32::new(NO_OWNER),
            nest: AtomicU64::new(0),
            flags,
            token: UnsafeCell::new(None),
        }
    }

    /// Lock name, used in diagnostics
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, spinning until it is free
    pub fn lock(&self) {
        let Some(percpu) = percpu::current() else {
            return;
        };
        let me = percpu.id().as_u32();

        loop {
            let token = critical::enter();
            match self
                .owner
                .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    // SAFETY: we are the owner
                    unsafe { *self.token.get() = Some(token) };
                    return;
                }
                Err(owner) if owner == me => {
                    if !self.flags.contains(SpinlockFlags::RECURSE) {
                        fatal!("spinlock {} cannot recurse on {}", self.name, percpu.id());
                    }
                    self.nest.fetch_add(1, Ordering::Relaxed);
                    critical::exit(token);
                    return;
                }
                Err(_) => {
                    // Let interrupts in while another CPU holds the lock
                    critical::exit(token);
                    while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                        hal().cpu().pause();
                    }
                }
            }
        }
    }

    /// Try to acquire the lock without spinning
    ///
    /// A recursive lock already owned by this CPU is acquired again.
    pub fn try_lock(&self) -> bool {
        let Some(percpu) = percpu::current() else {
            return true;
        };
        let me = percpu.id().as_u32();
        let token = critical::enter();
        match self
            .owner
            .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                // SAFETY: we are the owner
                unsafe { *self.token.get() = Some(token) };
                true
            }
            Err(owner) if owner == me && self.flags.contains(SpinlockFlags::RECURSE) => {
                self.nest.fetch_add(1, Ordering::Relaxed);
                critical::exit(token);
                true
            }
            Err(_) => {
                critical::exit(token);
                false
            }
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        let Some(percpu) = percpu::current() else {
            return;
        };
        if self.owner.load(Ordering::Relaxed) != percpu.id().as_u32() {
            fatal!(
                "spinlock {} released by {} but owned by {}",
                self.name,
                percpu.id(),
                OwnerDisplay(self.owner())
            );
        }
        if self.nest.load(Ordering::Relaxed) > 0 {
            self.nest.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        // SAFETY: we are the owner until the store below
        let token = unsafe { (*self.token.get()).take() };
        self.owner.store(NO_OWNER, Ordering::Release);
        match token {
            Some(token) => critical::exit(token),
            None => fatal!("spinlock {} lost its critical section", self.name),
        }
    }

    /// Whether the calling CPU owns the lock
    pub fn owned(&self) -> bool {
        percpu::current()
            .is_some_and(|percpu| self.owner.load(Ordering::Relaxed) == percpu.id().as_u32())
    }

    /// Whether any CPU owns the lock
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    /// Owning CPU, if any
    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            cpu => Some(CpuId::new(cpu)),
        }
    }

    /// Extra acquisitions held by the owner
    pub fn nest(&self) -> u64 {
        self.nest.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Spinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("name", &self.name)
            .field("owner", &self.owner())
            .field("nest", &self.nest())
            .field("flags", &self.flags)
            .finish()
    }
}

struct OwnerDisplay(Option<CpuId>);

impl fmt::Display for OwnerDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(cpu) => write!(f, "{cpu}"),
            None => f.write_str("nobody"),
        }
    }
}

// =============================================================================
// Data-carrying spinlock
// =============================================================================

/// Data protected by a non-recursive [`Spinlock`]
pub struct SpinLocked<T> {
    lock: Spinlock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `lock`
unsafe impl<T: Send> Sync for SpinLocked<T> {}
unsafe impl<T: Send> Send for SpinLocked<T> {}

impl<T> SpinLocked<T> {
    /// Wrap `data` in a lock named `name`
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: Spinlock::new(name, SpinlockFlags::empty()),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.lock.lock();
        SpinGuard { owner: self }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.lock.try_lock().then(|| SpinGuard { owner: self })
    }

    /// The underlying lock
    ///
    /// Used to release a lock whose guard was leaked with [`SpinGuard::leak`].
    pub fn raw(&self) -> &Spinlock {
        &self.lock
    }

    /// Access the data without locking
    ///
    /// # Safety
    /// The calling CPU must hold the lock and no other reference to the
    /// data may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_unchecked(&self) -> &mut T {
        // SAFETY: guaranteed by the caller
        unsafe { &mut *self.data.get() }
    }
}

impl<T> fmt::Debug for SpinLocked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLocked").field("lock", &self.lock).finish_non_exhaustive()
    }
}

/// RAII guard of a [`SpinLocked`]
pub struct SpinGuard<'a, T> {
    owner: &'a SpinLocked<T>,
}

impl<'a, T> SpinGuard<'a, T> {
    /// Keep the lock held past the guard's lifetime
    ///
    /// The lock must later be released through [`SpinLocked::raw`].
    pub fn leak(guard: Self) -> &'a mut T {
        let owner = guard.owner;
        core::mem::forget(guard);
        // SAFETY: the lock stays held and the guard is gone
        unsafe { &mut *owner.data.get() }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock
        unsafe { &*self.owner.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.unlock();
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_free() {
        let lock = Spinlock::new("test", SpinlockFlags::RECURSE);
        assert!(!lock.is_locked());
        assert_eq!(lock.owner(), None);
        assert_eq!(lock.nest(), 0);
        assert_eq!(lock.name(), "test");
    }

    #[test]
    fn test_early_boot_is_noop() {
        let lock = Spinlock::new("early", SpinlockFlags::empty());
        lock.lock();
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        lock.unlock();
        assert!(!lock.owned());

        let data = SpinLocked::new("early-data", 5u32);
        *data.lock() += 1;
        assert_eq!(*data.lock(), 6);
    }
}
