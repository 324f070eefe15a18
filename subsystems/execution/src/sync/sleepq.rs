//! # Sleep Queues
//!
//! Generic wait/wakeup keyed by a [`Cookie`]. A waiter registers first and
//! sleeps second; a signal that lands in between clears the waiter's
//! `needs_wakeup` flag, and the waiter then returns without sleeping.
//!
//! Queues are created on first use and never removed, so the set of
//! cookies in use must stay bounded.

use super::current_or_fatal;
use crate::scheduler;
use crate::thread::ThreadRef;
use crate::ThreadId;
use alloc::collections::{BTreeMap, VecDeque};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_core::{critical, fatal, SpinLocked};

/// Identity of a resource threads can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cookie(u64);

impl Cookie {
    /// Allocate a cookie no other resource uses
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Cookie for an externally managed identity
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cookie:{:#x}", self.0)
    }
}

struct SleepEntry {
    thread: ThreadRef,
    cookie: Cookie,
    needs_wakeup: bool,
    sleeping: bool,
}

struct SleepTable {
    queues: BTreeMap<Cookie, VecDeque<ThreadId>>,
    entries: BTreeMap<ThreadId, SleepEntry>,
}

impl SleepTable {
    const fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Link `thread` on `cookie`, or re-arm an existing registration
    fn register(&mut self, thread: &ThreadRef, cookie: Cookie, rearm: bool) {
        let id = thread.id();
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.cookie != cookie {
                fatal!(
                    "sleepq: {} waits on {} and {} at once",
                    id,
                    entry.cookie,
                    cookie
                );
            }
            if rearm && !entry.needs_wakeup {
                entry.needs_wakeup = true;
                self.queues.entry(cookie).or_default().push_back(id);
            }
            return;
        }
        self.entries.insert(
            id,
            SleepEntry {
                thread: thread.clone(),
                cookie,
                needs_wakeup: true,
                sleeping: false,
            },
        );
        self.queues.entry(cookie).or_default().push_back(id);
    }

    /// Drop any registration held by `id`
    fn forget(&mut self, id: ThreadId) -> Option<Cookie> {
        let entry = self.entries.remove(&id)?;
        if let Some(queue) = self.queues.get_mut(&entry.cookie) {
            queue.retain(|&queued| queued != id);
            if queue.is_empty() {
                self.queues.remove(&entry.cookie);
            }
        }
        Some(entry.cookie)
    }

    /// Mark `id` woken; make it runnable if it already went to sleep
    fn wake(&mut self, id: ThreadId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.needs_wakeup = false;
            if entry.sleeping {
                entry.sleeping = false;
                scheduler::thread_runnable(&entry.thread);
            }
        }
    }
}

static TABLE: SpinLocked<SleepTable> = SpinLocked::new("sleepq", SleepTable::new());

/// Register the calling thread on `cookie` without blocking
///
/// Lets a caller that holds a spinlock guarding the resource enqueue
/// before releasing it; the following [`wait`] then cannot miss a signal
/// sent after the release.
pub fn prepare(cookie: Cookie) {
    let thread = current_or_fatal("sleepq::prepare");
    TABLE.lock().register(&thread, cookie, false);
}

/// Block until `cookie` is signalled
///
/// Returns at once if the caller's registration was already signalled.
pub fn wait(cookie: Cookie) {
    if critical::in_critical() {
        fatal!("sleepq: blocking wait on {} inside a critical section", cookie);
    }
    let thread = current_or_fatal("sleepq::wait");
    if thread.is_idle() {
        fatal!("sleepq: idle thread cannot wait on {}", cookie);
    }
    let id = thread.id();

    let mut table = TABLE.lock();
    table.register(&thread, cookie, false);
    loop {
        let Some(entry) = table.entries.get_mut(&id) else {
            fatal!("sleepq: entry of {} vanished", id);
        };
        if !entry.needs_wakeup {
            table.entries.remove(&id);
            return;
        }
        entry.sleeping = true;
        scheduler::thread_sleeping(&thread);
        drop(table);
        scheduler::schedule();
        table = TABLE.lock();
    }
}

/// Sleep on `cookie` until signalled
///
/// Unlike [`wait`], an earlier signal does not count: the caller always
/// waits for a new one.
pub fn enter(cookie: Cookie) {
    if critical::in_critical() {
        fatal!("sleepq: enter on {} inside a critical section", cookie);
    }
    let thread = current_or_fatal("sleepq::enter");
    TABLE.lock().register(&thread, cookie, true);
    wait(cookie);
}

/// Wake every thread waiting on `cookie`; returns how many were woken
pub fn signal(cookie: Cookie) -> usize {
    let mut table = TABLE.lock();
    let Some(waiting) = table.queues.get_mut(&cookie).map(core::mem::take) else {
        return 0;
    };
    let woken = waiting.len();
    for id in waiting {
        table.wake(id);
    }
    if woken > 0 {
        log::trace!("sleepq: {} woke {}", cookie, woken);
    }
    woken
}

/// Wake the longest-waiting thread on `cookie`
pub fn signal_one(cookie: Cookie) -> bool {
    let mut table = TABLE.lock();
    let Some(id) = table
        .queues
        .get_mut(&cookie)
        .and_then(VecDeque::pop_front)
    else {
        return false;
    };
    table.wake(id);
    log::trace!("sleepq: {} woke {}", cookie, id);
    true
}

/// Discard a registration left behind by an exiting thread
pub(crate) fn forget(id: ThreadId) {
    if let Some(cookie) = TABLE.lock().forget(id) {
        log::debug!("sleepq: {} exited while registered on {}", id, cookie);
    }
}

/// Threads currently registered on `cookie` and not yet signalled
pub fn waiters(cookie: Cookie) -> usize {
    TABLE.lock().queues.get(&cookie).map_or(0, VecDeque::len)
}
