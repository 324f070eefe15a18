//! # Hokusai Rendezvous
//!
//! Brings a set of running processors to a common point, runs a callback
//! and releases them together. Participants pass two barriers:
//!
//! 1. *ready*: nobody runs the callback before every target has arrived
//! 2. *done*: nobody leaves before every target has finished the callback
//!
//! Only one rendezvous is in flight at a time. The initiating CPU always
//! takes part; the others are pulled in with [`Ipi::Rendezvous`].

use super::{running_mask, whoami, CpuMask, Ipi};
use crate::spinlock::{Spinlock, SpinlockFlags};
use crate::{critical, fatal, hal};
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::CpuId;

/// Work run at the rendezvous point: `(cpu, arg)`
pub type RendezvousFn = fn(CpuId, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    MasterOnly,
}

#[derive(Debug, Clone, Copy)]
struct RendezvousCall {
    callback: RendezvousFn,
    arg: usize,
    scope: Scope,
    master: CpuId,
}

// Recursive so that a same-CPU reentry reaches the "already set" check
// instead of the spinlock's own recursion failure.
static LOCK: Spinlock = Spinlock::new("hokusai", SpinlockFlags::RECURSE);
static CALL: spin::RwLock<Option<RendezvousCall>> = spin::RwLock::new(None);

static TARGET: AtomicU64 = AtomicU64::new(0);
static READY: AtomicU64 = AtomicU64::new(0);
static DONE: AtomicU64 = AtomicU64::new(0);
/// CPUs between arrival and departure
static ACTIVE: AtomicU64 = AtomicU64::new(0);

/// Run `callback` on every running processor at once
pub fn synchronize(callback: RendezvousFn, arg: usize) {
    rendezvous(running_mask(), Scope::All, callback, arg);
}

/// Run `callback` on the running processors in `mask` and on the caller
pub fn synchronize_mask(mask: CpuMask, callback: RendezvousFn, arg: usize) {
    rendezvous(mask, Scope::All, callback, arg);
}

/// Hold every running processor while the caller alone runs `callback`
pub fn synchronize_master(callback: RendezvousFn, arg: usize) {
    rendezvous(running_mask(), Scope::MasterOnly, callback, arg);
}

/// Whether a rendezvous is in flight
pub fn in_progress() -> bool {
    CALL.read().is_some()
}

fn rendezvous(mask: CpuMask, scope: Scope, callback: RendezvousFn, arg: usize) {
    let me = whoami();
    if CpuMask::from_bits(ACTIVE.load(Ordering::SeqCst)).contains(me) {
        fatal!("reentrant rendezvous on {}", me);
    }
    if critical::in_critical() {
        fatal!("rendezvous requested inside a critical section on {}", me);
    }

    cfg_if::cfg_if! {
        if #[cfg(feature = "smp")] {
            gather(me, mask, scope, callback, arg);
        } else {
            let _ = (mask, scope);
            callback(me, arg);
        }
    }
}

#[cfg(feature = "smp")]
fn gather(me: CpuId, mask: CpuMask, scope: Scope, callback: RendezvousFn, arg: usize) {
    LOCK.lock();
    let target = mask.intersect(running_mask()).with(me);
    {
        let mut call = CALL.write();
        if call.is_some() {
            fatal!("reentrant rendezvous on {}: callback already set", me);
        }
        TARGET.store(target.bits(), Ordering::SeqCst);
        READY.store(0, Ordering::SeqCst);
        DONE.store(0, Ordering::SeqCst);
        *call = Some(RendezvousCall {
            callback,
            arg,
            scope,
            master: me,
        });
    }
    log::trace!("hokusai: {} gathers {:?}", me, target);

    super::ipi_send_mask(target.without(me), Ipi::Rendezvous);
    participate(me);

    // Stragglers may still be spinning on `done`
    while ACTIVE.load(Ordering::SeqCst) & target.bits() != 0 {
        hal().cpu().pause();
    }
    *CALL.write() = None;
    TARGET.store(0, Ordering::SeqCst);
    LOCK.unlock();
}

pub(super) fn handle_ipi() {
    participate(whoami());
}

fn participate(me: CpuId) {
    let Some(call) = *CALL.read() else {
        log::warn!("hokusai: {} got a rendezvous IPI with nothing in flight", me);
        return;
    };
    let target = TARGET.load(Ordering::SeqCst);
    let bit = CpuMask::single(me).bits();
    if target & bit == 0 {
        return;
    }
    let cpu = hal().cpu();

    ACTIVE.fetch_or(bit, Ordering::SeqCst);
    READY.fetch_or(bit, Ordering::SeqCst);
    while READY.load(Ordering::SeqCst) & target != target {
        cpu.pause();
    }

    if call.scope == Scope::All || call.master == me {
        (call.callback)(me, call.arg);
    }

    DONE.fetch_or(bit, Ordering::SeqCst);
    while DONE.load(Ordering::SeqCst) & target != target {
        cpu.pause();
    }
    ACTIVE.fetch_and(!bit, Ordering::SeqCst);
}
