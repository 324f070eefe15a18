//! # Scheduler
//!
//! Per-CPU run queues with load-balanced placement and CPU pinning.
//!
//! Threads that have a CPU stay linked into that CPU's queue while they run;
//! `pick` skips them by their `RUNNING` flag. A sleeping or exiting thread
//! is unlinked. Each CPU's idle thread is never linked at all and only runs
//! when nothing else on its queue can.
//!
//! ## Lock handoff
//!
//! `schedule` locks the local queue, switches, and the thread switched to
//! releases the lock in [`switch_finish`]. Nobody can observe a CPU between
//! choosing the next thread and running it.
//!
//! Lock order: sleep-queue table, then run queues by ascending CPU id.

pub mod entry;
pub mod metrics;
pub mod queue;

pub use entry::{SchedEntry, SchedFlags};
pub use metrics::SchedulerMetrics;
pub use queue::{least_loaded, QueueList, RunQueue};

use crate::thread::{ThreadRef, ThreadState};
use crate::{ExecError, ExecResult, ThreadId};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kestrel_core::spinlock::{SpinGuard, Spinlock, SpinlockFlags};
use kestrel_core::{critical, fatal, mp};
use kestrel_hal::{CpuId, ExecutionContext};
use queue::QueueState;

static QUEUES: spin::Once<Box<[RunQueue]>> = spin::Once::new();
static TOPOLOGY: Spinlock = Spinlock::new("sched-topology", SpinlockFlags::empty());
static METRICS: SchedulerMetrics = SchedulerMetrics::new();

/// Create a run queue for each of `count` processors
pub fn init(count: usize) {
    QUEUES.call_once(|| {
        (0..count)
            .map(|index| RunQueue::new(CpuId::new(index as u32)))
            .collect()
    });
    log::info!("sched: {} run queue(s)", count);
}

/// Run queue of `cpu`
pub fn run_queue(cpu: CpuId) -> Option<&'static RunQueue> {
    QUEUES.get()?.get(cpu.as_index())
}

fn queue(cpu: CpuId) -> &'static RunQueue {
    match run_queue(cpu) {
        Some(queue) => queue,
        None => fatal!("no run queue for {}", cpu),
    }
}

/// Join `cpu`'s queue to the set considered for placement
pub fn cpu_attach(cpu: CpuId) {
    let runq = queue(cpu);
    TOPOLOGY.lock();
    runq.attach();
    TOPOLOGY.unlock();
    log::info!("sched: {} attached", cpu);
}

fn least_loaded_cpu() -> CpuId {
    let queues = QUEUES.get().map_or(&[][..], |queues| &queues[..]);
    least_loaded(
        queues
            .iter()
            .filter(|queue| queue.is_attached())
            .map(|queue| (queue.cpu(), queue.len())),
    )
    .unwrap_or(CpuId::BOOT)
}

/// Two run-queue locks taken in ascending CPU order
struct LockedPair<'a> {
    low: (CpuId, SpinGuard<'a, QueueState>),
    high: Option<(CpuId, SpinGuard<'a, QueueState>)>,
}

impl LockedPair<'static> {
    fn lock(a: CpuId, b: CpuId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let low_guard = queue(low).state.lock();
        let high_guard = (high != low).then(|| (high, queue(high).state.lock()));
        Self {
            low: (low, low_guard),
            high: high_guard,
        }
    }

    fn list(&mut self, cpu: CpuId) -> &mut QueueList<ThreadRef> {
        if self.low.0 == cpu {
            return &mut self.low.1.list;
        }
        match &mut self.high {
            Some((high, guard)) if *high == cpu => &mut guard.list,
            _ => fatal!("run queue of {} is not locked", cpu),
        }
    }
}

/// Lock the queue guarding `thread`'s entry
fn lock_entry(thread: &ThreadRef) -> (CpuId, SpinGuard<'static, QueueState>) {
    loop {
        let home = thread.sched().lock_cpu();
        let guard = queue(home).state.lock();
        if thread.sched().lock_cpu() == home {
            return (home, guard);
        }
    }
}

// =============================================================================
// Thread lifecycle hooks
// =============================================================================

/// Initialize the scheduling entry of a new thread
pub fn thread_setup(thread: &ThreadRef) {
    thread.sched().reset();
    thread.set_state(ThreadState::Setup);
}

/// Make `thread` runnable
///
/// A thread that is still on its CPU goes back to that CPU's queue, a
/// pinned thread to its pinned CPU, anything else to the shortest queue.
/// Threads already linked stay where they are.
pub fn thread_runnable(thread: &ThreadRef) {
    let sched = thread.sched();
    loop {
        let home = sched.lock_cpu();
        let running = sched.contains(SchedFlags::RUNNING);
        let target = if running {
            home
        } else {
            sched.pinned_cpu().unwrap_or_else(least_loaded_cpu)
        };

        let mut pair = LockedPair::lock(home, target);
        if sched.lock_cpu() != home || sched.contains(SchedFlags::RUNNING) != running {
            continue;
        }
        let flags = sched.flags();
        if flags.intersects(SchedFlags::IDLE | SchedFlags::EXITING) || sched.queue().is_some() {
            return;
        }

        queue(target).link(pair.list(target), thread);
        sched.remove(SchedFlags::SLEEPING);
        thread.set_state(if running {
            ThreadState::Running
        } else {
            ThreadState::Runnable
        });
        if flags.contains(SchedFlags::SLEEPING) {
            METRICS.record_wakeup();
        }
        log::trace!("sched: {} runnable on {}", thread.id(), target);
        return;
    }
}

/// Take `thread` off the run queues until it is made runnable again
pub fn thread_sleeping(thread: &ThreadRef) {
    let sched = thread.sched();
    let (home, mut guard) = lock_entry(thread);
    if sched.is_idle() {
        fatal!("idle thread of {} cannot sleep", home);
    }
    if sched.queue().is_some() {
        queue(home).unlink(&mut guard.list, thread);
        if !sched.contains(SchedFlags::RUNNING) {
            sched.set_oncpu(home);
        }
    }
    sched.insert(SchedFlags::SLEEPING);
    thread.set_state(ThreadState::Sleeping);
    METRICS.record_sleep();
    log::trace!("sched: {} sleeping", thread.id());
}

/// Pin `thread` to the CPU it is on
///
/// A thread that has not been placed yet is pinned to the calling CPU.
pub fn cpu_pin(thread: &ThreadRef) {
    let sched = thread.sched();
    let (home, _guard) = lock_entry(thread);
    let cpu = if sched.queue().is_none() && sched.oncpu().is_none() {
        mp::whoami()
    } else {
        home
    };
    sched.pin(cpu);
    log::debug!("sched: {} pinned to {}", thread.id(), cpu);
}

/// Pin a thread that has not been made runnable yet to `cpu`
pub fn cpu_pin_to(thread: &ThreadRef, cpu: CpuId) -> ExecResult<()> {
    if !run_queue(cpu).is_some_and(RunQueue::is_attached) {
        return Err(ExecError::NoSuchCpu);
    }
    let sched = thread.sched();
    let (_home, _guard) = lock_entry(thread);
    if thread.state() != ThreadState::Setup || sched.queue().is_some() {
        return Err(ExecError::InvalidState);
    }
    sched.pin(cpu);
    log::debug!("sched: {} pinned to {}", thread.id(), cpu);
    Ok(())
}

/// Make `thread`, the flow now running on this CPU, its idle thread
pub fn cpu_idle(thread: &ThreadRef) {
    let cpu = mp::whoami();
    let runq = queue(cpu);
    let _guard = runq.state.lock();
    if !runq.set_idle(thread.clone()) {
        fatal!("{} already has an idle thread", cpu);
    }
    let sched = thread.sched();
    sched.insert(SchedFlags::IDLE | SchedFlags::RUNNING);
    sched.pin(cpu);
    sched.set_oncpu(cpu);
    thread.set_state(ThreadState::Running);
    runq.set_current(thread.clone());
}

// =============================================================================
// Switching
// =============================================================================

/// Give the CPU to the next runnable thread on the local queue
///
/// Returns immediately when the idle thread calls with nothing to run.
pub fn schedule() {
    if critical::in_critical() {
        fatal!(
            "schedule() inside a critical section (depth {})",
            critical::nesting()
        );
    }
    let cpu = mp::whoami();
    let runq = queue(cpu);
    let mut guard = runq.state.lock();
    let Some(prev) = runq.current() else {
        fatal!("{} has no current thread", cpu);
    };
    let Some(next) = queue::pick(&guard.list, cpu, Some(&prev), runq.idle()) else {
        if prev
            .sched()
            .flags()
            .intersects(SchedFlags::SLEEPING | SchedFlags::EXITING)
        {
            fatal!("nothing runnable on {}", cpu);
        }
        return;
    };

    if next.sched().queue() == Some(cpu) {
        guard.list.move_to_back(next.id());
    }
    if prev.sched().queue() == Some(cpu) {
        guard.list.move_to_back(prev.id());
    }
    prev.sched().remove(SchedFlags::RUNNING);
    if !prev.sched().contains(SchedFlags::SLEEPING) {
        prev.set_state(ThreadState::Runnable);
    }
    next.sched().insert(SchedFlags::RUNNING);
    next.sched().set_oncpu(cpu);
    next.set_state(ThreadState::Running);
    runq.set_current(next.clone());
    METRICS.record_context_switch(next.is_idle());
    log::trace!("sched: {} switches {} -> {}", cpu, prev.id(), next.id());

    let from: *const dyn ExecutionContext = prev.context();
    let to: *const dyn ExecutionContext = next.context();
    drop(next);
    SpinGuard::leak(guard);
    // SAFETY: `prev` is executing here and stays alive on this stack; `next`
    // is kept alive by the queue's current slot and is not executing.
    unsafe { kestrel_core::hal().contexts().switch(&*from, &*to) };
    switch_finish();
}

/// Complete a switch on the thread that was switched to
///
/// Releases the run-queue lock taken by the thread that switched away and
/// reaps a thread that exited on this CPU.
pub(crate) fn switch_finish() {
    let runq = queue(mp::whoami());
    // SAFETY: the switching thread left the lock held for us
    let zombie = unsafe { runq.state.data_unchecked() }.zombie.take();
    runq.state.raw().unlock();
    if let Some(zombie) = zombie {
        log::trace!("sched: reaped {} ({})", zombie.id(), zombie.name());
    }
}

/// Let other runnable threads on this CPU run
pub fn yield_now() {
    METRICS.record_yield();
    schedule();
}

/// Leave the calling thread for good
pub fn exit_current() -> ! {
    if critical::in_critical() {
        fatal!("thread exit inside a critical section");
    }
    let cpu = mp::whoami();
    let runq = queue(cpu);
    let Some(me) = runq.current() else {
        fatal!("{} has no current thread", cpu);
    };
    if me.is_idle() {
        fatal!("idle thread of {} cannot exit", cpu);
    }
    let held = me.held_locks();
    if !held.is_empty() {
        log::warn!("sched: {} exits holding {:?}", me.id(), held);
    }
    if let Err(err) = crate::thread::registry().unregister(me.id()) {
        log::warn!("sched: exiting {} was not registered: {}", me.id(), err);
    }
    crate::sync::sleepq::forget(me.id());

    let mut guard = runq.state.lock();
    if me.sched().queue() == Some(cpu) {
        runq.unlink(&mut guard.list, &me);
    }
    me.sched().insert(SchedFlags::EXITING);
    me.set_state(ThreadState::Exiting);
    let Some(next) = queue::pick(&guard.list, cpu, Some(&me), runq.idle()) else {
        fatal!("nothing runnable on {}", cpu);
    };
    me.sched().remove(SchedFlags::RUNNING);
    if next.sched().queue() == Some(cpu) {
        guard.list.move_to_back(next.id());
    }
    next.sched().insert(SchedFlags::RUNNING);
    next.sched().set_oncpu(cpu);
    next.set_state(ThreadState::Running);
    runq.set_current(next.clone());
    METRICS.record_exit();
    METRICS.record_context_switch(next.is_idle());
    log::debug!("sched: {} ({}) exits on {}", me.id(), me.name(), cpu);

    let from: *const dyn ExecutionContext = me.context();
    let to: *const dyn ExecutionContext = next.context();
    guard.zombie = Some(me);
    drop(next);
    SpinGuard::leak(guard);
    // SAFETY: the zombie slot keeps this thread alive until `next` has
    // taken over the CPU; `next` is kept alive by the current slot.
    unsafe { kestrel_core::hal().contexts().exit(&*from, &*to) }
}

// =============================================================================
// Queries
// =============================================================================

/// Thread running on the calling CPU
pub fn current_thread() -> Option<ThreadRef> {
    let cpu = kestrel_hal::try_hal()?.cpu().current_cpu_id()?;
    run_queue(cpu)?.current()
}

/// Threads linked into `cpu`'s queue
pub fn queue_length(cpu: CpuId) -> usize {
    run_queue(cpu).map_or(0, RunQueue::len)
}

/// Ids linked into `cpu`'s queue, head first
pub fn queue_snapshot(cpu: CpuId) -> Vec<ThreadId> {
    run_queue(cpu).map_or_else(Vec::new, |runq| runq.state.lock().list.ids())
}

/// Scheduler counters
pub fn metrics() -> &'static SchedulerMetrics {
    &METRICS
}
