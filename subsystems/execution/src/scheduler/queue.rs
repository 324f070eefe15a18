//! # Scheduler Run Queues
//!
//! One run queue per CPU. Threads are kept in an intrusive list keyed by
//! thread id: each link names its neighbours by id, so threads can be
//! removed or rotated to the tail without scanning.

use crate::thread::ThreadRef;
use crate::ThreadId;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kestrel_core::SpinLocked;
use kestrel_hal::CpuId;

#[derive(Debug)]
struct Link<T> {
    value: T,
    prev: Option<ThreadId>,
    next: Option<ThreadId>,
}

/// Doubly linked list of values keyed by thread id
#[derive(Debug)]
pub struct QueueList<T> {
    links: BTreeMap<ThreadId, Link<T>>,
    first: Option<ThreadId>,
    last: Option<ThreadId>,
}

impl<T> QueueList<T> {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            links: BTreeMap::new(),
            first: None,
            last: None,
        }
    }

    /// Number of linked entries
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether `id` is linked
    pub fn contains(&self, id: ThreadId) -> bool {
        self.links.contains_key(&id)
    }

    /// Head of the list
    pub fn first(&self) -> Option<ThreadId> {
        self.first
    }

    /// Append `id` at the tail; returns `false` if it is already linked
    pub fn push_back(&mut self, id: ThreadId, value: T) -> bool {
        if self.links.contains_key(&id) {
            return false;
        }
        let prev = self.last;
        if let Some(tail) = prev.and_then(|tail| self.links.get_mut(&tail)) {
            tail.next = Some(id);
        }
        self.links.insert(id, Link { value, prev, next: None });
        self.last = Some(id);
        if self.first.is_none() {
            self.first = Some(id);
        }
        true
    }

    /// Unlink `id`
    pub fn remove(&mut self, id: ThreadId) -> Option<T> {
        let link = self.links.remove(&id)?;
        match link.prev {
            Some(prev) => {
                if let Some(prev) = self.links.get_mut(&prev) {
                    prev.next = link.next;
                }
            }
            None => self.first = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(next) = self.links.get_mut(&next) {
                    next.prev = link.prev;
                }
            }
            None => self.last = link.prev,
        }
        Some(link.value)
    }

    /// Rotate `id` to the tail; returns `false` if it is not linked
    pub fn move_to_back(&mut self, id: ThreadId) -> bool {
        match self.remove(id) {
            Some(value) => self.push_back(id, value),
            None => false,
        }
    }

    /// Entries from head to tail
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.first,
        }
    }

    /// Ids from head to tail
    pub fn ids(&self) -> Vec<ThreadId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl<T> Default for QueueList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a [`QueueList`]
#[derive(Debug)]
pub struct Iter<'a, T> {
    list: &'a QueueList<T>,
    cursor: Option<ThreadId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (ThreadId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let link = self.list.links.get(&id)?;
        self.cursor = link.next;
        Some((id, &link.value))
    }
}

// =============================================================================
// Per-CPU run queue
// =============================================================================

/// State guarded by a run-queue lock
#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) list: QueueList<ThreadRef>,
    /// Thread that exited on this CPU, dropped once switched away from
    pub(crate) zombie: Option<ThreadRef>,
}

/// A CPU's run queue
#[derive(Debug)]
pub struct RunQueue {
    cpu: CpuId,
    pub(crate) state: SpinLocked<QueueState>,
    length: AtomicUsize,
    attached: AtomicBool,
    idle: spin::Once<ThreadRef>,
    current: spin::RwLock<Option<ThreadRef>>,
}

impl RunQueue {
    pub(crate) fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            state: SpinLocked::new(
                "runq",
                QueueState {
                    list: QueueList::new(),
                    zombie: None,
                },
            ),
            length: AtomicUsize::new(0),
            attached: AtomicBool::new(false),
            idle: spin::Once::new(),
            current: spin::RwLock::new(None),
        }
    }

    /// CPU owning this queue
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Linked threads, read without the lock
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    /// Whether no thread is linked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the CPU has joined the scheduler
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    /// The CPU's idle thread
    pub fn idle(&self) -> Option<&ThreadRef> {
        self.idle.get()
    }

    pub(crate) fn set_idle(&self, thread: ThreadRef) -> bool {
        let mut installed = false;
        self.idle.call_once(|| {
            installed = true;
            thread
        });
        installed
    }

    /// Thread running on the CPU
    pub fn current(&self) -> Option<ThreadRef> {
        self.current.read().clone()
    }

    pub(crate) fn set_current(&self, thread: ThreadRef) {
        *self.current.write() = Some(thread);
    }

    pub(crate) fn link(&self, list: &mut QueueList<ThreadRef>, thread: &ThreadRef) {
        if list.push_back(thread.id(), thread.clone()) {
            self.length.fetch_add(1, Ordering::Relaxed);
        }
        thread.sched().set_queue(Some(self.cpu));
    }

    pub(crate) fn unlink(&self, list: &mut QueueList<ThreadRef>, thread: &ThreadRef) {
        if list.remove(thread.id()).is_some() {
            self.length.fetch_sub(1, Ordering::Relaxed);
        }
        thread.sched().set_queue(None);
    }
}

/// CPU with the shortest queue; ties go to the lowest CPU id
pub fn least_loaded<I>(lengths: I) -> Option<CpuId>
where
    I: IntoIterator<Item = (CpuId, usize)>,
{
    lengths
        .into_iter()
        .min_by_key(|&(cpu, length)| (length, cpu))
        .map(|(cpu, _)| cpu)
}

/// Choose what `cpu` runs next
///
/// The first eligible thread in queue order wins. Failing that the idle
/// thread is chosen, unless it is the one already running.
pub(crate) fn pick(
    list: &QueueList<ThreadRef>,
    cpu: CpuId,
    current: Option<&ThreadRef>,
    idle: Option<&ThreadRef>,
) -> Option<ThreadRef> {
    if let Some((_, thread)) = list.iter().find(|(_, t)| t.sched().is_eligible(cpu)) {
        return Some(thread.clone());
    }
    match (idle, current) {
        (Some(idle), Some(current)) if Arc::ptr_eq(idle, current) => None,
        (idle, _) => idle.cloned(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedFlags;
    use crate::thread::testing::detached_thread;

    fn id(raw: u64) -> ThreadId {
        ThreadId::from_raw(raw)
    }

    #[test]
    fn test_list_order_and_removal() {
        let mut list = QueueList::new();
        for raw in 1..=4 {
            assert!(list.push_back(id(raw), raw));
        }
        assert!(!list.push_back(id(2), 99));
        assert_eq!(list.len(), 4);

        assert_eq!(list.remove(id(1)), Some(1));
        assert_eq!(list.remove(id(3)), Some(3));
        assert_eq!(list.remove(id(3)), None);
        assert_eq!(list.ids(), vec![id(2), id(4)]);
        assert_eq!(list.first(), Some(id(2)));

        assert_eq!(list.remove(id(4)), Some(4));
        assert_eq!(list.remove(id(2)), Some(2));
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert!(list.push_back(id(7), 7));
        assert_eq!(list.ids(), vec![id(7)]);
    }

    #[test]
    fn test_move_to_back_rotates() {
        let mut list = QueueList::new();
        for raw in 1..=3 {
            list.push_back(id(raw), ());
        }
        assert!(list.move_to_back(id(1)));
        assert_eq!(list.ids(), vec![id(2), id(3), id(1)]);
        assert!(list.move_to_back(id(1)));
        assert_eq!(list.ids(), vec![id(2), id(3), id(1)]);
        assert!(!list.move_to_back(id(9)));
    }

    #[test]
    fn test_least_loaded_ties_to_lowest() {
        let cpu = CpuId::new;
        assert_eq!(least_loaded([(cpu(2), 1), (cpu(0), 1), (cpu(1), 3)]), Some(cpu(0)));
        assert_eq!(least_loaded([(cpu(0), 4), (cpu(3), 0)]), Some(cpu(3)));
        assert_eq!(least_loaded(core::iter::empty()), None);
    }

    #[test]
    fn test_insertion_balances_queues() {
        const CPUS: usize = 4;
        for threads in [1usize, 5, 17, 64] {
            let mut lengths = [0usize; CPUS];
            for _ in 0..threads {
                let target = least_loaded(
                    lengths
                        .iter()
                        .enumerate()
                        .map(|(cpu, &length)| (CpuId::new(cpu as u32), length)),
                )
                .expect("queues exist");
                lengths[target.as_index()] += 1;
            }
            let max = lengths.iter().max().copied().unwrap_or(0);
            let min = lengths.iter().min().copied().unwrap_or(0);
            assert!(max - min <= 1, "{threads} threads gave {lengths:?}");
            assert_eq!(lengths.iter().sum::<usize>(), threads);
        }
    }

    #[test]
    fn test_pick_skips_running_and_sleeping() {
        let cpu = CpuId::new(0);
        let running = detached_thread("running");
        let sleeping = detached_thread("sleeping");
        let ready = detached_thread("ready");
        running.sched().insert(SchedFlags::RUNNING);
        sleeping.sched().insert(SchedFlags::SLEEPING);

        let mut list = QueueList::new();
        for thread in [&running, &sleeping, &ready] {
            list.push_back(thread.id(), thread.clone());
        }
        let next = pick(&list, cpu, Some(&running), None).expect("ready thread");
        assert!(Arc::ptr_eq(&next, &ready));
    }

    #[test]
    fn test_pick_honours_pinning() {
        let pinned = detached_thread("pinned");
        pinned.sched().pin(CpuId::new(1));
        let mut list = QueueList::new();
        list.push_back(pinned.id(), pinned.clone());

        assert!(pick(&list, CpuId::new(0), None, None).is_none());
        assert!(pick(&list, CpuId::new(1), None, None).is_some());
    }

    #[test]
    fn test_pick_falls_back_to_idle() {
        let cpu = CpuId::new(0);
        let idle = detached_thread("idle");
        idle.sched().insert(SchedFlags::IDLE | SchedFlags::PINNED);
        let worker = detached_thread("worker");
        worker.sched().insert(SchedFlags::RUNNING);
        let list = QueueList::new();

        let next = pick(&list, cpu, Some(&worker), Some(&idle)).expect("idle");
        assert!(Arc::ptr_eq(&next, &idle));
        // The idle thread never switches to itself
        assert!(pick(&list, cpu, Some(&idle), Some(&idle)).is_none());
        assert!(pick(&list, cpu, Some(&worker), None).is_none());
    }
}
