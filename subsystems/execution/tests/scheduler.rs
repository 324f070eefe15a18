//! Placement, pinning, idle fallback and thread lifetime.

mod common;

use common::{machine, run_kernel, serial, spawn_kernel, spawn_kernel_on, CPUS};
use kestrel_core::mp::{self, hokusai};
use kestrel_execution::scheduler::{self, yield_now};
use kestrel_execution::thread::{self, registry};
use kestrel_execution::{current_thread, ThreadState};
use kestrel_hal::CpuId;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const CPU2: CpuId = CpuId::new(2);
const CPU3: CpuId = CpuId::new(3);

#[test]
fn test_boot_brings_every_cpu_online() {
    let _serial = serial();
    machine();
    assert_eq!(mp::running_mask().count(), CPUS as u32);
    for index in 0..CPUS as u32 {
        let runq = scheduler::run_queue(CpuId::new(index)).expect("run queue");
        assert!(runq.is_attached());
        assert!(runq.idle().is_some_and(|idle| idle.is_idle()));
    }
}

#[test]
fn test_current_thread_is_the_caller() {
    let _serial = serial();
    machine();
    let seen = run_kernel("whoami", || {
        current_thread().map(|me| (me.name().to_owned(), me.state(), me.is_idle()))
    });
    assert_eq!(seen, Some(("whoami".to_owned(), ThreadState::Running, false)));
}

#[test]
fn test_pinned_thread_stays_on_its_cpu() {
    const YIELDS: usize = 50;
    let _serial = serial();
    machine();

    let (cpus, foreign, listed) = spawn_kernel_on("pinned", CPU2, || {
        let Some(me) = current_thread() else {
            return (BTreeSet::new(), true, false);
        };
        let mut cpus = BTreeSet::new();
        let mut foreign = false;
        for _ in 0..YIELDS {
            cpus.insert(mp::whoami());
            foreign |= (0..CPUS as u32)
                .map(CpuId::new)
                .filter(|cpu| *cpu != CPU2)
                .any(|cpu| scheduler::queue_snapshot(cpu).contains(&me.id()));
            yield_now();
        }
        let listed = registry().on_cpu(CPU2).iter().any(|t| t.id() == me.id());
        (cpus, foreign, listed)
    })
    .join();

    assert_eq!(cpus.into_iter().collect::<Vec<_>>(), vec![CPU2]);
    assert!(!foreign);
    assert!(listed);
}

#[test]
fn test_pinning_to_a_missing_cpu_fails() {
    let _serial = serial();
    machine();
    let refused = run_kernel("pin-missing", || {
        thread::spawn_pinned("nowhere", CpuId::new(CPUS as u32 + 1), || {}).err()
    });
    assert_eq!(refused, Some(kestrel_execution::ExecError::NoSuchCpu));
}

#[test]
fn test_lone_thread_yields_to_idle() {
    const YIELDS: u64 = 20;
    let _serial = serial();
    machine();

    let (before, after) = spawn_kernel_on("lonely", CPU3, || {
        let before = scheduler::metrics().idle_switches();
        for _ in 0..YIELDS {
            yield_now();
        }
        (before, scheduler::metrics().idle_switches())
    })
    .join();

    assert!(after - before >= YIELDS, "{} idle switches", after - before);
}

#[test]
fn test_threads_spread_over_cpus() {
    const THREADS: usize = 16;
    let _serial = serial();
    machine();
    let arrived = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let arrived = arrived.clone();
            spawn_kernel("spread", move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                while arrived.load(Ordering::SeqCst) < THREADS {
                    yield_now();
                }
                mp::whoami()
            })
        })
        .collect();
    let cpus: BTreeSet<CpuId> = workers.into_iter().map(|worker| worker.join()).collect();

    assert_eq!(cpus.len(), CPUS);
}

fn queue_lengths() -> Vec<usize> {
    (0..CPUS as u32)
        .map(|index| scheduler::queue_length(CpuId::new(index)))
        .collect()
}

#[test]
fn test_placement_keeps_queues_level() {
    const WORKERS: usize = 10;
    let _serial = serial();
    machine();

    let lengths = run_kernel("leveller", || {
        // Earlier threads may still be on their way out
        while queue_lengths().iter().sum::<usize>() > 1 {
            yield_now();
        }
        let arrived = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..WORKERS {
            let arrived = arrived.clone();
            let release = release.clone();
            thread::spawn("level-spinner", move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    yield_now();
                }
            })
            .expect("spawn spinner");
        }
        while arrived.load(Ordering::SeqCst) < WORKERS {
            yield_now();
        }
        let lengths = queue_lengths();
        release.store(true, Ordering::SeqCst);
        lengths
    });

    let (Some(&max), Some(&min)) = (lengths.iter().max(), lengths.iter().min()) else {
        panic!("no run queues");
    };
    assert_eq!(lengths.iter().sum::<usize>(), WORKERS + 1, "{lengths:?}");
    assert!(max - min <= 1, "{lengths:?}");
}

#[test]
fn test_exited_thread_leaves_registry() {
    let _serial = serial();
    machine();

    let (gone, exits) = run_kernel("reaper", || {
        let exits = scheduler::metrics().exits();
        let child = thread::spawn("short-lived", || {}).expect("spawn child");
        let id = child.id();
        drop(child);
        while registry().get(id).is_some() {
            yield_now();
        }
        (registry().get(id).is_none(), scheduler::metrics().exits() - exits)
    });

    assert!(gone);
    assert!(exits >= 1);
}

static RENDEZVOUS_HITS: AtomicUsize = AtomicUsize::new(0);
static RENDEZVOUS_SEEN: AtomicU64 = AtomicU64::new(0);

fn record_rendezvous(cpu: CpuId, arg: usize) {
    RENDEZVOUS_HITS.fetch_add(arg, Ordering::SeqCst);
    RENDEZVOUS_SEEN.fetch_or(1 << cpu.as_u32(), Ordering::SeqCst);
}

#[test]
fn test_rendezvous_from_a_thread() {
    let _serial = serial();
    machine();
    RENDEZVOUS_HITS.store(0, Ordering::SeqCst);
    RENDEZVOUS_SEEN.store(0, Ordering::SeqCst);

    let running = run_kernel("rendezvous", || {
        hokusai::synchronize(record_rendezvous, 1);
        mp::running_mask()
    });

    assert_eq!(RENDEZVOUS_HITS.load(Ordering::SeqCst), running.count() as usize);
    assert_eq!(RENDEZVOUS_SEEN.load(Ordering::SeqCst), running.bits());
}
