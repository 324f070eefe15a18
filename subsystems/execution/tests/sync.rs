//! Mutexes, condition variables and sleep queues under contention.

mod common;

use common::{machine, run_kernel, serial, spawn_kernel};
use kestrel_core::config::WITNESS_MAX_HELD;
use kestrel_core::SpinLocked;
use kestrel_execution::scheduler::yield_now;
use kestrel_execution::sync::{sleepq, CondVar, Cookie, Mutex, MutexFlags};
use kestrel_execution::thread;
use kestrel_execution::{current_thread, ThreadState};
use static_assertions::const_assert;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Mutexes
// =============================================================================

const WORKERS: u64 = 8;
const ROUNDS: u64 = 2_000;

#[test]
fn test_mutex_mutual_exclusion() {
    let _serial = serial();
    machine();
    let mutex = Arc::new(Mutex::new("counter", MutexFlags::empty()));
    let counter = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let mutex = mutex.clone();
            let counter = counter.clone();
            spawn_kernel("mutex-worker", move || {
                for round in 0..ROUNDS {
                    mutex.lock();
                    let seen = counter.load(Ordering::Relaxed);
                    if round % 128 == 0 {
                        yield_now();
                    }
                    counter.store(seen + 1, Ordering::Relaxed);
                    mutex.unlock();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join();
    }

    assert_eq!(counter.load(Ordering::Relaxed), WORKERS * ROUNDS);
    assert!(!mutex.is_locked());
}

#[test]
fn test_recursive_mutex_needs_matching_unlocks() {
    let _serial = serial();
    machine();
    let mutex = Arc::new(Mutex::new("recursive", MutexFlags::RECURSE));

    let (nest, blocked_while_held, contender_got_it) = run_kernel("recursive-owner", move || {
        let acquired = Arc::new(AtomicBool::new(false));
        mutex.lock();
        mutex.lock();
        let nest = mutex.nest();

        let contender_mutex = mutex.clone();
        let contender_flag = acquired.clone();
        thread::spawn("recursive-contender", move || {
            contender_mutex.lock();
            contender_flag.store(true, Ordering::SeqCst);
            contender_mutex.unlock();
        })
        .expect("spawn contender");

        mutex.unlock();
        for _ in 0..50 {
            yield_now();
        }
        let blocked = !acquired.load(Ordering::SeqCst);

        mutex.unlock();
        while !acquired.load(Ordering::SeqCst) {
            yield_now();
        }
        (nest, blocked, acquired.load(Ordering::SeqCst))
    });

    assert_eq!(nest, 1);
    assert!(blocked_while_held);
    assert!(contender_got_it);
}

#[test]
fn test_try_lock_fails_while_owned() {
    let _serial = serial();
    machine();
    let mutex = Arc::new(Mutex::new("try-lock", MutexFlags::empty()));

    let holder_mutex = mutex.clone();
    let (first, from_other, after_release) = run_kernel("try-lock-owner", move || {
        let first = holder_mutex.try_lock();
        let other_mutex = holder_mutex.clone();
        let other = spawn_helper(move || other_mutex.try_lock());
        let from_other = other.join_kernel();
        holder_mutex.unlock();
        let retry_mutex = holder_mutex.clone();
        let after = spawn_helper(move || {
            let got = retry_mutex.try_lock();
            if got {
                retry_mutex.unlock();
            }
            got
        });
        (first, from_other, after.join_kernel())
    });

    assert!(first);
    assert!(!from_other);
    assert!(after_release);
    assert!(!mutex.is_locked());
}

/// Result slot filled by a kernel thread and polled by another
struct Helper<T> {
    slot: Arc<SpinLocked<Option<T>>>,
}

impl<T: Send + 'static> Helper<T> {
    fn join_kernel(self) -> T {
        loop {
            if let Some(value) = self.slot.lock().take() {
                return value;
            }
            yield_now();
        }
    }
}

fn spawn_helper<T: Send + 'static>(body: impl FnOnce() -> T + Send + 'static) -> Helper<T> {
    let slot = Arc::new(SpinLocked::new("helper-slot", None));
    let filled = slot.clone();
    thread::spawn("helper", move || {
        let value = body();
        *filled.lock() = Some(value);
    })
    .expect("spawn helper");
    Helper { slot }
}

const DEPTH: usize = 20;
const NESTED: [&str; DEPTH] = [
    "nest-00", "nest-01", "nest-02", "nest-03", "nest-04", "nest-05", "nest-06", "nest-07",
    "nest-08", "nest-09", "nest-10", "nest-11", "nest-12", "nest-13", "nest-14", "nest-15",
    "nest-16", "nest-17", "nest-18", "nest-19",
];

#[test]
fn test_deep_nesting_outgrows_held_list() {
    let _serial = serial();
    machine();
    const_assert!(DEPTH > WITNESS_MAX_HELD);

    let (tracked, all_locked, released) = run_kernel("deep-nester", || {
        let mutexes: Vec<_> = NESTED
            .iter()
            .map(|&name| Mutex::new(name, MutexFlags::empty()))
            .collect();
        for mutex in &mutexes {
            mutex.lock();
        }
        let tracked = current_thread().map_or(0, |me| me.held_locks().len());
        let all_locked = mutexes.iter().all(|mutex| mutex.is_owned());
        for mutex in mutexes.iter().rev() {
            mutex.unlock();
        }
        let released = current_thread().map_or(usize::MAX, |me| me.held_locks().len());
        (tracked, all_locked, released)
    });

    assert!(all_locked);
    assert!(tracked <= WITNESS_MAX_HELD);
    assert_eq!(released, 0);
    assert_eq!(machine().fatal_report(), None);
}

// =============================================================================
// Condition variables
// =============================================================================

const VOLLEYS: u64 = 5_000;

struct Rally {
    cv: CondVar,
    turn: AtomicU64,
}

fn player(rally: &Rally, parity: u64) {
    let mutex = rally.cv.mutex();
    mutex.lock();
    for _ in 0..VOLLEYS {
        while rally.turn.load(Ordering::Relaxed) % 2 != parity {
            rally.cv.wait();
        }
        rally.turn.fetch_add(1, Ordering::Relaxed);
        rally.cv.signal();
    }
    mutex.unlock();
}

#[test]
fn test_condvar_ping_pong() {
    let _serial = serial();
    machine();
    let rally = Arc::new(Rally {
        cv: CondVar::new(Arc::new(Mutex::new("rally", MutexFlags::empty()))),
        turn: AtomicU64::new(0),
    });

    let ping_rally = rally.clone();
    let ping = spawn_kernel("ping", move || player(&ping_rally, 0));
    let pong_rally = rally.clone();
    let pong = spawn_kernel("pong", move || player(&pong_rally, 1));
    ping.join();
    pong.join();

    assert_eq!(rally.turn.load(Ordering::Relaxed), 2 * VOLLEYS);
}

#[test]
fn test_condvar_broadcast_releases_every_waiter() {
    const WAITERS: usize = 6;
    let _serial = serial();
    machine();
    let gate = Arc::new(CondVar::new(Arc::new(Mutex::new("gate", MutexFlags::empty()))));
    let open = Arc::new(AtomicBool::new(false));
    let parked = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let gate = gate.clone();
            let open = open.clone();
            let parked = parked.clone();
            spawn_kernel("gate-waiter", move || {
                gate.mutex().lock();
                parked.fetch_add(1, Ordering::SeqCst);
                while !open.load(Ordering::SeqCst) {
                    gate.wait();
                }
                gate.mutex().unlock();
            })
        })
        .collect();

    let opener_gate = gate.clone();
    run_kernel("gate-opener", move || {
        while parked.load(Ordering::SeqCst) < WAITERS {
            yield_now();
        }
        opener_gate.mutex().lock();
        open.store(true, Ordering::SeqCst);
        opener_gate.signal_broadcast();
        opener_gate.mutex().unlock();
    });
    for waiter in waiters {
        waiter.join();
    }
}

// =============================================================================
// Sleep queues
// =============================================================================

#[test]
fn test_signal_one_wakes_in_arrival_order() {
    const WAITERS: usize = 5;
    let _serial = serial();
    machine();

    let order = run_kernel("fifo-coordinator", || {
        let cookie = Cookie::fresh();
        let order = Arc::new(SpinLocked::new("fifo-order", Vec::new()));
        for index in 0..WAITERS {
            let order = order.clone();
            thread::spawn("fifo-waiter", move || {
                sleepq::enter(cookie);
                order.lock().push(index);
            })
            .expect("spawn waiter");
            while sleepq::waiters(cookie) <= index {
                yield_now();
            }
        }
        for woken in 1..=WAITERS {
            sleepq::signal_one(cookie);
            while order.lock().len() < woken {
                yield_now();
            }
        }
        let result = order.lock().clone();
        result
    });

    assert_eq!(order, (0..WAITERS).collect::<Vec<_>>());
}

#[test]
fn test_signal_wakes_all_waiters() {
    const WAITERS: usize = 8;
    let _serial = serial();
    machine();

    let (signalled, woken, leftover) = run_kernel("broadcast-coordinator", || {
        let cookie = Cookie::fresh();
        let woken = Arc::new(AtomicUsize::new(0));
        for _ in 0..WAITERS {
            let woken = woken.clone();
            thread::spawn("broadcast-waiter", move || {
                sleepq::enter(cookie);
                woken.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn waiter");
        }
        while sleepq::waiters(cookie) < WAITERS {
            yield_now();
        }
        let signalled = sleepq::signal(cookie);
        while woken.load(Ordering::SeqCst) < WAITERS {
            yield_now();
        }
        (signalled, woken.load(Ordering::SeqCst), sleepq::waiters(cookie))
    });

    assert_eq!(signalled, WAITERS);
    assert_eq!(woken, WAITERS);
    assert_eq!(leftover, 0);
}

#[test]
fn test_signal_without_waiters_is_lost() {
    let _serial = serial();
    machine();

    let (none, late) = run_kernel("lost-signal", || {
        let cookie = Cookie::fresh();
        let none = sleepq::signal_one(cookie);
        let woken = Arc::new(AtomicBool::new(false));
        let flag = woken.clone();
        thread::spawn("late-waiter", move || {
            sleepq::enter(cookie);
            flag.store(true, Ordering::SeqCst);
        })
        .expect("spawn waiter");
        while sleepq::waiters(cookie) == 0 {
            yield_now();
        }
        let late = woken.load(Ordering::SeqCst);
        sleepq::signal(cookie);
        while !woken.load(Ordering::SeqCst) {
            yield_now();
        }
        (none, late)
    });

    assert!(!none);
    assert!(!late);
}

#[test]
fn test_exiting_thread_drops_its_registration() {
    let _serial = serial();
    machine();

    let (state, leftover, signalled) = run_kernel("exit-coordinator", || {
        let cookie = Cookie::fresh();
        let quitter = thread::spawn("registered-quitter", move || {
            sleepq::prepare(cookie);
        })
        .expect("spawn quitter");
        while quitter.state() != ThreadState::Exiting {
            yield_now();
        }
        (quitter.state(), sleepq::waiters(cookie), sleepq::signal_one(cookie))
    });

    assert_eq!(state, ThreadState::Exiting);
    assert_eq!(leftover, 0);
    assert!(!signalled);
}
