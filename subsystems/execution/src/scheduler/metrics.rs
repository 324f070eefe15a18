//! # Scheduler Metrics
//!
//! Counters for scheduler activity, shared by every CPU.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Total context switches
    context_switches: AtomicU64,
    /// Switches into an idle thread
    idle_switches: AtomicU64,
    /// Sleeping threads made runnable
    wakeups: AtomicU64,
    /// Threads that went to sleep
    sleeps: AtomicU64,
    /// Total voluntary yields
    voluntary_yields: AtomicU64,
    /// Threads that exited
    exits: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            idle_switches: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            voluntary_yields: AtomicU64::new(0),
            exits: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self, to_idle: bool) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
        if to_idle {
            self.idle_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a wakeup
    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a thread going to sleep
    pub fn record_sleep(&self) {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a voluntary yield
    pub fn record_yield(&self) {
        self.voluntary_yields.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a thread exit
    pub fn record_exit(&self) {
        self.exits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total context switches
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Get switches into idle threads
    pub fn idle_switches(&self) -> u64 {
        self.idle_switches.load(Ordering::Relaxed)
    }

    /// Get wakeups
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }

    /// Get sleeps
    pub fn sleeps(&self) -> u64 {
        self.sleeps.load(Ordering::Relaxed)
    }

    /// Get voluntary yields
    pub fn voluntary_yields(&self) -> u64 {
        self.voluntary_yields.load(Ordering::Relaxed)
    }

    /// Get exits
    pub fn exits(&self) -> u64 {
        self.exits.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.context_switches.store(0, Ordering::Relaxed);
        self.idle_switches.store(0, Ordering::Relaxed);
        self.wakeups.store(0, Ordering::Relaxed);
        self.sleeps.store(0, Ordering::Relaxed);
        self.voluntary_yields.store(0, Ordering::Relaxed);
        self.exits.store(0, Ordering::Relaxed);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_switches_are_context_switches() {
        let metrics = SchedulerMetrics::new();
        metrics.record_context_switch(false);
        metrics.record_context_switch(true);
        metrics.record_yield();
        assert_eq!(metrics.context_switches(), 2);
        assert_eq!(metrics.idle_switches(), 1);
        assert_eq!(metrics.voluntary_yields(), 1);
        metrics.reset();
        assert_eq!(metrics.context_switches(), 0);
    }
}
