//! # Lock-Order Verifier
//!
//! Watches every mutex acquisition and stops the kernel on the first
//! ordering inversion, before the inversion can turn into a deadlock.
//!
//! Lock classes are identified by name and placed at levels of a forest:
//!
//! - a class first acquired with nothing held becomes a root at depth 0
//! - a class first acquired while holding others joins the child level of
//!   the deepest held class, one depth below it
//!
//! Acquiring a class whose depth is below that of a class already held
//! means the two have been taken in the opposite order before.
//!
//! Levels are never freed; the number of distinct lock names is expected
//! to stay bounded for the life of the kernel.
//!
//! Each thread tracks at most `WITNESS_MAX_HELD` classes. Acquisitions past
//! that are logged and left unchecked.

use crate::thread::Thread;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Two lock classes taken against their recorded order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inversion {
    /// Class being acquired
    pub acquiring: &'static str,
    /// Held class recorded deeper than `acquiring`
    pub held: &'static str,
}

#[derive(Debug)]
struct OrderLevel {
    depth: usize,
    child: Option<usize>,
}

/// Level assignment for every lock class seen so far
#[derive(Debug)]
pub struct OrderForest {
    levels: Vec<OrderLevel>,
    classes: BTreeMap<&'static str, usize>,
}

impl OrderForest {
    /// Create an empty forest
    pub const fn new() -> Self {
        Self {
            levels: Vec::new(),
            classes: BTreeMap::new(),
        }
    }

    /// Depth of `class`, if it has been placed
    pub fn depth(&self, class: &str) -> Option<usize> {
        self.classes.get(class).map(|&level| self.levels[level].depth)
    }

    /// Number of classes placed
    pub fn classes(&self) -> usize {
        self.classes.len()
    }

    fn place(&mut self, class: &'static str, held: &[&'static str]) -> usize {
        if let Some(&level) = self.classes.get(class) {
            return level;
        }
        let deepest = held
            .iter()
            .filter_map(|name| self.classes.get(name).copied())
            .max_by_key(|&level| self.levels[level].depth);
        let level = match deepest {
            None => self.push_level(0),
            Some(parent) => match self.levels[parent].child {
                Some(child) => child,
                None => {
                    let child = self.push_level(self.levels[parent].depth + 1);
                    self.levels[parent].child = Some(child);
                    child
                }
            },
        };
        self.classes.insert(class, level);
        level
    }

    fn push_level(&mut self, depth: usize) -> usize {
        self.levels.push(OrderLevel { depth, child: None });
        self.levels.len() - 1
    }

    /// Place `class` if new and check it against the classes held
    pub fn check(
        &mut self,
        class: &'static str,
        held: &[&'static str],
    ) -> Result<(), Inversion> {
        let level = self.place(class, held);
        let depth = self.levels[level].depth;
        for &name in held.iter().filter(|&&name| name != class) {
            if self.depth(name).is_some_and(|held_depth| depth < held_depth) {
                return Err(Inversion {
                    acquiring: class,
                    held: name,
                });
            }
        }
        Ok(())
    }
}

impl Default for OrderForest {
    fn default() -> Self {
        Self::new()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "witness")] {
        use kestrel_core::config::WITNESS_MAX_HELD;
        use kestrel_core::{fatal, SpinLocked};

        static FOREST: SpinLocked<OrderForest> = SpinLocked::new("witness", OrderForest::new());

        /// Check that `thread` may acquire `class` now
        pub fn check_order(thread: &Thread, class: &'static str) {
            let held = thread.held_locks();
            if held.contains(&class) {
                return;
            }
            let verdict = FOREST.lock().check(class, &held);
            if let Err(inversion) = verdict {
                fatal!(
                    "lock order reversal: {} acquires {} while holding {}",
                    thread.id(),
                    inversion.acquiring,
                    inversion.held
                );
            }
        }

        /// Note that `thread` now holds `class`
        ///
        /// Returns `false` when the held list is full. The acquisition then
        /// goes unchecked and its release must not be recorded.
        pub fn record_acquire(thread: &Thread, class: &'static str) -> bool {
            match thread.held().lock().push(class) {
                Ok(()) => true,
                Err(_) => {
                    log::warn!(
                        "witness: {} holds {} locks, not tracking {}",
                        thread.id(),
                        WITNESS_MAX_HELD,
                        class
                    );
                    false
                }
            }
        }

        /// Note that `thread` released `class`
        pub fn record_release(thread: &Thread, class: &'static str) {
            let mut held = thread.held().lock();
            match held.iter().rposition(|&name| name == class) {
                Some(index) => {
                    held.remove(index);
                }
                None => log::warn!("witness: {} released untracked {}", thread.id(), class),
            }
        }
    } else {
        /// Check that `thread` may acquire `class` now
        #[inline(always)]
        pub fn check_order(_thread: &Thread, _class: &'static str) {}

        /// Note that `thread` now holds `class`
        #[inline(always)]
        pub fn record_acquire(_thread: &Thread, _class: &'static str) -> bool {
            false
        }

        /// Note that `thread` released `class`
        #[inline(always)]
        pub fn record_release(_thread: &Thread, _class: &'static str) {}
    }
}

// =============================================================================
// Tests
// =============================================================================
