//! # Thread States
//!
//! Thread state machine definition.

/// Thread state (unit-only for atomic storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ThreadState {
    /// Scheduling entry initialized, not linked to any queue
    #[default]
    Setup = 0,
    /// Linked into a run queue, waiting for a CPU
    Runnable = 1,
    /// Executing on a CPU
    Running = 2,
    /// Blocked in a sleep queue
    Sleeping = 3,
    /// Leaving for good
    Exiting = 4,
}

impl ThreadState {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Setup),
            1 => Some(Self::Runnable),
            2 => Some(Self::Running),
            3 => Some(Self::Sleeping),
            4 => Some(Self::Exiting),
            _ => None,
        }
    }

    /// Convert to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Check if thread can be scheduled
    pub fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Runnable | ThreadState::Running)
    }

    /// Check if thread is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self, ThreadState::Exiting)
    }

    /// Valid transitions from this state
    ///
    /// `Sleeping -> Running` is a wakeup that lands before the sleeper has
    /// given up its CPU.
    pub fn valid_transitions(&self) -> &'static [ThreadState] {
        match self {
            ThreadState::Setup => &[ThreadState::Runnable, ThreadState::Running],
            ThreadState::Runnable => &[ThreadState::Running, ThreadState::Sleeping],
            ThreadState::Running => &[
                ThreadState::Runnable,
                ThreadState::Sleeping,
                ThreadState::Exiting,
            ],
            ThreadState::Sleeping => &[ThreadState::Runnable, ThreadState::Running],
            ThreadState::Exiting => &[],
        }
    }

    /// Whether moving to `next` is legal
    pub fn can_become(&self, next: ThreadState) -> bool {
        *self == next || self.valid_transitions().contains(&next)
    }
}
