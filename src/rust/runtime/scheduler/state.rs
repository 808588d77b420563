// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    fmt,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// The task is being polled, or is claimed by the thread that destroys it.
const RUNNING: usize = 1 << 0;
/// The task was resumed while it was running and must be polled again.
const NOTIFIED: usize = 1 << 1;
/// The task reached its final state. Its outcome, if any, sits in the stage.
const COMPLETE: usize = 1 << 2;
/// A continuation waker is stored in the header.
const CONTINUATION: usize = 1 << 3;
/// The task handle was dropped.
const CLOSED: usize = 1 << 4;
/// The task handle was forgotten.
const FORGOTTEN: usize = 1 << 5;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle state of a task frame.
pub struct State(AtomicUsize);

/// Copy of the lifecycle state at some point in time.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Snapshot(usize);

/// What a resumption should do.
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionToRunning {
    /// The caller claimed the task and must poll it.
    Run,
    /// Nothing to do: the task is running elsewhere (and was notified) or it is done.
    Skip,
}

/// Outcome of leaving the running state after a poll returned pending.
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionToIdle {
    /// The task is idle.
    Idle,
    /// The task was notified while running. The caller still owns it and must poll again.
    Repoll,
    /// The handle was dropped while running. The caller still owns the task and must destroy it.
    Closed,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl State {
    /// Initial state: tasks start running right away.
    pub fn new() -> Self {
        Self(AtomicUsize::new(RUNNING))
    }

    pub fn load(&self) -> Snapshot {
        Snapshot(self.0.load(Ordering::Acquire))
    }

    /// Applies `f` until the compare-and-swap succeeds, or until `f` gives up.
    fn fetch_update<R>(&self, mut f: impl FnMut(Snapshot) -> (Option<Snapshot>, R)) -> R {
        let mut current: Snapshot = self.load();
        loop {
            let (next, result) = f(current);
            let Some(next) = next else {
                return result;
            };
            match self
                .0
                .compare_exchange_weak(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return result,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }

    pub fn transition_to_running(&self) -> TransitionToRunning {
        self.fetch_update(|current| {
            if current.is_complete() || current.is_closed() {
                (None, TransitionToRunning::Skip)
            } else if current.is_running() {
                (Some(Snapshot(current.0 | NOTIFIED)), TransitionToRunning::Skip)
            } else {
                (Some(Snapshot(current.0 | RUNNING)), TransitionToRunning::Run)
            }
        })
    }

    /// Called by the poller before every poll.
    pub fn clear_notified(&self) {
        self.0.fetch_and(!NOTIFIED, Ordering::AcqRel);
    }

    /// Leaves the running state. When `repoll` is false, a pending notification is dropped.
    pub fn transition_to_idle(&self, repoll: bool) -> TransitionToIdle {
        self.fetch_update(|current| {
            debug_assert!(current.is_running());
            if current.is_closed() {
                (None, TransitionToIdle::Closed)
            } else if repoll && current.is_notified() {
                (Some(Snapshot(current.0 & !NOTIFIED)), TransitionToIdle::Repoll)
            } else {
                (Some(Snapshot(current.0 & !(RUNNING | NOTIFIED))), TransitionToIdle::Idle)
            }
        })
    }

    /// Marks the task as complete and returns the previous state.
    pub fn transition_to_complete(&self) -> Snapshot {
        Snapshot(self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some((current | COMPLETE) & !(RUNNING | NOTIFIED))
        }).unwrap_or_else(|current| current))
    }

    /// Marks the handle as dropped and returns the previous state.
    pub fn transition_to_closed(&self) -> Snapshot {
        Snapshot(self.0.fetch_or(CLOSED, Ordering::AcqRel))
    }

    /// Marks the handle as forgotten and returns the previous state.
    pub fn transition_to_forgotten(&self) -> Snapshot {
        Snapshot(self.0.fetch_or(FORGOTTEN, Ordering::AcqRel))
    }

    /// Claims an idle, unfinished task so that it can be destroyed. Returns true on success.
    pub fn try_claim(&self) -> bool {
        self.fetch_update(|current| {
            if current.is_running() || current.is_complete() {
                (None, false)
            } else {
                (Some(Snapshot(current.0 | RUNNING)), true)
            }
        })
    }

    /// Publishes the continuation slot. Fails if the task completed in the meantime.
    pub fn set_continuation(&self) -> Result<(), Snapshot> {
        self.fetch_update(|current| {
            if current.is_complete() {
                (None, Err(current))
            } else {
                (Some(Snapshot(current.0 | CONTINUATION)), Ok(()))
            }
        })
    }

    /// Takes the continuation slot back. Fails if the task completed in the meantime.
    pub fn unset_continuation(&self) -> Result<(), Snapshot> {
        self.fetch_update(|current| {
            if current.is_complete() {
                (None, Err(current))
            } else {
                (Some(Snapshot(current.0 & !CONTINUATION)), Ok(()))
            }
        })
    }
}

impl Snapshot {
    pub fn is_running(self) -> bool {
        self.0 & RUNNING != 0
    }

    pub fn is_notified(self) -> bool {
        self.0 & NOTIFIED != 0
    }

    pub fn is_complete(self) -> bool {
        self.0 & COMPLETE != 0
    }

    pub fn has_continuation(self) -> bool {
        self.0 & CONTINUATION != 0
    }

    pub fn is_closed(self) -> bool {
        self.0 & CLOSED != 0
    }

    pub fn is_forgotten(self) -> bool {
        self.0 & FORGOTTEN != 0
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("running", &self.is_running())
            .field("notified", &self.is_notified())
            .field("complete", &self.is_complete())
            .field("continuation", &self.has_continuation())
            .field("closed", &self.is_closed())
            .field("forgotten", &self.is_forgotten())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
