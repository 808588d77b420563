// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::{
    manager::SchedulerManager,
    raw,
    scheduler::Scheduler,
    thread_pool::ThreadPool,
};
use ::std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Where a suspended task goes next.
enum Target {
    /// The scheduler activated on the thread that polls the yield.
    Activated(Arc<SchedulerManager>),
    /// A given scheduler.
    Scheduler(Arc<Scheduler>),
    /// The next worker of a thread pool.
    ThreadPool(Arc<ThreadPool>),
}

/// Suspension point that hands the awaiting task over to a scheduler and completes when that scheduler resumes it.
///
/// Inside a runtime task, the hand-over happens once the task actually suspended, so the target scheduler never resumes
/// a task that is still being polled. Anywhere else the awaiting waker is scheduled right away.
#[must_use = "futures do nothing unless awaited"]
pub struct Yield {
    /// Taken by the first poll.
    target: Option<Target>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Yield {
    /// Yields to the scheduler activated on the polling thread. Panics at the first poll if there is none.
    pub fn to_activated(manager: Arc<SchedulerManager>) -> Self {
        Self::new(Target::Activated(manager))
    }

    /// Moves the awaiting task to `scheduler`.
    pub fn to_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self::new(Target::Scheduler(scheduler))
    }

    /// Moves the awaiting task to the next worker of `pool`, round robin.
    pub fn to_thread_pool(pool: Arc<ThreadPool>) -> Self {
        Self::new(Target::ThreadPool(pool))
    }

    fn new(target: Target) -> Self {
        Self { target: Some(target) }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for Yield {
    type Output = ();

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        let target: Target = match self_.target.take() {
            Some(target) => target,
            None => return Poll::Ready(()),
        };

        let scheduler: Arc<Scheduler> = match target {
            Target::Activated(manager) => manager.activated_scheduler(),
            Target::Scheduler(scheduler) => scheduler,
            Target::ThreadPool(pool) => pool.next_scheduler(),
        };
        if let Err(scheduler) = raw::defer_transfer(context.waker(), scheduler) {
            trace!("poll(): not polled by a runtime task, scheduling the waker directly");
            scheduler.schedule(context.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for Yield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target: &str = match self.target {
            Some(Target::Activated(_)) => "activated",
            Some(Target::Scheduler(_)) => "scheduler",
            Some(Target::ThreadPool(_)) => "thread pool",
            None => "done",
        };
        f.debug_struct("Yield").field("target", &target).finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
