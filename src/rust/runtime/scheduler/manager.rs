// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::scheduler::{
    RemoteNotify,
    Scheduler,
};
use ::parking_lot::RwLock;
use ::slab::Slab;
use ::std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    task::Waker,
    thread::{
        self,
        ThreadId,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identifies a scheduler by the thread that owns it and its index among the schedulers of that thread. An id is only
/// valid while its scheduler exists.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerId {
    thread: ThreadId,
    index: usize,
}

/// Schedulers of a single thread.
#[derive(Default)]
struct ThreadContext {
    schedulers: Slab<Arc<Scheduler>>,
    /// Indices of the activated schedulers, innermost activation last.
    activations: Vec<usize>,
}

/// Registry of every scheduler, grouped by owner thread, plus the activation stack of each thread.
#[derive(Default)]
pub struct SchedulerManager {
    contexts: RwLock<HashMap<ThreadId, ThreadContext>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedulerId {
    /// Thread that owns the scheduler.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Index of the scheduler among the ones of its thread.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl SchedulerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler owned by `thread`. May be called from any thread.
    pub fn create_scheduler(&self, thread: ThreadId, reserved: usize) -> SchedulerId {
        self.insert(thread, Scheduler::new(thread, reserved))
    }

    /// Same as [SchedulerManager::create_scheduler], for a scheduler that calls `notify` whenever it receives work from
    /// a foreign thread.
    pub fn create_scheduler_with_notify(&self, thread: ThreadId, reserved: usize, notify: RemoteNotify) -> SchedulerId {
        self.insert(thread, Scheduler::with_notify(thread, reserved, notify))
    }

    /// Removes a scheduler. Work still queued on it is released.
    pub fn destroy_scheduler(&self, id: SchedulerId) {
        let scheduler: Arc<Scheduler> = {
            let mut contexts = self.contexts.write();
            let context: &mut ThreadContext = match contexts.get_mut(&id.thread) {
                Some(context) if context.schedulers.contains(id.index) => context,
                _ => panic!("invalid scheduler id (id={:?})", id),
            };
            assert!(
                !context.activations.contains(&id.index),
                "cannot destroy an activated scheduler (id={:?})",
                id
            );
            let scheduler: Arc<Scheduler> = context.schedulers.remove(id.index);
            if context.schedulers.is_empty() {
                contexts.remove(&id.thread);
            }
            scheduler
        };
        trace!("destroy_scheduler(): id={:?}", id);
        // Released outside of the lock, since dropping queued work runs arbitrary code.
        drop(scheduler);
    }

    /// Returns the scheduler behind `id`.
    pub fn scheduler(&self, id: SchedulerId) -> Arc<Scheduler> {
        let contexts = self.contexts.read();
        match contexts.get(&id.thread).and_then(|context| context.schedulers.get(id.index)) {
            Some(scheduler) => scheduler.clone(),
            None => panic!("invalid scheduler id (id={:?})", id),
        }
    }

    /// Makes `id` the activated scheduler of the calling thread, which must own it. Activations nest.
    pub fn activate_scheduler(&self, id: SchedulerId) {
        let current: ThreadId = thread::current().id();
        assert_eq!(
            id.thread, current,
            "scheduler activated from a thread that does not own it (id={:?})",
            id
        );
        let mut contexts = self.contexts.write();
        match contexts.get_mut(&current) {
            Some(context) if context.schedulers.contains(id.index) => context.activations.push(id.index),
            _ => panic!("invalid scheduler id (id={:?})", id),
        }
    }

    /// Ends the innermost activation of the calling thread.
    pub fn deactivate_scheduler(&self) {
        let mut contexts = self.contexts.write();
        let popped: Option<usize> = contexts
            .get_mut(&thread::current().id())
            .and_then(|context| context.activations.pop());
        assert!(popped.is_some(), "no scheduler is activated on this thread");
    }

    /// Returns the activated scheduler of the calling thread, if any.
    pub fn try_activated_scheduler_id(&self) -> Option<SchedulerId> {
        let current: ThreadId = thread::current().id();
        let contexts = self.contexts.read();
        let index: usize = *contexts.get(&current)?.activations.last()?;
        Some(SchedulerId { thread: current, index })
    }

    /// Returns the activated scheduler of the calling thread.
    pub fn activated_scheduler_id(&self) -> SchedulerId {
        match self.try_activated_scheduler_id() {
            Some(id) => id,
            None => panic!("no scheduler is activated on this thread"),
        }
    }

    /// Returns the scheduler activated on the calling thread.
    pub fn activated_scheduler(&self) -> Arc<Scheduler> {
        let current: ThreadId = thread::current().id();
        let contexts = self.contexts.read();
        match contexts
            .get(&current)
            .and_then(|context| context.schedulers.get(*context.activations.last()?))
        {
            Some(scheduler) => scheduler.clone(),
            None => panic!("no scheduler is activated on this thread"),
        }
    }

    /// Updates the scheduler activated on the calling thread.
    pub fn update_activated_scheduler(&self) {
        // The registry lock is released before running any work.
        self.activated_scheduler().update();
    }

    /// Schedules `waker` on the scheduler behind `id`. Safe to call from any thread.
    pub fn schedule(&self, id: SchedulerId, waker: Waker) {
        self.scheduler(id).schedule(waker);
    }

    /// Number of pieces of work waiting on the scheduler behind `id`.
    pub fn pending_task_count(&self, id: SchedulerId) -> usize {
        self.scheduler(id).pending_task_count()
    }

    /// Returns true if `thread` owns at least one scheduler.
    pub fn has_schedulers(&self, thread: ThreadId) -> bool {
        self.contexts
            .read()
            .get(&thread)
            .map_or(false, |context| !context.schedulers.is_empty())
    }

    fn insert(&self, thread: ThreadId, scheduler: Scheduler) -> SchedulerId {
        let mut contexts = self.contexts.write();
        let index: usize = contexts.entry(thread).or_default().schedulers.insert(Arc::new(scheduler));
        let id: SchedulerId = SchedulerId { thread, index };
        trace!("create_scheduler(): id={:?}", id);
        id
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulerId({:?}, {})", self.thread, self.index)
    }
}

impl fmt::Debug for SchedulerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contexts = self.contexts.read();
        f.debug_struct("SchedulerManager")
            .field("threads", &contexts.len())
            .field(
                "schedulers",
                &contexts.values().map(|context| context.schedulers.len()).sum::<usize>(),
            )
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
