// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our cooperative, per-thread scheduler.
//!
//! A scheduler is owned by exactly one thread, the only one allowed to [update](Scheduler::update) it. Work is handed
//! to the scheduler as [Waker]s. The owner thread appends to a plain vector, while every other thread goes through a
//! lock-free stack that the owner drains at the beginning of each update.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::collections::atomic_stack::{
    AtomicStack,
    StackLink,
};
use ::std::{
    cell::UnsafeCell,
    fmt,
    mem,
    panic::{
        self,
        AssertUnwindSafe,
    },
    ptr::NonNull,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    task::Waker,
    thread::{
        self,
        ThreadId,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callback invoked after work was scheduled from a foreign thread. Thread pool workers use it to leave their sleep.
pub type RemoteNotify = Arc<dyn Fn() + Send + Sync>;

/// Work scheduled from a foreign thread.
#[repr(C)]
struct RemoteEntry {
    link: StackLink,
    waker: Waker,
}

/// Task Scheduler
pub struct Scheduler {
    /// Thread that owns this scheduler.
    owner: ThreadId,
    /// Work to run on the next update. Owner thread only.
    next_run: UnsafeCell<Vec<Waker>>,
    /// Work being run by the current update. Owner thread only.
    in_progress: UnsafeCell<Vec<Waker>>,
    /// Length of `next_run`, readable from any thread.
    next_run_len: AtomicUsize,
    /// Work scheduled from foreign threads.
    remote: AtomicStack,
    /// Number of entries sitting in `remote`.
    remote_len: AtomicUsize,
    notify: Option<RemoteNotify>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    /// Creates a scheduler owned by `owner`, with room for `reserved` tasks before its buffers grow.
    pub fn new(owner: ThreadId, reserved: usize) -> Self {
        Self::build(owner, reserved, None)
    }

    /// Creates a scheduler that calls `notify` whenever a foreign thread schedules work on it.
    pub fn with_notify(owner: ThreadId, reserved: usize, notify: RemoteNotify) -> Self {
        Self::build(owner, reserved, Some(notify))
    }

    fn build(owner: ThreadId, reserved: usize, notify: Option<RemoteNotify>) -> Self {
        Self {
            owner,
            next_run: UnsafeCell::new(Vec::with_capacity(reserved)),
            in_progress: UnsafeCell::new(Vec::with_capacity(reserved)),
            next_run_len: AtomicUsize::new(0),
            remote: AtomicStack::new(),
            remote_len: AtomicUsize::new(0),
            notify,
        }
    }

    /// Thread that owns this scheduler.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Schedules `waker` to be woken on the next update. Safe to call from any thread.
    pub fn schedule(&self, waker: Waker) {
        if thread::current().id() == self.owner {
            // Safety: only the owner thread touches `next_run`, and no borrow of it outlives a method call.
            let next_run: &mut Vec<Waker> = unsafe { &mut *self.next_run.get() };
            next_run.push(waker);
            self.next_run_len.store(next_run.len(), Ordering::Release);
        } else {
            let entry: NonNull<RemoteEntry> = NonNull::from(Box::leak(Box::new(RemoteEntry {
                link: StackLink::new(),
                waker,
            })));
            // Count first, so that a concurrent drain never observes more entries than counted.
            self.remote_len.fetch_add(1, Ordering::AcqRel);
            unsafe { self.remote.push(entry.cast()) };
            if let Some(notify) = self.notify.as_ref() {
                notify();
            }
        }
    }

    /// Runs every piece of work scheduled so far, once. Work scheduled while updating is deferred to the next update.
    pub fn update(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "scheduler updated from a thread that does not own it"
        );

        // Safety: owner thread only, and the borrows end before any waker runs.
        let mut in_progress: Vec<Waker> = mem::take(unsafe { &mut *self.in_progress.get() });
        {
            let next_run: &mut Vec<Waker> = unsafe { &mut *self.next_run.get() };
            self.collect_remote(next_run);
            mem::swap(next_run, &mut in_progress);
            self.next_run_len.store(0, Ordering::Release);
        }

        {
            let mut pending = in_progress.drain(..);
            while let Some(waker) = pending.next() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| waker.wake())) {
                    // Work behind the panicking waker stays queued, ahead of anything scheduled since.
                    let requeued: Vec<Waker> = pending.by_ref().collect();
                    warn!("update(): waker panicked, requeuing remaining work (count={:?})", requeued.len());
                    let next_run: &mut Vec<Waker> = unsafe { &mut *self.next_run.get() };
                    next_run.splice(0..0, requeued);
                    self.next_run_len.store(next_run.len(), Ordering::Release);
                    panic::resume_unwind(payload);
                }
            }
        }

        // Keep the allocation around for the next update, unless a nested update already put one back.
        let slot: &mut Vec<Waker> = unsafe { &mut *self.in_progress.get() };
        if slot.capacity() < in_progress.capacity() {
            *slot = in_progress;
        }
    }

    /// Number of pieces of work waiting for the next update. Stale when other threads schedule concurrently.
    pub fn pending_task_count(&self) -> usize {
        self.next_run_len.load(Ordering::Acquire) + self.remote_len.load(Ordering::Acquire)
    }

    /// Moves every remotely scheduled entry to the back of `next_run`, in submission order.
    fn collect_remote(&self, next_run: &mut Vec<Waker>) {
        let start: usize = next_run.len();
        for link in self.remote.take_all() {
            let entry: Box<RemoteEntry> = unsafe { Box::from_raw(link.cast::<RemoteEntry>().as_ptr()) };
            next_run.push(entry.waker);
            self.remote_len.fetch_sub(1, Ordering::AcqRel);
        }
        // The stack hands entries back newest first.
        next_run[start..].reverse();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("owner", &self.owner)
            .field("pending", &self.pending_task_count())
            .finish()
    }
}

/// Dropping a scheduler drops every waker it still holds, which releases the tasks behind them.
impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut dropped: Vec<Waker> = mem::take(self.next_run.get_mut());
        dropped.append(self.in_progress.get_mut());
        for link in self.remote.take_all() {
            let entry: Box<RemoteEntry> = unsafe { Box::from_raw(link.cast::<RemoteEntry>().as_ptr()) };
            dropped.push(entry.waker);
        }
        if !dropped.is_empty() {
            debug!("drop(): discarding {} scheduled tasks (owner={:?})", dropped.len(), self.owner);
        }
    }
}

// Owner-only buffers are guarded by the owner thread check in `schedule()` and `update()`.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
