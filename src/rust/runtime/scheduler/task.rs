// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    memory::TaskAllocator,
    scheduler::raw::RawTask,
};
use ::futures::future::FusedFuture;
use ::std::{
    fmt,
    future::Future,
    marker::PhantomData,
    mem::ManuallyDrop,
    panic,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle to an eagerly started task producing a `T`.
///
/// The handle owns the task: dropping it destroys a task that has not completed yet, and discards the result of one
/// that has. Awaiting the handle yields the result, or re-raises the panic that ended the task. A task that should run
/// to completion on its own must be [forgotten](Task::forget).
#[must_use = "dropping a task handle destroys the task; call forget() to let it run"]
pub struct Task<T> {
    raw: RawTask,
    /// Set once the result was taken out.
    consumed: bool,
    _marker: PhantomData<T>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: Send + 'static> Task<T> {
    /// Allocates a task for `future` from `allocator` and polls it once on the calling thread.
    pub(crate) fn spawn<F>(future: F, allocator: &TaskAllocator) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let raw: RawTask = RawTask::allocate(future, allocator);
        // Safety: tasks start in the running state, and the handle's reference outlives the call.
        unsafe { raw.run() };
        Self {
            raw,
            consumed: false,
            _marker: PhantomData,
        }
    }
}

impl<T> Task<T> {
    /// Returns true if the task completed and its result can be taken without suspending.
    pub fn is_ready(&self) -> bool {
        !self.consumed && self.raw.state().is_complete()
    }

    /// Takes the result of a completed task, or gives the handle back if the task is still running. Re-raises the
    /// panic that ended the task, if any.
    pub fn try_get(mut self) -> Result<T, Task<T>> {
        if !self.is_ready() {
            return Err(self);
        }
        Ok(self.take_output())
    }

    /// Lets the task run to completion on its own. Its result, or its panic, is discarded.
    pub fn forget(self) {
        let this: ManuallyDrop<Self> = ManuallyDrop::new(self);
        // Safety: the handle's reference is released exactly once, here.
        unsafe { this.raw.forget_handle() };
    }

    fn take_output(&mut self) -> T {
        assert!(!self.consumed, "task result already taken");
        self.consumed = true;
        // Safety: the type parameter matches the future's output, and callers checked for completion.
        match unsafe { self.raw.read_output::<T>() } {
            Some(Ok(value)) => value,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("complete task without an outcome"),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        assert!(!self_.consumed, "task polled after its result was taken");
        if self_.raw.poll_join(cx.waker()) {
            Poll::Ready(self_.take_output())
        } else {
            Poll::Pending
        }
    }
}

impl<T> FusedFuture for Task<T> {
    fn is_terminated(&self) -> bool {
        self.consumed
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // Safety: the handle's reference is released exactly once, here.
        unsafe { self.raw.drop_handle() };
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.raw.state())
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl<T> Unpin for Task<T> {}

// The handle only hands out `T` by value.
unsafe impl<T: Send> Send for Task<T> {}
unsafe impl<T: Send> Sync for Task<T> {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
