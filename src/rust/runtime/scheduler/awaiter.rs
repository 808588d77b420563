// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Extension point for suspension points that are not futures.
//!
//! An [Awaiter] is a three-step protocol: `await_ready` tells whether the result is already there, `await_suspend`
//! receives the waker of the suspended task, and `await_resume` produces the result once the task runs again. Waking the
//! waker resumes the task inline on the waking thread; handing it to a scheduler resumes the task on that scheduler's
//! next update instead.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
        Waker,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Custom suspension protocol.
pub trait Awaiter {
    type Output;

    /// Returns true if the task does not need to suspend.
    fn await_ready(&mut self) -> bool;

    /// Called once the task decided to suspend. The task resumes when `waker` is woken.
    fn await_suspend(&mut self, waker: Waker);

    /// Produces the result. Called exactly once, either right after a successful `await_ready` or after the task
    /// resumed.
    fn await_resume(self) -> Self::Output;
}

/// Conversion of a value into the awaiter that awaits it.
pub trait AwaitTransform {
    type Awaiter: Awaiter;

    fn into_awaiter(self) -> Self::Awaiter;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Future that drives an [Awaiter].
#[must_use = "futures do nothing unless awaited"]
pub struct AwaitFuture<A> {
    awaiter: Option<A>,
    suspended: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Awaits `value` through its awaiter.
pub fn custom_await<T: AwaitTransform>(value: T) -> AwaitFuture<T::Awaiter> {
    AwaitFuture {
        awaiter: Some(value.into_awaiter()),
        suspended: false,
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<A: Awaiter> AwaitTransform for A {
    type Awaiter = A;

    fn into_awaiter(self) -> Self::Awaiter {
        self
    }
}

impl<A: Awaiter> Future for AwaitFuture<A> {
    type Output = A::Output;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        let awaiter: &mut A = match self_.awaiter.as_mut() {
            Some(awaiter) => awaiter,
            None => panic!("awaiter polled after completion"),
        };

        if !self_.suspended && !awaiter.await_ready() {
            self_.suspended = true;
            awaiter.await_suspend(context.waker().clone());
            return Poll::Pending;
        }

        match self_.awaiter.take() {
            Some(awaiter) => Poll::Ready(awaiter.await_resume()),
            None => unreachable!(),
        }
    }
}

// The awaiter is never pinned.
impl<A> Unpin for AwaitFuture<A> {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
