// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::Task;
use ::std::future::Future;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Group of tasks that can be joined. Implemented for tuples of one to eight tasks.
pub trait WhenAll: Send + 'static {
    /// Outputs of every task, in declaration order.
    type Output: Send + 'static;

    /// Awaits every task in declaration order. The first panic met in that order is re-raised, and the tasks that
    /// were not awaited yet are destroyed.
    fn join(self) -> impl Future<Output = Self::Output> + Send + 'static;
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Awaits every task of `tasks`, in vector order.
pub async fn join_all<T: Send + 'static>(tasks: Vec<Task<T>>) -> Vec<T> {
    let mut outputs: Vec<T> = Vec::with_capacity(tasks.len());
    for task in tasks {
        outputs.push(task.await);
    }
    outputs
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

macro_rules! impl_when_all {
    ($($task:ident: $ty:ident),+) => {
        impl<$($ty: Send + 'static),+> WhenAll for ($(Task<$ty>,)+) {
            type Output = ($($ty,)+);

            fn join(self) -> impl Future<Output = Self::Output> + Send + 'static {
                let ($($task,)+) = self;
                async move { ($($task.await,)+) }
            }
        }
    };
}

impl_when_all!(t0: T0);
impl_when_all!(t0: T0, t1: T1);
impl_when_all!(t0: T0, t1: T1, t2: T2);
impl_when_all!(t0: T0, t1: T1, t2: T2, t3: T3);
impl_when_all!(t0: T0, t1: T1, t2: T2, t3: T3, t4: T4);
impl_when_all!(t0: T0, t1: T1, t2: T2, t3: T3, t4: T4, t5: T5);
impl_when_all!(t0: T0, t1: T1, t2: T2, t3: T3, t4: T4, t5: T5, t6: T6);
impl_when_all!(t0: T0, t1: T1, t2: T2, t3: T3, t4: T4, t5: T5, t6: T6, t7: T7);

//======================================================================================================================
// Unit Tests
//======================================================================================================================
