// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod raw;
mod state;

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod awaiter;
pub mod manager;
pub mod scheduler;
pub mod task;
pub mod thread_pool;
pub mod yielder;

pub use self::{
    awaiter::{
        custom_await,
        AwaitFuture,
        AwaitTransform,
        Awaiter,
    },
    manager::{
        SchedulerId,
        SchedulerManager,
    },
    scheduler::Scheduler,
    task::Task,
    thread_pool::ThreadPool,
    yielder::Yield,
};
