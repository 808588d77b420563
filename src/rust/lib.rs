// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod collections;
pub mod runtime;

pub use self::runtime::{
    combinator::{
        OneOf2,
        OneOf3,
        OneOf4,
        WhenAll,
        WhenAny,
    },
    config::Config,
    delay::{
        NeverStop,
        StopSignal,
    },
    fail::Fail,
    memory::{
        FrameAllocator,
        GlobalAllocator,
        PoolAllocator,
        TaskAllocator,
    },
    scheduler::{
        custom_await,
        AwaitFuture,
        AwaitTransform,
        Awaiter,
        Scheduler,
        SchedulerId,
        SchedulerManager,
        Task,
        ThreadPool,
        Yield,
    },
    SchedulerActivation,
    TaskSystem,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Bails out of the enclosing function with an error when both expressions differ.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let left = &$left;
        let right = &$right;
        if *left != *right {
            ::anyhow::bail!(
                "ensure_eq!({}, {}) failed (left={:?}, right={:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Bails out of the enclosing function with an error when both expressions are equal.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        let left = &$left;
        let right = &$right;
        if *left == *right {
            ::anyhow::bail!(
                "ensure_neq!({}, {}) failed (left={:?}, right={:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}
