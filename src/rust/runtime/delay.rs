// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative delays.
//!
//! Every delay is a loop of yields to the scheduler activated on the current thread, so a delay advances once per
//! update of that scheduler. The `*_with_stop` forms consult a [StopSignal] right before and right after each yield and
//! fail with `ECANCELED` when a stop was requested.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        SchedulerManager,
        Yield,
    },
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Source of cooperative stop requests.
pub trait StopSignal {
    fn is_stop_requested(&self) -> bool;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Stop signal that is never raised.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverStop;

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl StopSignal for NeverStop {
    fn is_stop_requested(&self) -> bool {
        false
    }
}

impl StopSignal for AtomicBool {
    fn is_stop_requested(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<S: StopSignal + ?Sized> StopSignal for Arc<S> {
    fn is_stop_requested(&self) -> bool {
        (**self).is_stop_requested()
    }
}

impl<S: StopSignal + ?Sized> StopSignal for &S {
    fn is_stop_requested(&self) -> bool {
        (**self).is_stop_requested()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends for `frames` updates of the activated scheduler. Zero completes right away.
pub async fn delay_frames(manager: Arc<SchedulerManager>, frames: usize) {
    for _ in 0..frames {
        Yield::to_activated(manager.clone()).await;
    }
}

/// Same as [delay_frames], stopping early when `stop` is raised.
pub async fn delay_frames_with_stop<S: StopSignal>(
    manager: Arc<SchedulerManager>,
    frames: usize,
    stop: S,
) -> Result<(), Fail> {
    for _ in 0..frames {
        checkpoint(&stop, "delay_frames_with_stop")?;
        Yield::to_activated(manager.clone()).await;
        checkpoint(&stop, "delay_frames_with_stop")?;
    }
    Ok(())
}

/// Yields until `duration` elapsed. A zero duration completes right away, [Duration::MAX] never does.
pub async fn wait_for(manager: Arc<SchedulerManager>, duration: Duration) {
    let start: Instant = Instant::now();
    while start.elapsed() < duration {
        Yield::to_activated(manager.clone()).await;
    }
}

/// Same as [wait_for], stopping early when `stop` is raised.
pub async fn wait_for_with_stop<S: StopSignal>(
    manager: Arc<SchedulerManager>,
    duration: Duration,
    stop: S,
) -> Result<(), Fail> {
    let start: Instant = Instant::now();
    while start.elapsed() < duration {
        checkpoint(&stop, "wait_for_with_stop")?;
        Yield::to_activated(manager.clone()).await;
        checkpoint(&stop, "wait_for_with_stop")?;
    }
    Ok(())
}

/// Yields until `deadline`. A deadline in the past completes right away.
pub async fn wait_until(manager: Arc<SchedulerManager>, deadline: Instant) {
    while Instant::now() < deadline {
        Yield::to_activated(manager.clone()).await;
    }
}

/// Same as [wait_until], stopping early when `stop` is raised.
pub async fn wait_until_with_stop<S: StopSignal>(
    manager: Arc<SchedulerManager>,
    deadline: Instant,
    stop: S,
) -> Result<(), Fail> {
    while Instant::now() < deadline {
        checkpoint(&stop, "wait_until_with_stop")?;
        Yield::to_activated(manager.clone()).await;
        checkpoint(&stop, "wait_until_with_stop")?;
    }
    Ok(())
}

fn checkpoint<S: StopSignal>(stop: &S, caller: &str) -> Result<(), Fail> {
    if stop.is_stop_requested() {
        trace!("{}(): stop requested", caller);
        return Err(Fail::cancelled("stop requested"));
    }
    Ok(())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
