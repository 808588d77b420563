// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    scheduler::{
        SchedulerManager,
        Task,
        Yield,
    },
    TaskSystem,
};
use ::futures::FutureExt;
use ::parking_lot::Mutex;
use ::std::{
    convert,
    panic::{
        self,
        AssertUnwindSafe,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Group of tasks that can be raced. Implemented for tuples of two to four tasks.
pub trait WhenAny: Send + 'static {
    /// Output of the first task to complete, tagged with its position.
    type Output: Send + 'static;

    /// Starts the race on `system`.
    fn race(self, system: &TaskSystem) -> Task<Self::Output>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Result slot shared by the contestants of a race. The first one to claim it wins.
struct Race<O> {
    claimed: AtomicBool,
    winner: Mutex<Option<(usize, thread::Result<O>)>>,
}

/// Output of a race between two tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OneOf2<A, B> {
    First(A),
    Second(B),
}

/// Output of a race between three tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OneOf3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}

/// Output of a race between four tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OneOf4<A, B, C, D> {
    First(A),
    Second(B),
    Third(C),
    Fourth(D),
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<O> Race<O> {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            winner: Mutex::new(None),
        }
    }

    /// Stores the outcome of contestant `index` unless another one won already. Returns true on a win.
    fn offer(&self, index: usize, outcome: thread::Result<O>) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.winner.lock() = Some((index, outcome));
        true
    }

    fn take(&self) -> Option<(usize, thread::Result<O>)> {
        self.winner.lock().take()
    }
}

impl<A, B> OneOf2<A, B> {
    /// Position of the winning task.
    pub fn index(&self) -> usize {
        match self {
            Self::First(_) => 0,
            Self::Second(_) => 1,
        }
    }
}

impl<A, B, C> OneOf3<A, B, C> {
    /// Position of the winning task.
    pub fn index(&self) -> usize {
        match self {
            Self::First(_) => 0,
            Self::Second(_) => 1,
            Self::Third(_) => 2,
        }
    }
}

impl<A, B, C, D> OneOf4<A, B, C, D> {
    /// Position of the winning task.
    pub fn index(&self) -> usize {
        match self {
            Self::First(_) => 0,
            Self::Second(_) => 1,
            Self::Third(_) => 2,
            Self::Fourth(_) => 3,
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs `task` to completion and offers its outcome to `race`. A losing outcome, panic included, is dropped.
async fn contest<T, O>(race: Arc<Race<O>>, index: usize, task: Task<T>, wrap: fn(T) -> O) {
    let outcome: thread::Result<O> = AssertUnwindSafe(task).catch_unwind().await.map(wrap);
    if !race.offer(index, outcome) {
        trace!("contest(): lost the race (index={:?})", index);
    }
}

/// Yields to the activated scheduler until a contestant won, then hands out its output or re-raises its panic.
async fn settle<O>(manager: Arc<SchedulerManager>, race: Arc<Race<O>>) -> (usize, O) {
    loop {
        if let Some((index, outcome)) = race.take() {
            match outcome {
                Ok(output) => return (index, output),
                Err(payload) => panic::resume_unwind(payload),
            }
        }
        Yield::to_activated(manager.clone()).await;
    }
}

/// Races every task of `tasks`. Panics if `tasks` is empty.
pub(crate) fn race_all<T: Send + 'static>(system: &TaskSystem, tasks: Vec<Task<T>>) -> Task<(usize, T)> {
    assert!(!tasks.is_empty(), "cannot race an empty set of tasks");
    let race: Arc<Race<T>> = Arc::new(Race::new());
    for (index, task) in tasks.into_iter().enumerate() {
        system.spawn(contest(race.clone(), index, task, convert::identity::<T>)).forget();
    }
    system.spawn(settle(system.scheduler_manager(), race))
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

macro_rules! impl_when_any {
    ($one_of:ident; $($index:tt: $ty:ident => $variant:ident),+) => {
        impl<$($ty: Send + 'static),+> WhenAny for ($(Task<$ty>,)+) {
            type Output = $one_of<$($ty),+>;

            fn race(self, system: &TaskSystem) -> Task<Self::Output> {
                let race: Arc<Race<Self::Output>> = Arc::new(Race::new());
                $(
                    system.spawn(contest(race.clone(), $index, self.$index, $one_of::$variant)).forget();
                )+
                let manager: Arc<SchedulerManager> = system.scheduler_manager();
                system.spawn(async move { settle(manager, race).await.1 })
            }
        }
    };
}

impl_when_any!(OneOf2; 0: A => First, 1: B => Second);
impl_when_any!(OneOf3; 0: A => First, 1: B => Second, 2: C => Third);
impl_when_any!(OneOf4; 0: A => First, 1: B => Second, 2: C => Third, 3: D => Fourth);

//======================================================================================================================
// Unit Tests
//======================================================================================================================
