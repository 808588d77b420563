// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::taskkit::{
    Config,
    SchedulerActivation,
    SchedulerId,
    TaskAllocator,
    TaskSystem,
};
use ::std::{
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Pause between two updates of a time-driven test loop.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for anything a test waits for.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task system with its first main-thread scheduler activated on the test thread.
pub struct Test {
    pub system: TaskSystem,
    scheduler_id: SchedulerId,
    activation: Option<SchedulerActivation>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Test {
    /// Task system without a thread pool.
    pub fn new() -> Self {
        Self::with_thread_pool(0)
    }

    pub fn with_thread_pool(thread_pool_size: usize) -> Self {
        Self::with_config(Config {
            main_thread_schedulers: 1,
            thread_pool_size,
            reserved_task_count: 16,
            allocator: TaskAllocator::pool(),
        })
    }

    pub fn with_config(config: Config) -> Self {
        let system: TaskSystem = match TaskSystem::initialize(config) {
            Ok(system) => system,
            Err(e) => panic!("failed to initialize the task system: {:?}", e),
        };
        let scheduler_id: SchedulerId = system.main_thread_scheduler_ids()[0];
        let activation: SchedulerActivation = system.activate_scheduler(scheduler_id);
        Self {
            system,
            scheduler_id,
            activation: Some(activation),
        }
    }

    pub fn scheduler_id(&self) -> SchedulerId {
        self.scheduler_id
    }

    /// Runs `frames` updates of the main-thread scheduler.
    pub fn run_scheduler(&self, frames: usize) {
        for _ in 0..frames {
            self.system.update_activated_scheduler();
        }
    }

    /// Keeps updating until `deadline`, then updates once more.
    pub fn run_scheduler_until(&self, deadline: Instant) {
        while Instant::now() < deadline {
            thread::sleep(CHECK_INTERVAL);
            self.run_scheduler(1);
        }
        self.run_scheduler(1);
    }

    /// Keeps updating while `pending` holds. Panics after [TEST_TIMEOUT].
    pub fn run_scheduler_while(&self, mut pending: impl FnMut() -> bool) {
        let deadline: Instant = Instant::now() + TEST_TIMEOUT;
        while pending() {
            assert!(Instant::now() < deadline, "timed out");
            self.run_scheduler(1);
            thread::yield_now();
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.system.pending_task_count(self.scheduler_id)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Test {
    fn drop(&mut self) {
        drop(self.activation.take());
        if !thread::panicking() {
            self.system.clone().shutdown();
        }
    }
}
