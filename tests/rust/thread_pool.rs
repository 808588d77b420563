// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::common::{
    Test,
    TEST_TIMEOUT,
};
use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::futures::FutureExt;
use ::parking_lot::Mutex;
use ::std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        ThreadId,
    },
};
use ::taskkit::{
    SchedulerId,
    TaskSystem,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

fn worker_threads(system: &TaskSystem) -> HashSet<ThreadId> {
    match system.thread_pool() {
        Some(pool) => pool.scheduler_ids().iter().map(SchedulerId::thread).collect(),
        None => HashSet::new(),
    }
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn switch_moves_the_task_to_a_worker() -> Result<()> {
    let test: Test = Test::with_thread_pool(2);
    let (sender, receiver): (Sender<ThreadId>, Receiver<ThreadId>) = crossbeam_channel::unbounded();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn(async move {
            system.switch_to_thread_pool().await;
            let _ = sender.send(thread::current().id());
        })
        .forget();

    let resumed_on: ThreadId = receiver.recv_timeout(TEST_TIMEOUT)?;
    taskkit::ensure_neq!(resumed_on, thread::current().id());
    taskkit::ensure_eq!(worker_threads(&test.system).contains(&resumed_on), true);
    Ok(())
}

#[test]
fn switches_are_spread_round_robin() -> Result<()> {
    let test: Test = Test::with_thread_pool(3);
    let (sender, receiver): (Sender<(usize, ThreadId)>, Receiver<(usize, ThreadId)>) = crossbeam_channel::unbounded();

    for index in 0..4 {
        let system: TaskSystem = test.system.clone();
        let sender: Sender<(usize, ThreadId)> = sender.clone();
        test.system
            .spawn(async move {
                system.switch_to_thread_pool().await;
                let _ = sender.send((index, thread::current().id()));
            })
            .forget();
    }

    let mut threads: Vec<Option<ThreadId>> = vec![None; 4];
    for _ in 0..4 {
        let (index, thread): (usize, ThreadId) = receiver.recv_timeout(TEST_TIMEOUT)?;
        threads[index] = Some(thread);
    }

    let distinct: HashSet<Option<ThreadId>> = threads[..3].iter().copied().collect();
    taskkit::ensure_eq!(distinct.len(), 3);
    taskkit::ensure_eq!(threads[3], threads[0]);
    Ok(())
}

#[test]
fn switch_to_scheduler_targets_one_worker() -> Result<()> {
    let test: Test = Test::with_thread_pool(2);
    let target: SchedulerId = match test.system.thread_pool() {
        Some(pool) => pool.scheduler_id(1),
        None => anyhow::bail!("thread pool should exist"),
    };
    let (sender, receiver): (Sender<ThreadId>, Receiver<ThreadId>) = crossbeam_channel::unbounded();

    for _ in 0..3 {
        let system: TaskSystem = test.system.clone();
        let sender: Sender<ThreadId> = sender.clone();
        test.system
            .spawn(async move {
                system.switch_to_scheduler(target).await;
                let _ = sender.send(thread::current().id());
            })
            .forget();
    }

    for _ in 0..3 {
        taskkit::ensure_eq!(receiver.recv_timeout(TEST_TIMEOUT)?, target.thread());
    }
    Ok(())
}

#[test]
fn run_on_thread_pool_comes_back_to_the_caller() -> Result<()> {
    let test: Test = Test::with_thread_pool(2);
    let outcome: Arc<Mutex<Option<(ThreadId, usize, ThreadId)>>> = Arc::new(Mutex::new(None));

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let outcome: Arc<Mutex<Option<(ThreadId, usize, ThreadId)>>> = outcome.clone();
            async move {
                let (worker, value): (ThreadId, usize) =
                    system.run_on_thread_pool(|| (thread::current().id(), 6 * 7)).await;
                *outcome.lock() = Some((worker, value, thread::current().id()));
            }
        })
        .forget();

    test.run_scheduler_while(|| outcome.lock().is_none());
    let (worker, value, resumed_on) = match *outcome.lock() {
        Some(outcome) => outcome,
        None => anyhow::bail!("offloaded work should be complete"),
    };
    taskkit::ensure_eq!(value, 42);
    taskkit::ensure_eq!(worker_threads(&test.system).contains(&worker), true);
    taskkit::ensure_eq!(resumed_on, thread::current().id());
    Ok(())
}

#[test]
fn run_on_thread_pool_reraises_panics_on_the_caller() -> Result<()> {
    let test: Test = Test::with_thread_pool(1);
    let outcome: Arc<Mutex<Option<(bool, ThreadId)>>> = Arc::new(Mutex::new(None));

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let outcome: Arc<Mutex<Option<(bool, ThreadId)>>> = outcome.clone();
            async move {
                let offloaded = system.run_on_thread_pool(|| -> usize { panic!("offloaded failure") });
                let result = AssertUnwindSafe(offloaded).catch_unwind().await;
                *outcome.lock() = Some((result.is_err(), thread::current().id()));
            }
        })
        .forget();

    test.run_scheduler_while(|| outcome.lock().is_none());
    taskkit::ensure_eq!(*outcome.lock(), Some((true, thread::current().id())));
    Ok(())
}

#[test]
fn run_future_on_thread_pool_drives_the_future_on_a_worker() -> Result<()> {
    let test: Test = Test::with_thread_pool(2);
    let outcome: Arc<Mutex<Option<(ThreadId, ThreadId)>>> = Arc::new(Mutex::new(None));

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let outcome: Arc<Mutex<Option<(ThreadId, ThreadId)>>> = outcome.clone();
            async move {
                let offloaded: TaskSystem = system.clone();
                let worker: ThreadId = system
                    .run_future_on_thread_pool(move || async move {
                        // Yields land on the worker's scheduler.
                        offloaded.yield_now().await;
                        offloaded.yield_now().await;
                        thread::current().id()
                    })
                    .await;
                *outcome.lock() = Some((worker, thread::current().id()));
            }
        })
        .forget();

    test.run_scheduler_while(|| outcome.lock().is_none());
    let (worker, resumed_on) = match *outcome.lock() {
        Some(outcome) => outcome,
        None => anyhow::bail!("offloaded work should be complete"),
    };
    taskkit::ensure_eq!(worker_threads(&test.system).contains(&worker), true);
    taskkit::ensure_eq!(resumed_on, thread::current().id());
    Ok(())
}

#[test]
fn many_tasks_round_trip_through_the_pool() -> Result<()> {
    const TASK_COUNT: usize = 64;
    let test: Test = Test::with_thread_pool(4);
    let offloaded: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let returned: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let main_thread: ThreadId = thread::current().id();

    for _ in 0..TASK_COUNT {
        let system: TaskSystem = test.system.clone();
        let origin: SchedulerId = test.scheduler_id();
        let offloaded: Arc<AtomicUsize> = offloaded.clone();
        let returned: Arc<AtomicUsize> = returned.clone();
        test.system
            .spawn(async move {
                system.switch_to_thread_pool().await;
                if thread::current().id() != main_thread {
                    offloaded.fetch_add(1, Ordering::SeqCst);
                }
                system.switch_to_scheduler(origin).await;
                if thread::current().id() == main_thread {
                    returned.fetch_add(1, Ordering::SeqCst);
                }
            })
            .forget();
    }

    test.run_scheduler_while(|| returned.load(Ordering::SeqCst) < TASK_COUNT);
    taskkit::ensure_eq!(offloaded.load(Ordering::SeqCst), TASK_COUNT);
    taskkit::ensure_eq!(returned.load(Ordering::SeqCst), TASK_COUNT);
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

#[test]
fn shutdown_drains_queued_work() -> Result<()> {
    let test: Test = Test::with_thread_pool(2);
    let finished: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let system: TaskSystem = test.system.clone();
        let finished: Arc<AtomicUsize> = finished.clone();
        test.system
            .spawn(async move {
                system.switch_to_thread_pool().await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .forget();
    }

    drop(test);
    taskkit::ensure_eq!(finished.load(Ordering::SeqCst), 8);
    Ok(())
}

#[test]
#[should_panic(expected = "no thread pool")]
fn switch_without_thread_pool_panics() {
    let test: Test = Test::new();
    let _ = test.system.switch_to_thread_pool();
}
