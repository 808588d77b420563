// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::common::Test;
use ::anyhow::Result;
use ::futures::FutureExt;
use ::parking_lot::Mutex;
use ::std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    task::Waker,
    time::{
        Duration,
        Instant,
    },
};
use ::taskkit::{
    Awaiter,
    Fail,
    SchedulerId,
    SchedulerManager,
    Task,
    TaskSystem,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn load(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Increments `counter`, yields once, increments it again.
fn yield_between(system: &TaskSystem, counter: &Arc<AtomicUsize>) -> Task<()> {
    let system_: TaskSystem = system.clone();
    let counter: Arc<AtomicUsize> = counter.clone();
    system.spawn(async move {
        bump(&counter);
        system_.yield_now().await;
        bump(&counter);
    })
}

//======================================================================================================================
// Lifecycle
//======================================================================================================================

#[test]
fn task_starts_eagerly() -> Result<()> {
    let test: Test = Test::new();
    let executed: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let task: Task<()> = test.system.spawn({
        let executed: Arc<AtomicBool> = executed.clone();
        async move { executed.store(true, Ordering::SeqCst) }
    });
    taskkit::ensure_eq!(executed.load(Ordering::SeqCst), true);
    taskkit::ensure_eq!(task.is_ready(), true);
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

#[test]
fn awaited_value_is_returned() -> Result<()> {
    let test: Test = Test::new();
    let result: Arc<AtomicUsize> = counter();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let result: Arc<AtomicUsize> = result.clone();
            async move {
                let value: usize = system.spawn(async { 42 }).await;
                result.store(value, Ordering::SeqCst);
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&result), 42);
    Ok(())
}

#[test]
fn forgotten_task_keeps_running() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let steps: Arc<AtomicUsize> = steps.clone();
            async move {
                bump(&steps);
                system.yield_now().await;
                bump(&steps);
                system.yield_now().await;
                bump(&steps);
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&steps), 1);

    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&steps), 2);

    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&steps), 3);
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

#[test]
fn forgotten_task_releases_its_state_on_completion() -> Result<()> {
    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            bump(&self.0);
        }
    }

    let test: Test = Test::new();
    let dropped: Arc<AtomicUsize> = counter();
    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let object: DropCounter = DropCounter(dropped.clone());
            async move {
                let _object: DropCounter = object;
                system.yield_now().await;
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&dropped), 0);

    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&dropped), 1);
    Ok(())
}

#[test]
fn dropped_handle_destroys_a_suspended_task() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();

    let task: Task<()> = yield_between(&test.system, &steps);
    taskkit::ensure_eq!(test.pending_task_count(), 1);
    drop(task);

    // The scheduler still holds the waker, which no longer resumes anything.
    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&steps), 1);
    Ok(())
}

#[test]
fn try_get_hands_back_running_tasks() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();

    let task: Task<()> = match yield_between(&test.system, &steps).try_get() {
        Ok(()) => anyhow::bail!("task should still be running"),
        Err(task) => task,
    };
    test.run_scheduler(1);
    taskkit::ensure_eq!(task.try_get().is_ok(), true);
    Ok(())
}

#[test]
fn completed_task_is_ready() -> Result<()> {
    let test: Test = Test::new();
    taskkit::ensure_eq!(test.system.completed_task().is_ready(), true);
    Ok(())
}

#[test]
fn multiple_yields_advance_once_per_update() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let steps: Arc<AtomicUsize> = steps.clone();
            async move {
                for _ in 0..5 {
                    bump(&steps);
                    system.yield_now().await;
                }
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&steps), 1);

    for i in 1..5 {
        test.run_scheduler(1);
        taskkit::ensure_eq!(load(&steps), i + 1);
    }
    test.run_scheduler(1);
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

//======================================================================================================================
// Chaining
//======================================================================================================================

#[test]
fn chained_tasks_complete_within_one_update() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let steps: Arc<AtomicUsize> = steps.clone();
            async move {
                bump(&steps);
                yield_between(&system, &steps).await;
                bump(&steps);
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&steps), 2);

    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&steps), 4);
    Ok(())
}

#[test]
fn long_await_chains_complete_without_nesting() -> Result<()> {
    const LINKS: usize = 100_000;
    let test: Test = Test::new();

    let system: TaskSystem = test.system.clone();
    let mut last: Task<usize> = test.system.spawn(async move {
        system.yield_now().await;
        0
    });
    for _ in 1..LINKS {
        let previous: Task<usize> = last;
        last = test.system.spawn(async move { previous.await + 1 });
    }
    taskkit::ensure_eq!(last.is_ready(), false);

    // Every link resumes within the update that completes the first one.
    test.run_scheduler(1);
    match last.try_get() {
        Ok(value) => taskkit::ensure_eq!(value, LINKS - 1),
        Err(_) => anyhow::bail!("the whole chain should have completed"),
    }
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

#[test]
fn panics_propagate_through_await() -> Result<()> {
    let test: Test = Test::new();
    let caught: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    // Nobody observes the panic of a forgotten task.
    let system: TaskSystem = test.system.clone();
    let failing = move |system: TaskSystem| async move {
        system.yield_now().await;
        panic!("task failure");
    };
    test.system.spawn(failing(system.clone())).forget();
    test.run_scheduler(1);

    test.system
        .spawn({
            let caught: Arc<AtomicBool> = caught.clone();
            async move {
                let inner: Task<()> = system.spawn(failing(system.clone()));
                let result = AssertUnwindSafe(inner).catch_unwind().await;
                caught.store(result.is_err(), Ordering::SeqCst);
            }
        })
        .forget();
    taskkit::ensure_eq!(caught.load(Ordering::SeqCst), false);

    test.run_scheduler(1);
    taskkit::ensure_eq!(caught.load(Ordering::SeqCst), true);
    Ok(())
}

//======================================================================================================================
// Delays
//======================================================================================================================

#[test]
fn delay_of_zero_frames_completes_immediately() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let steps: Arc<AtomicUsize> = steps.clone();
            async move {
                bump(&steps);
                system.delay_frames(0).await;
                bump(&steps);
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&steps), 2);
    Ok(())
}

#[test]
fn delay_frames_counts_updates() -> Result<()> {
    let test: Test = Test::new();
    let one: Arc<AtomicUsize> = counter();
    let three: Arc<AtomicUsize> = counter();

    for (steps, frames) in [(one.clone(), 1), (three.clone(), 3)] {
        let system: TaskSystem = test.system.clone();
        test.system
            .spawn(async move {
                bump(&steps);
                system.delay_frames(frames).await;
                bump(&steps);
            })
            .forget();
    }
    taskkit::ensure_eq!((load(&one), load(&three)), (1, 1));

    test.run_scheduler(1);
    taskkit::ensure_eq!((load(&one), load(&three)), (2, 1));

    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&three), 1);

    test.run_scheduler(1);
    taskkit::ensure_eq!(load(&three), 2);
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

#[test]
fn wait_for_elapses_the_duration() -> Result<()> {
    let test: Test = Test::new();
    let steps: Arc<AtomicUsize> = counter();
    let start: Instant = Instant::now();

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn({
            let steps: Arc<AtomicUsize> = steps.clone();
            async move {
                bump(&steps);
                system.wait_for(Duration::from_millis(100)).await;
                bump(&steps);
            }
        })
        .forget();
    taskkit::ensure_eq!(load(&steps), 1);

    test.run_scheduler_while(|| load(&steps) < 2);
    taskkit::ensure_eq!(start.elapsed() >= Duration::from_millis(100), true);
    Ok(())
}

#[test]
fn wait_for_tracks_each_task_separately() -> Result<()> {
    let test: Test = Test::new();
    let short: Arc<AtomicUsize> = counter();
    let long: Arc<AtomicUsize> = counter();
    let start: Instant = Instant::now();

    for (steps, millis) in [(short.clone(), 50), (long.clone(), 100)] {
        let system: TaskSystem = test.system.clone();
        test.system
            .spawn(async move {
                bump(&steps);
                system.wait_for(Duration::from_millis(millis)).await;
                bump(&steps);
            })
            .forget();
    }
    taskkit::ensure_eq!((load(&short), load(&long)), (1, 1));

    test.run_scheduler_while(|| load(&short) < 2);
    let long_steps: usize = load(&long);
    if start.elapsed() < Duration::from_millis(100) {
        taskkit::ensure_eq!(long_steps, 1);
    }

    test.run_scheduler_while(|| load(&long) < 2);
    taskkit::ensure_eq!(start.elapsed() >= Duration::from_millis(100), true);
    Ok(())
}

#[test]
fn wait_until_a_past_deadline_completes_immediately() -> Result<()> {
    let test: Test = Test::new();
    let task: Task<()> = test.system.spawn(test.system.wait_until(Instant::now()));
    taskkit::ensure_eq!(task.is_ready(), true);

    let task: Task<()> = test.system.spawn(test.system.wait_for(Duration::ZERO));
    taskkit::ensure_eq!(task.is_ready(), true);
    Ok(())
}

#[test]
fn wait_until_a_future_deadline_suspends() -> Result<()> {
    let test: Test = Test::new();
    let deadline: Instant = Instant::now() + Duration::from_millis(100);

    let task: Task<()> = test.system.spawn(test.system.wait_until(deadline));
    taskkit::ensure_eq!(task.is_ready(), false);

    test.run_scheduler_until(deadline);
    taskkit::ensure_eq!(task.is_ready(), true);
    Ok(())
}

#[test]
fn wait_for_the_longest_duration_never_elapses() -> Result<()> {
    let test: Test = Test::new();
    let stop: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let forever: Task<()> = test.system.spawn(test.system.wait_for(Duration::MAX));
    let stoppable: Task<Result<(), Fail>> = test
        .system
        .spawn(test.system.wait_for_with_stop(Duration::MAX, stop.clone()));
    test.run_scheduler(3);
    taskkit::ensure_eq!(forever.is_ready(), false);
    taskkit::ensure_eq!(stoppable.is_ready(), false);
    taskkit::ensure_eq!(test.pending_task_count(), 2);

    stop.store(true, Ordering::SeqCst);
    test.run_scheduler(1);
    match stoppable.try_get() {
        Ok(result) => taskkit::ensure_eq!(result.map_err(|e| e.errno), Err(libc::ECANCELED)),
        Err(_) => anyhow::bail!("stopped wait should have completed"),
    }
    taskkit::ensure_eq!(forever.is_ready(), false);
    Ok(())
}

#[test]
fn stop_request_cancels_a_delay() -> Result<()> {
    let test: Test = Test::new();
    let stop: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let task: Task<Result<(), Fail>> = test.system.spawn(test.system.delay_frames_with_stop(5, stop.clone()));
    test.run_scheduler(1);
    taskkit::ensure_eq!(task.is_ready(), false);

    stop.store(true, Ordering::SeqCst);
    test.run_scheduler(1);
    match task.try_get() {
        Ok(Err(e)) => taskkit::ensure_eq!(e.is_cancelled(), true),
        Ok(Ok(())) => anyhow::bail!("delay should have been cancelled"),
        Err(_) => anyhow::bail!("delay should have completed"),
    }
    Ok(())
}

#[test]
fn stop_is_checked_before_the_first_yield() -> Result<()> {
    let test: Test = Test::new();
    let stop: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));

    let delay: Task<Result<(), Fail>> = test.system.spawn(test.system.delay_frames_with_stop(3, stop.clone()));
    let wait: Task<Result<(), Fail>> = test
        .system
        .spawn(test.system.wait_for_with_stop(Duration::from_secs(60), stop.clone()));
    // No yield, no checkpoint.
    let nothing: Task<Result<(), Fail>> = test.system.spawn(test.system.delay_frames_with_stop(0, stop));

    for task in [delay, wait] {
        match task.try_get() {
            Ok(result) => taskkit::ensure_eq!(result.map_err(|e| e.errno), Err(libc::ECANCELED)),
            Err(_) => anyhow::bail!("stopped delay should complete right away"),
        }
    }
    match nothing.try_get() {
        Ok(result) => taskkit::ensure_eq!(result.is_ok(), true),
        Err(_) => anyhow::bail!("empty delay should complete right away"),
    }
    taskkit::ensure_eq!(test.pending_task_count(), 0);
    Ok(())
}

//======================================================================================================================
// Custom Awaiters
//======================================================================================================================

/// Resumes the awaiting task on a given scheduler.
struct ResumeOn {
    manager: Arc<SchedulerManager>,
    id: SchedulerId,
    resumed: Arc<Mutex<bool>>,
}

impl Awaiter for ResumeOn {
    type Output = &'static str;

    fn await_ready(&mut self) -> bool {
        false
    }

    fn await_suspend(&mut self, waker: Waker) {
        self.manager.schedule(self.id, waker);
    }

    fn await_resume(self) -> Self::Output {
        *self.resumed.lock() = true;
        "resumed"
    }
}

#[test]
fn custom_awaiter_resumes_through_the_scheduler() -> Result<()> {
    let test: Test = Test::new();
    let resumed: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));

    let awaiter: ResumeOn = ResumeOn {
        manager: test.system.scheduler_manager(),
        id: test.scheduler_id(),
        resumed: resumed.clone(),
    };
    let system: TaskSystem = test.system.clone();
    let task: Task<&'static str> = test.system.spawn(async move { system.await_custom(awaiter).await });
    taskkit::ensure_eq!(*resumed.lock(), false);
    taskkit::ensure_eq!(test.pending_task_count(), 1);

    test.run_scheduler(1);
    taskkit::ensure_eq!(*resumed.lock(), true);
    match task.try_get() {
        Ok(value) => taskkit::ensure_eq!(value, "resumed"),
        Err(_) => anyhow::bail!("task should be complete"),
    }
    Ok(())
}
