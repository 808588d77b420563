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
use ::std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
    time::Instant,
};
use ::taskkit::{
    Config,
    FrameAllocator,
    GlobalAllocator,
    PoolAllocator,
    Task,
    TaskAllocator,
    TaskSystem,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Frame allocator that counts what goes through it.
struct CountingAllocator<A> {
    inner: A,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<A: FrameAllocator> CountingAllocator<A> {
    fn new(inner: A) -> Arc<Self> {
        Arc::new(Self {
            inner,
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
        })
    }

    fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::SeqCst)
    }

    fn live(&self) -> usize {
        self.allocations() - self.deallocations()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<A: FrameAllocator> FrameAllocator for CountingAllocator<A> {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.inner.deallocate(ptr, layout) };
        self.deallocations.fetch_add(1, Ordering::SeqCst);
    }
}

//======================================================================================================================
// Helpers
//======================================================================================================================

fn counted_test<A: FrameAllocator + 'static>(inner: A, thread_pool_size: usize) -> (Test, Arc<CountingAllocator<A>>) {
    let counter: Arc<CountingAllocator<A>> = CountingAllocator::new(inner);
    let config: Config = Config {
        main_thread_schedulers: 1,
        thread_pool_size,
        reserved_task_count: 16,
        ..Config::default()
    }
    .with_allocator(TaskAllocator::from_arc(counter.clone()));
    (Test::with_config(config), counter)
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn every_task_frame_comes_from_the_configured_allocator() -> Result<()> {
    let (test, counter) = counted_test(GlobalAllocator, 0);

    let system: TaskSystem = test.system.clone();
    let tasks: Vec<Task<usize>> = (0..10)
        .map(|i| {
            let system: TaskSystem = system.clone();
            test.system.spawn(async move {
                system.yield_now().await;
                i
            })
        })
        .collect();
    taskkit::ensure_eq!(counter.allocations(), 10);
    taskkit::ensure_eq!(counter.live(), 10);

    test.run_scheduler(1);
    let sum: usize = tasks
        .into_iter()
        .map(|task| match task.try_get() {
            Ok(value) => value,
            Err(_) => panic!("task should be complete"),
        })
        .sum();
    taskkit::ensure_eq!(sum, 45);
    taskkit::ensure_eq!(counter.live(), 0);
    Ok(())
}

#[test]
fn forgotten_frames_are_released_on_completion() -> Result<()> {
    let (test, counter) = counted_test(PoolAllocator::new(), 0);

    let system: TaskSystem = test.system.clone();
    test.system
        .spawn(async move {
            system.delay_frames(3).await;
        })
        .forget();
    taskkit::ensure_eq!(counter.live(), 1);

    test.run_scheduler(2);
    taskkit::ensure_eq!(counter.live(), 1);

    test.run_scheduler(1);
    taskkit::ensure_eq!(counter.live(), 0);
    Ok(())
}

#[test]
fn dropped_handles_release_suspended_frames() -> Result<()> {
    let (test, counter) = counted_test(PoolAllocator::new(), 0);

    let system: TaskSystem = test.system.clone();
    let task: Task<()> = test.system.spawn(async move {
        system.delay_frames(10).await;
    });
    drop(task);

    // The queued wake-up still refers to the frame until the next update.
    test.run_scheduler(1);
    taskkit::ensure_eq!(counter.allocations(), 1);
    taskkit::ensure_eq!(counter.live(), 0);
    Ok(())
}

#[test]
fn frames_migrating_to_workers_are_released() -> Result<()> {
    let (test, counter) = counted_test(PoolAllocator::new(), 2);

    for _ in 0..16 {
        let system: TaskSystem = test.system.clone();
        test.system
            .spawn(async move {
                system.switch_to_thread_pool().await;
                system.yield_now().await;
            })
            .forget();
    }
    taskkit::ensure_eq!(counter.allocations(), 16);

    let deadline: Instant = Instant::now() + TEST_TIMEOUT;
    while counter.live() > 0 {
        assert!(Instant::now() < deadline, "timed out");
        thread::yield_now();
    }
    taskkit::ensure_eq!(counter.deallocations(), 16);
    Ok(())
}
