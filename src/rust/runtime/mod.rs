// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod combinator;
pub mod config;
pub mod delay;
pub mod fail;
pub mod logging;
pub mod memory;
pub mod scheduler;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    combinator::{
        WhenAll,
        WhenAny,
    },
    config::Config,
    delay::StopSignal,
    fail::Fail,
    memory::TaskAllocator,
    scheduler::{
        custom_await,
        AwaitFuture,
        AwaitTransform,
        SchedulerId,
        SchedulerManager,
        Task,
        ThreadPool,
        Yield,
    },
};
use ::futures::FutureExt;
use ::std::{
    fmt,
    future::Future,
    marker::PhantomData,
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
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// State behind a [TaskSystem].
struct TaskSystemInner {
    config: Config,
    manager: Arc<SchedulerManager>,
    thread_pool: Option<Arc<ThreadPool>>,
    /// Schedulers of the thread that initialized the task system.
    main_thread_scheduler_ids: Vec<SchedulerId>,
    shut_down: AtomicBool,
}

/// Entry point of the runtime: owns the scheduler registry, the main-thread schedulers, the thread pool and the frame
/// allocator. Clones share the same runtime. Every operation panics once the runtime was shut down.
#[derive(Clone)]
pub struct TaskSystem(Arc<TaskSystemInner>);

/// Keeps a scheduler activated on the current thread. The activation ends when the guard is dropped; guards must be
/// dropped in reverse activation order.
#[must_use = "the scheduler is deactivated when the guard is dropped"]
pub struct SchedulerActivation {
    manager: Arc<SchedulerManager>,
    id: SchedulerId,
    /// Activations belong to the thread that made them.
    _not_send: PhantomData<*const ()>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskSystem {
    /// Starts the runtime: creates the schedulers of the calling thread, which becomes the main thread, and the thread
    /// pool.
    pub fn initialize(config: Config) -> Result<Self, Fail> {
        logging::initialize();

        if config.main_thread_schedulers == 0 {
            let cause: &str = "at least one main thread scheduler is required";
            error!("initialize(): {:?}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }

        let manager: Arc<SchedulerManager> = Arc::new(SchedulerManager::new());
        let main_thread: thread::ThreadId = thread::current().id();
        let main_thread_scheduler_ids: Vec<SchedulerId> = (0..config.main_thread_schedulers)
            .map(|_| manager.create_scheduler(main_thread, config.reserved_task_count))
            .collect();

        let thread_pool: Option<Arc<ThreadPool>> = if config.thread_pool_size > 0 {
            match ThreadPool::new(manager.clone(), config.thread_pool_size, config.reserved_task_count) {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    error!("initialize(): failed to start the thread pool (error={:?})", e);
                    for id in main_thread_scheduler_ids {
                        manager.destroy_scheduler(id);
                    }
                    return Err(e);
                },
            }
        } else {
            None
        };

        debug!(
            "initialize(): task system started (main_thread_schedulers={:?}, thread_pool_size={:?}, allocator={:?})",
            config.main_thread_schedulers, config.thread_pool_size, config.allocator
        );
        Ok(Self(Arc::new(TaskSystemInner {
            config,
            manager,
            thread_pool,
            main_thread_scheduler_ids,
            shut_down: AtomicBool::new(false),
        })))
    }

    /// Stops the thread pool once its workers drained their queues, and destroys the main-thread schedulers along with
    /// the work still queued on them. Shutting down twice is a contract violation.
    pub fn shutdown(self) {
        let already_shut_down: bool = self.0.shut_down.swap(true, Ordering::AcqRel);
        assert!(!already_shut_down, "task system shut down twice");

        if let Some(pool) = self.0.thread_pool.as_ref() {
            pool.shutdown();
        }
        for id in self.0.main_thread_scheduler_ids.iter() {
            self.0.manager.destroy_scheduler(*id);
        }
        debug!("shutdown(): task system stopped");
    }

    fn inner(&self) -> &TaskSystemInner {
        assert!(!self.0.shut_down.load(Ordering::Acquire), "task system used after shutdown");
        &self.0
    }

    /// Starts `future` as a task. The task runs on the calling thread until it first suspends.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Task::spawn(future, &self.inner().config.allocator)
    }

    /// Returns a task that already completed.
    pub fn completed_task(&self) -> Task<()> {
        self.spawn(async {})
    }

    /// Suspends the awaiting task until the next update of the scheduler activated on the thread that runs it.
    pub fn yield_now(&self) -> Yield {
        Yield::to_activated(self.scheduler_manager())
    }

    /// Moves the awaiting task to the thread pool.
    pub fn switch_to_thread_pool(&self) -> Yield {
        match self.thread_pool() {
            Some(pool) => Yield::to_thread_pool(pool),
            None => panic!("the task system has no thread pool"),
        }
    }

    /// Moves the awaiting task to scheduler `id`.
    pub fn switch_to_scheduler(&self, id: SchedulerId) -> Yield {
        Yield::to_scheduler(self.inner().manager.scheduler(id))
    }

    /// Runs `f` on the thread pool and resumes the awaiting task on the scheduler that was activated when this
    /// function was called. A panic in `f` is re-raised after switching back.
    pub fn run_on_thread_pool<F, R>(&self, f: F) -> impl Future<Output = R> + Send + 'static
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_future_on_thread_pool(move || async move { f() })
    }

    /// Same as [TaskSystem::run_on_thread_pool] for a function that returns a future, a task included, which is
    /// awaited on the thread pool.
    pub fn run_future_on_thread_pool<F, Fut>(&self, f: F) -> impl Future<Output = Fut::Output> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let origin: SchedulerId = self.inner().manager.activated_scheduler_id();
        let system: TaskSystem = self.clone();
        async move {
            system.switch_to_thread_pool().await;
            let result: thread::Result<Fut::Output> = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
            system.switch_to_scheduler(origin).await;
            match result {
                Ok(output) => output,
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    }

    /// Joins a tuple of tasks.
    pub fn when_all<W: WhenAll>(&self, tasks: W) -> Task<W::Output> {
        self.spawn(tasks.join())
    }

    /// Joins every task of `tasks`, keeping their order.
    pub fn when_all_vec<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> Task<Vec<T>> {
        self.spawn(combinator::join_all(tasks))
    }

    /// Races a tuple of tasks. The race is settled on the scheduler activated on the calling thread.
    pub fn when_any<W: WhenAny>(&self, tasks: W) -> Task<W::Output> {
        tasks.race(self)
    }

    /// Races every task of `tasks` and returns the position and output of the winner. Panics if `tasks` is empty.
    pub fn when_any_vec<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> Task<(usize, T)> {
        combinator::race_all(self, tasks)
    }

    /// Suspends the awaiting task for `frames` updates.
    pub fn delay_frames(&self, frames: usize) -> impl Future<Output = ()> + Send + 'static {
        delay::delay_frames(self.scheduler_manager(), frames)
    }

    /// Suspends the awaiting task for `frames` updates, failing with `ECANCELED` once `stop` is raised.
    pub fn delay_frames_with_stop<S>(&self, frames: usize, stop: S) -> impl Future<Output = Result<(), Fail>>
    where
        S: StopSignal,
    {
        delay::delay_frames_with_stop(self.scheduler_manager(), frames, stop)
    }

    /// Suspends the awaiting task, one update at a time, until `duration` elapsed.
    pub fn wait_for(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        delay::wait_for(self.scheduler_manager(), duration)
    }

    pub fn wait_for_with_stop<S>(&self, duration: Duration, stop: S) -> impl Future<Output = Result<(), Fail>>
    where
        S: StopSignal,
    {
        delay::wait_for_with_stop(self.scheduler_manager(), duration, stop)
    }

    /// Suspends the awaiting task, one update at a time, until `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> impl Future<Output = ()> + Send + 'static {
        delay::wait_until(self.scheduler_manager(), deadline)
    }

    pub fn wait_until_with_stop<S>(&self, deadline: Instant, stop: S) -> impl Future<Output = Result<(), Fail>>
    where
        S: StopSignal,
    {
        delay::wait_until_with_stop(self.scheduler_manager(), deadline, stop)
    }

    /// Awaits `value` through its [Awaiter](scheduler::Awaiter).
    pub fn await_custom<T: AwaitTransform>(&self, value: T) -> AwaitFuture<T::Awaiter> {
        custom_await(value)
    }

    /// Activates scheduler `id` on the calling thread, which must own it.
    pub fn activate_scheduler(&self, id: SchedulerId) -> SchedulerActivation {
        let manager: Arc<SchedulerManager> = self.scheduler_manager();
        manager.activate_scheduler(id);
        SchedulerActivation {
            manager,
            id,
            _not_send: PhantomData,
        }
    }

    /// Runs one update of the scheduler activated on the calling thread.
    pub fn update_activated_scheduler(&self) {
        self.inner().manager.update_activated_scheduler();
    }

    /// Number of pieces of work waiting on scheduler `id`.
    pub fn pending_task_count(&self, id: SchedulerId) -> usize {
        self.inner().manager.pending_task_count(id)
    }

    /// Schedulers of the thread that initialized the task system.
    pub fn main_thread_scheduler_ids(&self) -> &[SchedulerId] {
        &self.inner().main_thread_scheduler_ids
    }

    pub fn scheduler_manager(&self) -> Arc<SchedulerManager> {
        self.inner().manager.clone()
    }

    pub fn thread_pool(&self) -> Option<Arc<ThreadPool>> {
        self.inner().thread_pool.clone()
    }

    /// Allocator of task frames.
    pub fn allocator(&self) -> &TaskAllocator {
        &self.inner().config.allocator
    }
}

impl SchedulerActivation {
    /// Activated scheduler.
    pub fn id(&self) -> SchedulerId {
        self.id
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for SchedulerActivation {
    fn drop(&mut self) {
        self.manager.deactivate_scheduler();
    }
}

impl Drop for TaskSystemInner {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            warn!("drop(): task system dropped without shutdown");
            if let Some(pool) = self.thread_pool.as_ref() {
                pool.shutdown();
            }
        }
    }
}

impl fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSystem")
            .field("main_thread_scheduler_ids", &self.0.main_thread_scheduler_ids)
            .field("thread_pool", &self.0.thread_pool)
            .field("shut_down", &self.0.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Debug for SchedulerActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerActivation").field("id", &self.id).finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
