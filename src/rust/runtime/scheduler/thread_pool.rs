// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        manager::{
            SchedulerId,
            SchedulerManager,
        },
        scheduler::Scheduler,
    },
};
use ::parking_lot::{
    Condvar,
    Mutex,
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        OnceLock,
    },
    task::Waker,
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Sleep/wake signal of one worker.
#[derive(Default)]
struct WorkerSignal {
    lock: Mutex<()>,
    condvar: Condvar,
}

/// State shared between the pool and its workers.
struct PoolShared {
    running: AtomicBool,
    signals: Vec<Arc<WorkerSignal>>,
    /// Published once every worker scheduler exists. Workers stay parked until then.
    schedulers: OnceLock<Vec<(SchedulerId, Arc<Scheduler>)>>,
    start: (Mutex<bool>, Condvar),
}

/// Fixed set of worker threads, each one driving a scheduler of its own.
pub struct ThreadPool {
    manager: Arc<SchedulerManager>,
    shared: Arc<PoolShared>,
    ids: Vec<SchedulerId>,
    next: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WorkerSignal {
    fn notify(&self) {
        // Taking the lock orders this notification after the worker's predicate check.
        let _guard = self.lock.lock();
        self.condvar.notify_one();
    }
}

impl PoolShared {
    fn open_start_gate(&self) {
        let (lock, condvar) = &self.start;
        *lock.lock() = true;
        condvar.notify_all();
    }

    fn wait_start_gate(&self) {
        let (lock, condvar) = &self.start;
        let mut opened = lock.lock();
        while !*opened {
            condvar.wait(&mut opened);
        }
    }
}

impl ThreadPool {
    /// Spawns `worker_count` workers and registers one scheduler per worker in `manager`. Every scheduler id is known
    /// before this function returns, and no worker runs before that point.
    pub fn new(manager: Arc<SchedulerManager>, worker_count: usize, reserved: usize) -> Result<Self, Fail> {
        let shared: Arc<PoolShared> = Arc::new(PoolShared {
            running: AtomicBool::new(true),
            signals: (0..worker_count).map(|_| Arc::new(WorkerSignal::default())).collect(),
            schedulers: OnceLock::new(),
            start: (Mutex::new(false), Condvar::new()),
        });

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let spawned = thread::Builder::new().name(format!("taskkit-worker-{}", index)).spawn({
                let manager: Arc<SchedulerManager> = manager.clone();
                let shared: Arc<PoolShared> = shared.clone();
                move || Self::run_worker(manager, shared, index)
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("new(): failed to spawn worker (index={:?}, error={:?})", index, e);
                    // Workers find no schedulers and leave right away.
                    shared.running.store(false, Ordering::Release);
                    shared.open_start_gate();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Fail::from(e));
                },
            }
        }

        let schedulers: Vec<(SchedulerId, Arc<Scheduler>)> = handles
            .iter()
            .zip(shared.signals.iter())
            .map(|(handle, signal)| {
                let signal: Arc<WorkerSignal> = signal.clone();
                let id: SchedulerId = manager.create_scheduler_with_notify(
                    handle.thread().id(),
                    reserved,
                    Arc::new(move || signal.notify()),
                );
                (id, manager.scheduler(id))
            })
            .collect();
        let ids: Vec<SchedulerId> = schedulers.iter().map(|(id, _)| *id).collect();
        let _ = shared.schedulers.set(schedulers);
        shared.open_start_gate();
        debug!("new(): thread pool started (workers={:?})", worker_count);

        Ok(Self {
            manager,
            shared,
            ids,
            next: AtomicUsize::new(0),
            handles: Mutex::new(handles),
        })
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.ids.len()
    }

    /// Scheduler id of worker `worker`.
    pub fn scheduler_id(&self, worker: usize) -> SchedulerId {
        match self.ids.get(worker) {
            Some(id) => *id,
            None => panic!("invalid worker index (worker={:?}, count={:?})", worker, self.ids.len()),
        }
    }

    /// Scheduler ids of every worker, in worker order.
    pub fn scheduler_ids(&self) -> &[SchedulerId] {
        &self.ids
    }

    /// Schedules `waker` on the next worker, round robin.
    pub fn schedule(&self, waker: Waker) {
        self.next_scheduler().schedule(waker);
    }

    /// Schedules `waker` on worker `worker`. Panics after [shutdown](Self::shutdown).
    pub fn schedule_on(&self, worker: usize, waker: Waker) {
        self.worker_scheduler(worker).schedule(waker);
    }

    /// Picks the scheduler of the next worker, round robin. Panics after [shutdown](Self::shutdown).
    pub fn next_scheduler(&self) -> Arc<Scheduler> {
        assert!(!self.ids.is_empty(), "thread pool has no workers");
        let worker: usize = self.next.fetch_add(1, Ordering::Relaxed) % self.ids.len();
        self.worker_scheduler(worker)
    }

    /// Stops every worker once it has drained its queue, and waits for them. Idempotent.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        self.shared.running.store(false, Ordering::Release);
        for signal in self.shared.signals.iter() {
            signal.notify();
        }
        for handle in handles {
            // A worker that tears the pool down cannot wait for itself.
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("shutdown(): worker thread panicked");
            }
        }
        for id in self.ids.iter().filter(|id| id.thread() != thread::current().id()) {
            self.manager.destroy_scheduler(*id);
        }
        debug!("shutdown(): thread pool stopped (workers={:?})", self.ids.len());
    }

    /// Work handed over after shutdown would sit on a scheduler nobody updates anymore.
    fn worker_scheduler(&self, worker: usize) -> Arc<Scheduler> {
        assert!(
            self.shared.running.load(Ordering::Acquire),
            "thread pool used after shutdown (worker={:?})",
            worker
        );
        match self.shared.schedulers.get().and_then(|schedulers| schedulers.get(worker)) {
            Some((_, scheduler)) => scheduler.clone(),
            None => panic!("invalid worker index (worker={:?}, count={:?})", worker, self.ids.len()),
        }
    }

    fn run_worker(manager: Arc<SchedulerManager>, shared: Arc<PoolShared>, index: usize) {
        shared.wait_start_gate();
        let (id, scheduler): (SchedulerId, Arc<Scheduler>) =
            match shared.schedulers.get().and_then(|schedulers| schedulers.get(index)) {
                Some((id, scheduler)) => (*id, scheduler.clone()),
                None => return,
            };
        let signal: &WorkerSignal = &shared.signals[index];
        trace!("run_worker(): worker started (index={:?}, id={:?})", index, id);

        loop {
            {
                let mut guard = signal.lock.lock();
                while shared.running.load(Ordering::Acquire) && scheduler.pending_task_count() == 0 {
                    signal.condvar.wait(&mut guard);
                }
            }

            if !shared.running.load(Ordering::Acquire) && scheduler.pending_task_count() == 0 {
                break;
            }

            manager.activate_scheduler(id);
            manager.update_activated_scheduler();
            manager.deactivate_scheduler();
        }

        trace!("run_worker(): worker stopped (index={:?})", index);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool").field("ids", &self.ids).finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
