// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Type-erased task frames.
//!
//! A frame is a single allocation obtained from a [TaskAllocator]. It starts with a [Header] (lifecycle state,
//! reference count, vtable, continuation, deferred transfer) followed by the stage, which holds the future while it
//! runs and its outcome once it finishes. The task handle and every [Waker] created for the task hold one reference
//! each; the frame is released when the last one goes away.
//!
//! Waking a task's waker resumes the task inline, on the waking thread. Yield and switch points do not enqueue the
//! task themselves: they leave a transfer in the header, and the poller enqueues the task once the poll returned and
//! the task is idle again. This way, no other thread can resume a task before it actually suspended.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    memory::TaskAllocator,
    scheduler::{
        scheduler::Scheduler,
        state::{
            Snapshot,
            State,
            TransitionToIdle,
            TransitionToRunning,
        },
    },
};
use ::std::{
    alloc::Layout,
    any::Any,
    cell::{
        RefCell,
        UnsafeCell,
    },
    collections::VecDeque,
    future::Future,
    mem::{
        self,
        ManuallyDrop,
    },
    panic::{
        self,
        AssertUnwindSafe,
    },
    pin::Pin,
    ptr::{
        self,
        NonNull,
    },
    sync::{
        atomic::{
            self,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    task::{
        Context,
        Poll,
        RawWaker,
        RawWakerVTable,
        Waker,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Result of a task body: its value, or the payload of the panic that interrupted it.
pub type Outcome<T> = Result<T, Box<dyn Any + Send + 'static>>;

/// Operations that depend on the concrete future type.
struct Vtable {
    /// Polls the future. Returns true once the outcome is stored.
    poll: unsafe fn(NonNull<Header>, &mut Context<'_>) -> bool,
    /// Drops the future or the outcome, whichever is there.
    drop_stage: unsafe fn(NonNull<Header>),
    /// Moves the outcome into `dst`, an `Option<Outcome<T>>`.
    read_output: unsafe fn(NonNull<Header>, *mut ()),
    /// Releases the frame.
    dealloc: unsafe fn(NonNull<Header>),
}

/// Type-independent part of a frame.
#[repr(C)]
struct Header {
    state: State,
    refs: AtomicUsize,
    vtable: &'static Vtable,
    /// Waker of whoever awaits the task. Written by the awaiter while the continuation bit is clear.
    continuation: UnsafeCell<Option<Waker>>,
    /// Scheduler to enqueue the task on once the current poll returns. Poller only.
    transfer: UnsafeCell<Option<Arc<Scheduler>>>,
    allocator: ManuallyDrop<TaskAllocator>,
}

enum Stage<F: Future> {
    Running(F),
    Finished(Outcome<F::Output>),
    Consumed,
}

#[repr(C)]
struct Cell<F: Future> {
    header: Header,
    stage: UnsafeCell<Stage<F>>,
}

/// Non-owning pointer to a frame. Reference counting is explicit.
#[derive(Clone, Copy)]
pub struct RawTask {
    ptr: NonNull<Header>,
}

/// Held by the outermost run on a thread. Continuations of tasks completing underneath it are resumed by it, one after
/// the other, instead of nesting one run per awaiting task.
struct ContinuationScope;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Identifies the wakers of runtime tasks.
static WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(clone_waker, wake_by_val, wake_by_ref, drop_waker);

thread_local! {
    /// Continuations waiting for the outermost run of this thread. `None` outside of any run.
    static CONTINUATIONS: RefCell<Option<VecDeque<Waker>>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<F> Cell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    const VTABLE: Vtable = Vtable {
        poll: Self::poll,
        drop_stage: Self::drop_stage,
        read_output: Self::read_output,
        dealloc: Self::dealloc,
    };

    unsafe fn stage<'a>(ptr: NonNull<Header>) -> &'a mut Stage<F> {
        // Safety: the caller owns the running state, or holds the only access to a complete task's outcome.
        unsafe { &mut *ptr.cast::<Cell<F>>().as_ref().stage.get() }
    }

    unsafe fn poll(ptr: NonNull<Header>, cx: &mut Context<'_>) -> bool {
        let stage: &mut Stage<F> = unsafe { Self::stage(ptr) };
        let future: Pin<&mut F> = match stage {
            // Safety: the frame never moves.
            Stage::Running(future) => unsafe { Pin::new_unchecked(future) },
            _ => unreachable!("polled a task that is not running"),
        };

        let outcome: Outcome<F::Output> = match panic::catch_unwind(AssertUnwindSafe(|| future.poll(cx))) {
            Ok(Poll::Pending) => return false,
            Ok(Poll::Ready(value)) => Ok(value),
            Err(payload) => Err(payload),
        };
        *stage = Stage::Finished(outcome);
        true
    }

    unsafe fn drop_stage(ptr: NonNull<Header>) {
        let stage: &mut Stage<F> = unsafe { Self::stage(ptr) };
        if let Stage::Finished(Err(_)) = stage {
            debug!("drop_stage(): discarding the panic of an unobserved task");
        }
        *stage = Stage::Consumed;
    }

    unsafe fn read_output(ptr: NonNull<Header>, dst: *mut ()) {
        let stage: &mut Stage<F> = unsafe { Self::stage(ptr) };
        let dst: &mut Option<Outcome<F::Output>> = unsafe { &mut *dst.cast::<Option<Outcome<F::Output>>>() };
        if let Stage::Finished(outcome) = mem::replace(stage, Stage::Consumed) {
            *dst = Some(outcome);
        }
    }

    unsafe fn dealloc(ptr: NonNull<Header>) {
        let cell: *mut Cell<F> = ptr.cast::<Cell<F>>().as_ptr();
        let allocator: TaskAllocator = unsafe { ManuallyDrop::take(&mut (*cell).header.allocator) };
        unsafe {
            ptr::drop_in_place(cell);
            allocator.deallocate(ptr.cast(), Layout::new::<Cell<F>>());
        }
    }
}

impl RawTask {
    /// Allocates a frame for `future`. The returned pointer carries one reference and the task is in the running
    /// state, ready for its first poll.
    pub fn allocate<F>(future: F, allocator: &TaskAllocator) -> Self
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let ptr: NonNull<Cell<F>> = allocator.allocate(Layout::new::<Cell<F>>()).cast();
        unsafe {
            ptr.as_ptr().write(Cell {
                header: Header {
                    state: State::new(),
                    refs: AtomicUsize::new(1),
                    vtable: &Cell::<F>::VTABLE,
                    continuation: UnsafeCell::new(None),
                    transfer: UnsafeCell::new(None),
                    allocator: ManuallyDrop::new(allocator.clone()),
                },
                stage: UnsafeCell::new(Stage::Running(future)),
            })
        };
        Self { ptr: ptr.cast() }
    }

    /// Returns the task behind `waker`, if it is a runtime task.
    fn from_waker(waker: &Waker) -> Option<Self> {
        if ptr::eq(waker.vtable(), &WAKER_VTABLE) {
            let ptr: NonNull<Header> = NonNull::new(waker.data() as *mut Header)?;
            Some(Self { ptr })
        } else {
            None
        }
    }

    fn header(&self) -> &Header {
        unsafe { self.ptr.as_ref() }
    }

    pub fn state(&self) -> Snapshot {
        self.header().state.load()
    }

    fn increment_ref(&self) {
        self.header().refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one reference, releasing the frame with the last one.
    ///
    /// # Safety
    ///
    /// The caller must own the reference it drops.
    pub unsafe fn drop_reference(self) {
        if self.header().refs.fetch_sub(1, Ordering::Release) == 1 {
            atomic::fence(Ordering::Acquire);
            unsafe { (self.header().vtable.dealloc)(self.ptr) };
        }
    }

    /// Resumes the task on the calling thread, unless it is running elsewhere or finished.
    pub fn resume(&self) {
        if self.header().state.transition_to_running() == TransitionToRunning::Run {
            unsafe { self.run() };
        }
    }

    /// Polls the task until it suspends or completes. The outermost run on a thread also resumes the continuations of
    /// every task that completed meanwhile.
    ///
    /// # Safety
    ///
    /// The caller must have moved the task to the running state and must hold a reference for the whole call.
    pub unsafe fn run(&self) {
        let scope: Option<ContinuationScope> = ContinuationScope::enter();
        unsafe { self.poll_until_suspended() };
        if let Some(scope) = scope {
            scope.drain();
        }
    }

    unsafe fn poll_until_suspended(&self) {
        let header: &Header = self.header();
        // Borrowed waker: it owns no reference.
        let waker: ManuallyDrop<Waker> =
            ManuallyDrop::new(unsafe { Waker::from_raw(RawWaker::new(self.ptr.as_ptr() as *const (), &WAKER_VTABLE)) });
        let mut cx: Context<'_> = Context::from_waker(&waker);

        loop {
            header.state.clear_notified();
            if unsafe { (header.vtable.poll)(self.ptr, &mut cx) } {
                unsafe { self.complete() };
                return;
            }

            let transfer: Option<Arc<Scheduler>> = unsafe { (*header.transfer.get()).take() };
            match header.state.transition_to_idle(transfer.is_none()) {
                TransitionToIdle::Repoll => continue,
                TransitionToIdle::Idle => {
                    if let Some(scheduler) = transfer {
                        scheduler.schedule((*waker).clone());
                    }
                    return;
                },
                TransitionToIdle::Closed => {
                    unsafe { (header.vtable.drop_stage)(self.ptr) };
                    header.state.transition_to_complete();
                    return;
                },
            }
        }
    }

    /// Publishes the outcome stored by the last poll.
    unsafe fn complete(&self) {
        let header: &Header = self.header();
        let previous: Snapshot = header.state.transition_to_complete();
        if previous.is_forgotten() || previous.is_closed() {
            unsafe { (header.vtable.drop_stage)(self.ptr) };
        } else if previous.has_continuation() {
            // Safety: the slot is only read while the continuation bit is set.
            if let Some(continuation) = unsafe { (*header.continuation.get()).as_ref() } {
                resume_continuation(continuation);
            }
        }
    }

    /// Registers `waker` as the continuation of the task. Returns true if the task is already complete, in which case
    /// the waker is not registered.
    pub fn poll_join(&self, waker: &Waker) -> bool {
        let header: &Header = self.header();
        let snapshot: Snapshot = header.state.load();
        if snapshot.is_complete() {
            return true;
        }

        if snapshot.has_continuation() {
            // Safety: while the bit is set, both sides only read the slot.
            let registered: Option<&Waker> = unsafe { (*header.continuation.get()).as_ref() };
            if registered.map_or(false, |registered| registered.will_wake(waker)) {
                return false;
            }
            if header.state.unset_continuation().is_err() {
                return true;
            }
        }

        // Safety: the bit is clear, so the completer does not look at the slot.
        unsafe { *header.continuation.get() = Some(waker.clone()) };
        header.state.set_continuation().is_err()
    }

    /// Moves the outcome out of a complete task.
    ///
    /// # Safety
    ///
    /// `T` must be the output type of the future, and the task must be complete.
    pub unsafe fn read_output<T>(&self) -> Option<Outcome<T>> {
        let mut output: Option<Outcome<T>> = None;
        unsafe { (self.header().vtable.read_output)(self.ptr, &mut output as *mut Option<Outcome<T>> as *mut ()) };
        output
    }

    /// Called when the handle is dropped. Destroys the future right away if nobody is polling it, discards the
    /// outcome if the task already completed.
    ///
    /// # Safety
    ///
    /// Handle only. The handle's reference is released.
    pub unsafe fn drop_handle(self) {
        let header: &Header = self.header();
        let previous: Snapshot = header.state.transition_to_closed();
        if previous.is_complete() {
            unsafe { (header.vtable.drop_stage)(self.ptr) };
        } else if header.state.try_claim() {
            unsafe { (header.vtable.drop_stage)(self.ptr) };
            header.state.transition_to_complete();
        }
        unsafe { self.drop_reference() };
    }

    /// Called when the handle is forgotten. The task keeps running and discards its outcome when it completes.
    ///
    /// # Safety
    ///
    /// Handle only. The handle's reference is released.
    pub unsafe fn forget_handle(self) {
        let header: &Header = self.header();
        let previous: Snapshot = header.state.transition_to_forgotten();
        if previous.is_complete() {
            unsafe { (header.vtable.drop_stage)(self.ptr) };
        }
        unsafe { self.drop_reference() };
    }
}

impl ContinuationScope {
    /// Returns a scope if no run is in progress on the current thread.
    fn enter() -> Option<Self> {
        CONTINUATIONS.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return None;
            }
            *slot = Some(VecDeque::new());
            Some(Self)
        })
    }

    /// Resumes queued continuations until none is left, including those queued while draining.
    fn drain(&self) {
        while let Some(continuation) = Self::pop() {
            continuation.wake();
        }
    }

    fn pop() -> Option<Waker> {
        CONTINUATIONS.with(|slot| slot.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Resumes the awaiter of a task that just completed. An idle runtime task is queued on the outermost run of the
/// thread. A running one only needs the notification, and foreign wakers are woken right away.
fn resume_continuation(continuation: &Waker) {
    let queued: bool = match RawTask::from_waker(continuation) {
        Some(task) if !task.state().is_running() => CONTINUATIONS.with(|slot| match slot.borrow_mut().as_mut() {
            Some(queue) => {
                queue.push_back(continuation.clone());
                true
            },
            None => false,
        }),
        _ => false,
    };
    if !queued {
        continuation.wake_by_ref();
    }
}

/// Asks the task polled with `waker` to be enqueued on `scheduler` once its current poll returns. If `waker` does not
/// belong to a running runtime task, `scheduler` is handed back.
pub fn defer_transfer(waker: &Waker, scheduler: Arc<Scheduler>) -> Result<(), Arc<Scheduler>> {
    match RawTask::from_waker(waker) {
        Some(task) if task.state().is_running() => {
            // Safety: only the poller of a running task gets here, from within its poll.
            unsafe { *task.header().transfer.get() = Some(scheduler) };
            Ok(())
        },
        _ => Err(scheduler),
    }
}

unsafe fn clone_waker(data: *const ()) -> RawWaker {
    let task: RawTask = RawTask {
        ptr: unsafe { NonNull::new_unchecked(data as *mut Header) },
    };
    task.increment_ref();
    RawWaker::new(data, &WAKER_VTABLE)
}

unsafe fn wake_by_val(data: *const ()) {
    unsafe {
        wake_by_ref(data);
        drop_waker(data);
    }
}

unsafe fn wake_by_ref(data: *const ()) {
    let task: RawTask = RawTask {
        ptr: unsafe { NonNull::new_unchecked(data as *mut Header) },
    };
    task.resume();
}

unsafe fn drop_waker(data: *const ()) {
    let task: RawTask = RawTask {
        ptr: unsafe { NonNull::new_unchecked(data as *mut Header) },
    };
    unsafe { task.drop_reference() };
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for ContinuationScope {
    fn drop(&mut self) {
        let leftover: Option<VecDeque<Waker>> = CONTINUATIONS.with(|slot| slot.borrow_mut().take());
        if let Some(leftover) = leftover {
            if !leftover.is_empty() {
                warn!("drop(): unwinding with pending continuations (count={:?})", leftover.len());
            }
        }
    }
}

// Frames are shared between threads through their atomic state; futures and outputs are required to be `Send`.
unsafe impl Send for RawTask {}
unsafe impl Sync for RawTask {}
