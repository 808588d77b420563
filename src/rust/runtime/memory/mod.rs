// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod pool_allocator;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    alloc::{
        self,
        Layout,
    },
    fmt,
    ptr::NonNull,
    sync::Arc,
};

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::pool_allocator::PoolAllocator;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Memory source for task frames.
///
/// Implementations must be callable from any thread: a frame allocated on one thread is routinely released on another
/// one (for instance, after the task migrated to a thread pool worker).
pub trait FrameAllocator: Send + Sync {
    /// Allocates a block that fits `layout`. Allocation failures are fatal.
    fn allocate(&self, layout: Layout) -> NonNull<u8>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [FrameAllocator::allocate] on this same allocator, with the same `layout`, and
    /// must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Frame allocator that forwards to the global Rust allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalAllocator;

/// Shared handle to the allocator that backs task frames. Every frame keeps a clone of the handle it was allocated
/// with, so the allocator outlives all of its frames.
#[derive(Clone)]
pub struct TaskAllocator(Arc<dyn FrameAllocator>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskAllocator {
    /// Wraps a custom allocator.
    pub fn new<A: FrameAllocator + 'static>(allocator: A) -> Self {
        Self(Arc::new(allocator))
    }

    /// Wraps an allocator that the caller keeps sharing.
    pub fn from_arc<A: FrameAllocator + 'static>(allocator: Arc<A>) -> Self {
        Self(allocator)
    }

    /// Allocator that forwards to the global Rust allocator.
    pub fn global() -> Self {
        Self::new(GlobalAllocator)
    }

    /// Allocator backed by a fresh [PoolAllocator].
    pub fn pool() -> Self {
        Self::new(PoolAllocator::new())
    }

    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.0.allocate(layout)
    }

    /// # Safety
    ///
    /// Same contract as [FrameAllocator::deallocate].
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.0.deallocate(ptr, layout) }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl FrameAllocator for GlobalAllocator {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        assert!(layout.size() > 0, "task frames are never zero-sized");
        match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

impl<A: FrameAllocator + ?Sized> FrameAllocator for Arc<A> {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

impl Default for TaskAllocator {
    fn default() -> Self {
        Self::pool()
    }
}

impl fmt::Debug for TaskAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskAllocator")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
