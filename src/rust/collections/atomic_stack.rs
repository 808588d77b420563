// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    ptr::{
        self,
        NonNull,
    },
    sync::atomic::{
        AtomicPtr,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Link embedded at the start of every node pushed onto an [AtomicStack]. Nodes are carved out of memory that the
/// producer already owns (a freed allocator block, a scheduler entry), so the stack itself never allocates.
#[repr(C)]
#[derive(Debug)]
pub struct StackLink {
    next: *mut StackLink,
}

/// A lock-free, multi-producer/single-consumer intrusive stack.
///
/// Any thread may [push](AtomicStack::push) a node with a CAS loop. Only the owner of the stack drains it, and it does
/// so all at once with [take_all](AtomicStack::take_all), which detaches the whole chain with a single atomic swap.
/// Since nodes are never popped one by one, the ABA problem does not arise.
#[derive(Debug)]
pub struct AtomicStack {
    head: AtomicPtr<StackLink>,
}

/// Detached chain of nodes returned by [AtomicStack::take_all], most recently pushed node first.
pub struct StackDrain {
    cursor: *mut StackLink,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl StackLink {
    pub const fn new() -> Self {
        Self { next: ptr::null_mut() }
    }
}

impl AtomicStack {
    /// Creates an empty stack.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `node` onto the stack.
    ///
    /// # Safety
    ///
    /// `node` must point to memory that is valid for writes of a [StackLink] and that is neither read nor written by
    /// anybody else until the node is handed back by [take_all](AtomicStack::take_all).
    pub unsafe fn push(&self, node: NonNull<StackLink>) {
        let node: *mut StackLink = node.as_ptr();
        let mut head: *mut StackLink = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detaches every node pushed so far.
    pub fn take_all(&self) -> StackDrain {
        // Fast path to avoid an exclusive cache line access when there is nothing to drain.
        if self.head.load(Ordering::Relaxed).is_null() {
            return StackDrain {
                cursor: ptr::null_mut(),
            };
        }
        StackDrain {
            cursor: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }

    /// Returns true if no node is currently on the stack. The answer may be stale when producers are active.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for AtomicStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for StackLink {
    fn default() -> Self {
        Self::new()
    }
}

/// The successor is read before a node is handed out, so callers are free to reuse the node memory right away.
impl Iterator for StackDrain {
    type Item = NonNull<StackLink>;

    fn next(&mut self) -> Option<Self::Item> {
        let node: NonNull<StackLink> = NonNull::new(self.cursor)?;
        self.cursor = unsafe { (*node.as_ptr()).next };
        Some(node)
    }
}

// Nodes are owned by whoever drains the stack; the stack only ever moves raw pointers between threads.
unsafe impl Send for AtomicStack {}
unsafe impl Sync for AtomicStack {}
unsafe impl Send for StackDrain {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
