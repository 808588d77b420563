// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::atomic_stack::{
        AtomicStack,
        StackLink,
    },
    runtime::memory::FrameAllocator,
};
use ::parking_lot::Mutex;
use ::std::{
    alloc::{
        self,
        Layout,
    },
    cell::{
        Cell,
        UnsafeCell,
    },
    collections::HashMap,
    mem,
    ptr::{
        self,
        NonNull,
    },
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
    thread::{
        self,
        ThreadId,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Payload sizes of the pooled size classes, ascending.
pub const SIZE_CLASSES: [usize; 9] = [48, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Number of size classes. Also used as the class tag of blocks that bypass the pools.
const CLASS_COUNT: usize = SIZE_CLASSES.len();

/// Number of blocks carved out of every slab.
pub const SLAB_BLOCK_COUNT: usize = 32;

/// Alignment guaranteed to every pooled block.
pub const MAX_ALIGN: usize = 16;

/// Size of the header that precedes every user pointer.
const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of allocator identities. Zero is never handed out, so an empty cache entry never matches.
static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Last thread-local pool used by this thread, keyed by allocator identity.
    static POOL_CACHE: Cell<(u64, *const LocalPool)> = const { Cell::new((0, ptr::null())) };
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Metadata written right before every user pointer. Deallocation trusts this header rather than the size passed by
/// the caller.
#[repr(C, align(16))]
struct BlockHeader {
    /// Thread-local pool that handed out the block.
    owner: *const LocalPool,
    /// Size class index, or [CLASS_COUNT] for direct allocations.
    class: u32,
    /// Distance from the start of the raw allocation to the user pointer.
    offset: u32,
    /// Layout of the raw allocation (direct allocations only).
    size: usize,
    align: usize,
}

/// Node threaded through a free block while it sits on a local free list.
struct FreeNode {
    next: *mut FreeNode,
}

/// Node threaded through a free block while it sits on a remote free stack.
#[repr(C)]
struct RemoteFreeNode {
    link: StackLink,
    class: usize,
}

/// Per size class state, touched by the owner thread only.
struct ClassState {
    free_list: *mut FreeNode,
    slabs: Vec<NonNull<u8>>,
}

/// Pools owned by one thread for one allocator instance.
struct LocalPool {
    owner: ThreadId,
    classes: UnsafeCell<[ClassState; CLASS_COUNT]>,
    /// Blocks freed by other threads, drained by the owner on its next free-list miss.
    remote_free: AtomicStack,
}

/// Thread-local, size-classed allocator for task frames.
///
/// Every thread transparently gets its own set of free lists, so the same-thread allocate and free paths take no lock.
/// A block freed by a thread other than the one that allocated it is handed back to its owner through a lock-free
/// stack and becomes reusable the next time the owner runs out of local blocks of that class.
pub struct PoolAllocator {
    id: u64,
    pools: Mutex<HashMap<ThreadId, Box<LocalPool>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl PoolAllocator {
    /// Creates an empty allocator. Memory is requested lazily, one slab at a time.
    pub fn new() -> Self {
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates `size` bytes aligned to [MAX_ALIGN].
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.allocate_layout(size, MAX_ALIGN)
    }

    /// Allocates a block that fits `layout`. Requests larger than the largest size class or aligned beyond [MAX_ALIGN]
    /// bypass the pools.
    pub fn allocate_aligned(&self, layout: Layout) -> NonNull<u8> {
        self.allocate_layout(layout.size(), layout.align())
    }

    /// Releases a block returned by this allocator. `size` is informational only.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [PoolAllocator::allocate] or [PoolAllocator::allocate_aligned] on this allocator and must
    /// not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        let header: *const BlockHeader = unsafe { ptr.as_ptr().sub(HEADER_SIZE) }.cast();
        let (owner, class, offset, size, align) = unsafe {
            let header: &BlockHeader = &*header;
            (
                header.owner,
                header.class as usize,
                header.offset as usize,
                header.size,
                header.align,
            )
        };
        let raw: *mut u8 = unsafe { ptr.as_ptr().sub(offset) };

        if class >= CLASS_COUNT {
            let layout: Layout = unsafe { Layout::from_size_align_unchecked(size, align) };
            unsafe { alloc::dealloc(raw, layout) };
            return;
        }

        // Pools live as long as the allocator itself.
        let owner: &LocalPool = unsafe { &*owner };
        if owner.owner == thread::current().id() {
            unsafe { owner.push_local(raw, class) };
        } else {
            unsafe { owner.push_remote(raw, class) };
        }
    }

    /// Returns the size class that serves `size`, if any.
    pub fn size_class(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&class_size| size <= class_size)
    }

    fn allocate_layout(&self, size: usize, align: usize) -> NonNull<u8> {
        let pool: &LocalPool = self.local_pool();

        match Self::size_class(size) {
            Some(class) if align <= MAX_ALIGN => {
                let raw: NonNull<u8> = pool.pop(class);
                unsafe { Self::finish_block(raw, pool, class, HEADER_SIZE, 0, 0) }
            },
            _ => {
                let offset: usize = HEADER_SIZE.max(align);
                let layout: Layout = match size
                    .checked_add(offset)
                    .and_then(|total| Layout::from_size_align(total, align.max(MAX_ALIGN)).ok())
                {
                    Some(layout) => layout,
                    None => panic!("allocation request too large (size={}, align={})", size, align),
                };
                let raw: NonNull<u8> = match NonNull::new(unsafe { alloc::alloc(layout) }) {
                    Some(raw) => raw,
                    None => alloc::handle_alloc_error(layout),
                };
                unsafe { Self::finish_block(raw, pool, CLASS_COUNT, offset, layout.size(), layout.align()) }
            },
        }
    }

    /// Writes the header of a block and returns the user pointer.
    unsafe fn finish_block(
        raw: NonNull<u8>,
        pool: &LocalPool,
        class: usize,
        offset: usize,
        size: usize,
        align: usize,
    ) -> NonNull<u8> {
        let user: *mut u8 = unsafe { raw.as_ptr().add(offset) };
        let header: *mut BlockHeader = unsafe { user.sub(HEADER_SIZE) }.cast();
        unsafe {
            header.write(BlockHeader {
                owner: pool as *const LocalPool,
                class: class as u32,
                offset: offset as u32,
                size,
                align,
            })
        };
        unsafe { NonNull::new_unchecked(user) }
    }

    /// Returns the pool of the calling thread, creating it on first use.
    fn local_pool(&self) -> &LocalPool {
        let (cached_id, cached_pool) = POOL_CACHE.with(Cell::get);
        if cached_id == self.id && !cached_pool.is_null() {
            // Pools are boxed and only released when the allocator is dropped.
            return unsafe { &*cached_pool };
        }

        let thread_id: ThreadId = thread::current().id();
        let pool: *const LocalPool = {
            let mut pools = self.pools.lock();
            &**pools.entry(thread_id).or_insert_with(|| {
                trace!("local_pool(): creating pool (allocator={:?}, thread={:?})", self.id, thread_id);
                Box::new(LocalPool::new(thread_id))
            })
        };
        POOL_CACHE.with(|cache| cache.set((self.id, pool)));

        unsafe { &*pool }
    }
}

impl ClassState {
    const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            slabs: Vec::new(),
        }
    }
}

impl LocalPool {
    fn new(owner: ThreadId) -> Self {
        Self {
            owner,
            classes: UnsafeCell::new([const { ClassState::new() }; CLASS_COUNT]),
            remote_free: AtomicStack::new(),
        }
    }

    /// Size of a pooled block of class `class`, header included.
    fn block_size(class: usize) -> usize {
        HEADER_SIZE + SIZE_CLASSES[class]
    }

    fn slab_layout(class: usize) -> Layout {
        // Block sizes are multiples of MAX_ALIGN, and the product is far below isize::MAX.
        unsafe { Layout::from_size_align_unchecked(Self::block_size(class) * SLAB_BLOCK_COUNT, MAX_ALIGN) }
    }

    /// Owner thread only.
    #[allow(clippy::mut_from_ref)]
    unsafe fn class_state(&self, class: usize) -> &mut ClassState {
        unsafe { &mut (*self.classes.get())[class] }
    }

    /// Takes a raw block of class `class`. Owner thread only.
    fn pop(&self, class: usize) -> NonNull<u8> {
        if let Some(block) = unsafe { self.pop_local(class) } {
            return block;
        }

        unsafe { self.collect_remote_frees() };
        if let Some(block) = unsafe { self.pop_local(class) } {
            return block;
        }

        unsafe { self.allocate_slab(class) }
    }

    unsafe fn pop_local(&self, class: usize) -> Option<NonNull<u8>> {
        let state: &mut ClassState = unsafe { self.class_state(class) };
        let node: NonNull<FreeNode> = NonNull::new(state.free_list)?;
        state.free_list = unsafe { (*node.as_ptr()).next };
        Some(node.cast())
    }

    /// Returns a raw block to its free list. Owner thread only.
    unsafe fn push_local(&self, raw: *mut u8, class: usize) {
        let state: &mut ClassState = unsafe { self.class_state(class) };
        let node: *mut FreeNode = raw.cast();
        unsafe { node.write(FreeNode { next: state.free_list }) };
        state.free_list = node;
    }

    /// Hands a raw block back to the owner thread. Any thread.
    unsafe fn push_remote(&self, raw: *mut u8, class: usize) {
        let node: *mut RemoteFreeNode = raw.cast();
        unsafe {
            node.write(RemoteFreeNode {
                link: StackLink::new(),
                class,
            });
            self.remote_free.push(NonNull::new_unchecked(node).cast());
        }
    }

    /// Splices every remotely freed block into the local free lists. Owner thread only.
    unsafe fn collect_remote_frees(&self) {
        for link in self.remote_free.take_all() {
            let class: usize = unsafe { (*link.cast::<RemoteFreeNode>().as_ptr()).class };
            unsafe { self.push_local(link.as_ptr().cast(), class) };
        }
    }

    /// Allocates a slab for class `class`, keeps its first block and threads the others onto the free list.
    unsafe fn allocate_slab(&self, class: usize) -> NonNull<u8> {
        let layout: Layout = Self::slab_layout(class);
        let slab: NonNull<u8> = match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(slab) => slab,
            None => alloc::handle_alloc_error(layout),
        };
        unsafe { self.class_state(class) }.slabs.push(slab);

        let block_size: usize = Self::block_size(class);
        for i in (1..SLAB_BLOCK_COUNT).rev() {
            unsafe { self.push_local(slab.as_ptr().add(i * block_size), class) };
        }

        slab
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for PoolAllocator {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.allocate_aligned(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { PoolAllocator::deallocate(self, ptr, layout.size()) }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        trace!("drop(): releasing pools (allocator={:?})", self.id);
        // Stale cache entries are harmless: allocator ids are never reused.
        self.pools.get_mut().clear();
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        for (class, state) in self.classes.get_mut().iter_mut().enumerate() {
            let layout: Layout = Self::slab_layout(class);
            for slab in state.slabs.drain(..) {
                unsafe { alloc::dealloc(slab.as_ptr(), layout) };
            }
            state.free_list = ptr::null_mut();
        }
    }
}

// The free lists are only touched by the owner thread; other threads only push onto the remote stack.
unsafe impl Send for LocalPool {}
unsafe impl Sync for LocalPool {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
