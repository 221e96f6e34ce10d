//! # void_alloc - Pluggable Memory Allocators
//!
//! One allocator capability, several strategies behind it:
//! - Heap: platform allocator with aligned alloc/free emulation
//! - Arena: linear allocation, bulk deallocation, nested checkpoints
//! - Pool: fixed-size block allocation
//! - FreeList: general-purpose, first-fit with coalescing
//! - Scratch: ring buffer reclaimed lazily from the tail
//!
//! Every strategy implements [`Allocator`], so containers only ever hold a
//! `&dyn Allocator` and never care which strategy sits behind it.
//!
//! None of the strategies synchronise internally. Their state lives in
//! `Cell`s, which keeps them `!Sync`; wrap one in [`Locked`] to share it.
//! Strategies are `Send`, so a backing allocator must be `Sync`: the heap
//! is, and any strategy becomes one inside [`Locked`].

pub mod mem;
pub mod error;
pub mod header;
mod region;
pub mod heap;
pub mod arena;
pub mod pool;
pub mod free_list;
pub mod scratch;
pub mod config;
pub mod locked;
pub mod tracker;

use core::ptr::NonNull;

pub use arena::{Arena, ArenaStats, TempArena};
pub use config::{PoolConfig, StrategyConfig};
pub use error::{AllocError, AllocResult};
pub use free_list::{FreeList, FreeListStats};
pub use heap::HeapAllocator;
pub use locked::Locked;
pub use mem::{align_down, align_up, is_aligned, is_power_of_two};
pub use pool::{Pool, PoolStats};
pub use scratch::{ScratchAllocator, ScratchStats};
pub use tracker::{Tracked, TrackingStats};

/// Alignment used when the caller does not care: two machine words
pub const DEFAULT_ALIGNMENT: usize = 2 * core::mem::size_of::<usize>();

/// Operation requested through [`Allocator::dispatch`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorMode {
    Alloc,
    Free,
    FreeAll,
    Resize,
}

/// Allocation flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Zero the returned memory
    pub const ZERO_MEMORY: Self = Self(1 << 0);

    /// Raw flag bits
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every flag in `other` is set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for AllocFlags {
    fn default() -> Self {
        Self::ZERO_MEMORY
    }
}

impl core::ops::BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single call through the allocator procedure
#[derive(Clone, Copy, Debug)]
pub struct AllocRequest {
    pub mode: AllocatorMode,
    pub size: usize,
    pub align: usize,
    pub old_memory: Option<NonNull<u8>>,
    pub old_size: usize,
    pub flags: AllocFlags,
}

impl AllocRequest {
    /// Request a new block
    pub fn alloc(size: usize, align: usize) -> Self {
        Self {
            mode: AllocatorMode::Alloc,
            size,
            align,
            old_memory: None,
            old_size: 0,
            flags: AllocFlags::default(),
        }
    }

    /// Release one block
    pub fn free(ptr: NonNull<u8>, old_size: usize) -> Self {
        Self {
            mode: AllocatorMode::Free,
            size: 0,
            align: DEFAULT_ALIGNMENT,
            old_memory: Some(ptr),
            old_size,
            flags: AllocFlags::NONE,
        }
    }

    /// Release every block
    pub fn free_all() -> Self {
        Self {
            mode: AllocatorMode::FreeAll,
            size: 0,
            align: DEFAULT_ALIGNMENT,
            old_memory: None,
            old_size: 0,
            flags: AllocFlags::NONE,
        }
    }

    /// Grow or shrink a block
    pub fn resize(ptr: Option<NonNull<u8>>, old_size: usize, new_size: usize, align: usize) -> Self {
        Self {
            mode: AllocatorMode::Resize,
            size: new_size,
            align,
            old_memory: ptr,
            old_size,
            flags: AllocFlags::default(),
        }
    }

    /// Replace the flags
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Common trait for all allocators
///
/// `allocate` is mandatory. The other operations have defaults: `free` and
/// `free_all` report [`AllocError::Unsupported`], `resize` goes through
/// [`default_resize`].
pub trait Allocator {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Allocate `size` bytes aligned to `align` (a power of two)
    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>>;

    /// Release a block
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>, old_size: usize) -> AllocResult<()> {
        let _ = (ptr, old_size);
        Err(unsupported(self.name(), AllocatorMode::Free))
    }

    /// Release every block at once
    ///
    /// Every pointer handed out before the call is invalidated.
    fn free_all(&self) -> AllocResult<()> {
        Err(unsupported(self.name(), AllocatorMode::FreeAll))
    }

    /// Resize a block, possibly moving it
    ///
    /// # Safety
    /// `ptr` must be `None` or a live block of `old_size` bytes from this allocator.
    unsafe fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> AllocResult<Option<NonNull<u8>>> {
        default_resize(self, ptr, old_size, new_size, align, flags)
    }

    /// Single entry point covering every operation
    ///
    /// # Safety
    /// The pointer carried by a `Free` or `Resize` request must satisfy the
    /// contract of [`Allocator::free`] / [`Allocator::resize`].
    unsafe fn dispatch(&self, request: AllocRequest) -> AllocResult<Option<NonNull<u8>>> {
        match request.mode {
            AllocatorMode::Alloc => self
                .allocate(request.size, request.align, request.flags)
                .map(Some),
            AllocatorMode::Free => {
                if let Some(ptr) = request.old_memory {
                    self.free(ptr, request.old_size)?;
                }
                Ok(None)
            }
            AllocatorMode::FreeAll => {
                self.free_all()?;
                Ok(None)
            }
            AllocatorMode::Resize => self.resize(
                request.old_memory,
                request.old_size,
                request.size,
                request.align,
                request.flags,
            ),
        }
    }
}

fn unsupported(allocator: &'static str, mode: AllocatorMode) -> AllocError {
    log::error!("{} does not support {:?}", allocator, mode);
    AllocError::Unsupported { allocator, mode }
}

/// Resize by allocate + copy + free
///
/// - no old block: plain allocation
/// - zero new size: free and return `None`
/// - same size: the old block is returned untouched
///
/// # Safety
/// `ptr` must be `None` or a live block of `old_size` bytes from `allocator`.
pub unsafe fn default_resize<A: Allocator + ?Sized>(
    allocator: &A,
    ptr: Option<NonNull<u8>>,
    old_size: usize,
    new_size: usize,
    align: usize,
    flags: AllocFlags,
) -> AllocResult<Option<NonNull<u8>>> {
    let Some(old) = ptr else {
        return allocator.allocate(new_size, align, flags).map(Some);
    };

    if new_size == 0 {
        allocator.free(old, old_size)?;
        return Ok(None);
    }

    if new_size == old_size {
        return Ok(Some(old));
    }

    let new = allocator.allocate(new_size, align, flags)?;
    mem::mem_copy(new, old, old_size.min(new_size));
    allocator.free(old, old_size)?;
    Ok(Some(new))
}

impl<A: Allocator + ?Sized> Allocator for &A {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        (**self).allocate(size, align, flags)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, old_size: usize) -> AllocResult<()> {
        (**self).free(ptr, old_size)
    }

    fn free_all(&self) -> AllocResult<()> {
        (**self).free_all()
    }

    unsafe fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> AllocResult<Option<NonNull<u8>>> {
        (**self).resize(ptr, old_size, new_size, align, flags)
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        (**self).allocate(size, align, flags)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, old_size: usize) -> AllocResult<()> {
        (**self).free(ptr, old_size)
    }

    fn free_all(&self) -> AllocResult<()> {
        (**self).free_all()
    }

    unsafe fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> AllocResult<Option<NonNull<u8>>> {
        (**self).resize(ptr, old_size, new_size, align, flags)
    }
}

/// Typed convenience helpers available on every allocator
pub trait AllocatorExt: Allocator {
    /// Allocate with the default alignment and flags
    fn alloc(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.allocate(size, DEFAULT_ALIGNMENT, AllocFlags::default())
    }

    /// Allocate with an explicit alignment and the default flags
    fn alloc_align(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        self.allocate(size, align, AllocFlags::default())
    }

    /// Allocate zeroed storage for `count` values of `T`
    fn alloc_array<T>(&self, count: usize) -> AllocResult<NonNull<T>> {
        let size = core::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(AllocError::OutOfMemory {
                allocator: self.name(),
                requested: usize::MAX,
                available: 0,
            })?;
        self.allocate(size, core::mem::align_of::<T>(), AllocFlags::ZERO_MEMORY)
            .map(NonNull::cast)
    }

    /// Allocate a copy of `values`
    fn alloc_copy<T: Copy>(&self, values: &[T]) -> AllocResult<NonNull<T>> {
        let ptr = self.allocate(
            core::mem::size_of_val(values),
            core::mem::align_of::<T>(),
            AllocFlags::NONE,
        )?;
        unsafe {
            core::ptr::copy_nonoverlapping(values.as_ptr(), ptr.cast::<T>().as_ptr(), values.len());
        }
        Ok(ptr.cast())
    }

    /// Move `value` into a fresh allocation
    fn alloc_value<T>(&self, value: T) -> AllocResult<NonNull<T>> {
        let ptr = self
            .allocate(
                core::mem::size_of::<T>(),
                core::mem::align_of::<T>(),
                AllocFlags::NONE,
            )?
            .cast::<T>();
        unsafe {
            ptr.as_ptr().write(value);
        }
        Ok(ptr)
    }
}

impl<A: Allocator + ?Sized> AllocatorExt for A {}

pub mod prelude {
    pub use crate::{AllocFlags, AllocRequest, Allocator, AllocatorExt, AllocatorMode};
    pub use crate::{AllocError, AllocResult, DEFAULT_ALIGNMENT};
    pub use crate::{Arena, FreeList, HeapAllocator, Pool, ScratchAllocator, TempArena};
    pub use crate::{align_down, align_up, is_aligned};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = AllocFlags::NONE | AllocFlags::ZERO_MEMORY;
        assert!(flags.contains(AllocFlags::ZERO_MEMORY));
        assert!(!AllocFlags::NONE.contains(AllocFlags::ZERO_MEMORY));
        assert_eq!(AllocFlags::default(), AllocFlags::ZERO_MEMORY);
    }

    #[test]
    fn test_dispatch_through_heap() {
        let heap = HeapAllocator::new();
        let alloc: &dyn Allocator = &heap;

        unsafe {
            let ptr = alloc.dispatch(AllocRequest::alloc(32, 16)).unwrap().unwrap();
            assert!(is_aligned(ptr.as_ptr(), 16));

            let grown = alloc
                .dispatch(AllocRequest::resize(Some(ptr), 32, 64, 16))
                .unwrap()
                .unwrap();
            assert_eq!(heap.live_blocks(), 1);

            assert!(alloc.dispatch(AllocRequest::free(grown, 64)).unwrap().is_none());
        }

        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_default_resize_copies_prefix() {
        let heap = HeapAllocator::new();

        unsafe {
            let ptr = heap.alloc_copy(&[1u8, 2, 3, 4]).unwrap();
            let grown = default_resize(&heap, Some(ptr.cast()), 4, 8, 1, AllocFlags::ZERO_MEMORY)
                .unwrap()
                .unwrap();
            let bytes = core::slice::from_raw_parts(grown.as_ptr(), 8);
            assert_eq!(bytes, &[1, 2, 3, 4, 0, 0, 0, 0]);

            let shrunk = default_resize(&heap, Some(grown), 8, 2, 1, AllocFlags::NONE)
                .unwrap()
                .unwrap();
            assert_eq!(core::slice::from_raw_parts(shrunk.as_ptr(), 2), &[1, 2]);

            assert!(default_resize(&heap, Some(shrunk), 2, 0, 1, AllocFlags::NONE)
                .unwrap()
                .is_none());
        }

        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_alloc_value() {
        let heap = HeapAllocator::new();
        let value = heap.alloc_value(0xDEAD_BEEFu64).unwrap();

        unsafe {
            assert_eq!(*value.as_ptr(), 0xDEAD_BEEF);
            heap.free(value.cast(), 8).unwrap();
        }
    }
}
