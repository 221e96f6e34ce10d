//! Arena allocator - fast linear allocation with bulk deallocation

use core::cell::Cell;
use core::ptr::NonNull;

use crate::mem::{align_forward, align_offset, assert_power_of_two, mem_zero};
use crate::region::Region;
use crate::{AllocError, AllocFlags, AllocResult, Allocator, DEFAULT_ALIGNMENT};

/// Arena allocator - extremely fast for temporary allocations
///
/// Allocations are served linearly from a contiguous buffer.
/// Individual deallocations are no-ops; memory comes back through
/// [`Allocator::free_all`] or by ending a [`TempArena`].
///
/// The buffer comes from caller memory, a backing allocator, or a parent
/// arena ([`Arena::sub_arena`]). Only a buffer taken from a backing
/// allocator is returned on drop.
pub struct Arena<'a> {
    /// Backing memory
    region: Region<'a>,
    /// Bytes handed out so far, alignment padding included
    allocated: Cell<usize>,
    /// Open temp checkpoints
    temp_count: Cell<usize>,
}

impl<'a> Arena<'a> {
    /// Create an arena over caller-provided memory
    pub fn from_memory(memory: &'a mut [u8]) -> Self {
        Self::with_region(Region::from_slice(memory))
    }

    /// Create an arena over raw memory
    ///
    /// # Safety
    /// `start` must be valid for reads and writes of `size` bytes for `'a`
    /// and must not be used through any other path meanwhile.
    pub unsafe fn from_raw(start: NonNull<u8>, size: usize) -> Self {
        Self::with_region(Region::from_raw(start, size))
    }

    /// Create an arena whose buffer is allocated from `backing`
    pub fn from_allocator(backing: &'a (dyn Allocator + Sync), size: usize) -> AllocResult<Self> {
        let region = Region::allocate(backing, size, DEFAULT_ALIGNMENT)?;
        Ok(Self::with_region(region))
    }

    fn with_region(region: Region<'a>) -> Self {
        log::debug!("Created arena of {} bytes (owned: {})", region.len(), region.is_owned());
        Self {
            region,
            allocated: Cell::new(0),
            temp_count: Cell::new(0),
        }
    }

    /// Carve a child arena of `size` bytes out of this one
    ///
    /// The child's memory belongs to this arena and is only reclaimed when
    /// this arena is reset or dropped. The borrow keeps the parent alive but
    /// does not stop [`Allocator::free_all`] or an ended [`TempArena`] on the
    /// parent: either one invalidates all memory handed out by the child.
    pub fn sub_arena(&self, size: usize) -> AllocResult<Arena<'_>> {
        let start = self.allocate(size, DEFAULT_ALIGNMENT, AllocFlags::NONE)?;
        // Safety: the block stays valid while the parent lives and is handed
        // to no one else until the parent is reset.
        Ok(unsafe { Arena::from_raw(start, size) })
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Bytes consumed so far, alignment padding included
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Padding the next allocation with `align` would need
    pub fn alignment_offset(&self, align: usize) -> usize {
        align_offset(self.region.at(self.allocated.get()).as_ptr(), align)
    }

    /// Largest allocation with `align` that still fits
    pub fn size_remaining(&self, align: usize) -> usize {
        self.capacity()
            .saturating_sub(self.allocated.get() + self.alignment_offset(align))
    }

    /// Open a temp checkpoint; everything allocated until it ends is discarded
    pub fn begin_temp(&self) -> TempArena<'_> {
        self.temp_count.set(self.temp_count.get() + 1);
        TempArena {
            arena: self,
            original: self.allocated.get(),
            depth: self.temp_count.get(),
            ended: false,
        }
    }

    /// Number of temp checkpoints still open
    pub fn open_checkpoints(&self) -> usize {
        self.temp_count.get()
    }

    /// True when no temp checkpoint is open
    pub fn all_checkpoints_closed(&self) -> bool {
        self.temp_count.get() == 0
    }

    /// Panic if a temp checkpoint is still open
    #[track_caller]
    pub fn check(&self) {
        assert!(
            self.all_checkpoints_closed(),
            "arena has {} open temp checkpoint(s)",
            self.temp_count.get()
        );
    }

    /// Get statistics
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.capacity(),
            allocated: self.allocated(),
            remaining: self.capacity() - self.allocated(),
            open_checkpoints: self.open_checkpoints(),
        }
    }
}

impl Allocator for Arena<'_> {
    fn name(&self) -> &'static str {
        "arena"
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        assert_power_of_two(align);

        let current = self.allocated.get();
        let padding = self.alignment_offset(align);
        let new_allocated = current
            .checked_add(padding)
            .and_then(|offset| offset.checked_add(size))
            .filter(|end| *end <= self.capacity());

        let Some(new_allocated) = new_allocated else {
            let available = self.capacity() - current;
            log::warn!(
                "Arena out of memory: requested {} bytes (align {}), {} available",
                size,
                align,
                available
            );
            return Err(AllocError::OutOfMemory {
                allocator: self.name(),
                requested: size,
                available,
            });
        };

        let ptr = align_forward(self.region.at(current), align);
        self.allocated.set(new_allocated);

        if flags.contains(AllocFlags::ZERO_MEMORY) {
            unsafe { mem_zero(ptr, size) };
        }
        Ok(ptr)
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _old_size: usize) -> AllocResult<()> {
        // Arena doesn't support individual deallocation
        Ok(())
    }

    fn free_all(&self) -> AllocResult<()> {
        self.check();
        log::debug!("Reset arena ({} of {} bytes in use)", self.allocated(), self.capacity());
        self.allocated.set(0);
        Ok(())
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        if !self.all_checkpoints_closed() {
            log::error!("Arena dropped with {} open temp checkpoint(s)", self.temp_count.get());
        }
    }
}

/// Arena statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaStats {
    pub capacity: usize,
    pub allocated: usize,
    pub remaining: usize,
    pub open_checkpoints: usize,
}

/// Temp checkpoint over an arena
///
/// Restores the arena to where it was at [`Arena::begin_temp`] when
/// [`TempArena::end`] is called or the checkpoint is dropped. Checkpoints
/// must end in the reverse order they began.
pub struct TempArena<'s> {
    arena: &'s Arena<'s>,
    original: usize,
    depth: usize,
    ended: bool,
}

impl<'s> TempArena<'s> {
    /// Access the arena for allocations
    pub fn arena(&self) -> &'s Arena<'s> {
        self.arena
    }

    /// Allocated byte count saved at the start of the checkpoint
    pub fn saved(&self) -> usize {
        self.original
    }

    /// Close the checkpoint, discarding everything allocated since it began
    #[track_caller]
    pub fn end(mut self) {
        self.close();
    }

    #[track_caller]
    fn close(&mut self) {
        let arena = self.arena;
        let open = arena.temp_count.get();

        assert!(open > 0, "temp arena ended more times than begun");
        assert_eq!(open, self.depth, "temp arenas must end in LIFO order");
        assert!(
            arena.allocated.get() >= self.original,
            "arena shrank below a temp checkpoint ({} < {})",
            arena.allocated.get(),
            self.original
        );

        arena.allocated.set(self.original);
        arena.temp_count.set(open - 1);
        self.ended = true;
    }
}

impl Drop for TempArena<'_> {
    fn drop(&mut self) {
        if !self.ended && !std::thread::panicking() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocatorExt, HeapAllocator};

    #[test]
    fn test_arena_allocation() {
        let heap = HeapAllocator::new();
        let arena = Arena::from_allocator(&heap, 1024).unwrap();

        let a = arena.alloc_value(42i32).unwrap();
        let b = arena.alloc_value(3.5f32).unwrap();

        unsafe {
            assert_eq!(*a.as_ptr(), 42);
            assert_eq!(*b.as_ptr(), 3.5);
        }
    }

    #[test]
    fn test_arena_slice() {
        let mut memory = [0u8; 256];
        let arena = Arena::from_memory(&mut memory);

        let data = [1, 2, 3, 4, 5];
        let slice = arena.alloc_copy(&data).unwrap();

        unsafe {
            assert_eq!(core::slice::from_raw_parts(slice.as_ptr(), 5), &[1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_arena_temp() {
        let heap = HeapAllocator::new();
        let arena = Arena::from_allocator(&heap, 1024).unwrap();
        arena.alloc(10).unwrap();

        let initial = arena.allocated();

        {
            let _temp = arena.begin_temp();
            arena.alloc_value(42i32).unwrap();
            arena.alloc_value(42i32).unwrap();
            assert!(arena.allocated() > initial);
            assert_eq!(arena.open_checkpoints(), 1);
        }

        // Memory reclaimed after scope
        assert_eq!(arena.allocated(), initial);
        assert!(arena.all_checkpoints_closed());
    }

    #[test]
    fn test_arena_out_of_memory() {
        let heap = HeapAllocator::new();
        let arena = Arena::from_allocator(&heap, 64).unwrap();

        arena.alloc(48).unwrap();
        let err = arena.alloc(32).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { available: 16, .. }));
        // A failed allocation leaves the arena untouched
        assert_eq!(arena.allocated(), 48);
    }

    #[test]
    fn test_size_remaining() {
        let heap = HeapAllocator::new();
        let arena = Arena::from_allocator(&heap, 128).unwrap();

        assert_eq!(arena.size_remaining(16), 128);
        arena.allocate(3, 1, AllocFlags::NONE).unwrap();
        assert_eq!(arena.size_remaining(1), 125);
        assert_eq!(arena.size_remaining(16), 112);
    }

    #[test]
    fn test_sub_arena() {
        let heap = HeapAllocator::new();
        let parent = Arena::from_allocator(&heap, 1024).unwrap();

        {
            let child = parent.sub_arena(256).unwrap();
            assert_eq!(child.capacity(), 256);
            assert_eq!(parent.allocated(), 256);

            let ptr = child.alloc(200).unwrap();
            assert!(child.alloc(100).is_err());
            unsafe { child.free(ptr, 200).unwrap() };
        }

        parent.free_all().unwrap();
        assert_eq!(parent.allocated(), 0);
    }

    #[test]
    fn test_region_returned_to_backing() {
        let heap = HeapAllocator::new();
        {
            let _arena = Arena::from_allocator(&heap, 4096).unwrap();
            assert_eq!(heap.live_blocks(), 1);
        }
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    #[should_panic(expected = "LIFO")]
    fn test_temp_out_of_order_panics() {
        let mut memory = [0u8; 128];
        let arena = Arena::from_memory(&mut memory);

        let outer = arena.begin_temp();
        let inner = arena.begin_temp();
        outer.end();
        inner.end();
    }

    #[test]
    #[should_panic(expected = "open temp checkpoint")]
    fn test_reset_with_open_temp_panics() {
        let mut memory = [0u8; 128];
        let arena = Arena::from_memory(&mut memory);

        let temp = arena.begin_temp();
        let _ = arena.free_all();
        temp.end();
    }
}
