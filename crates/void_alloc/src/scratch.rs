//! Scratch allocator - ring buffer with lazy in-order reclamation

use core::cell::Cell;
use core::ptr::NonNull;

use crate::header::{AllocationHeader, BlockState, HEADER_SIZE};
use crate::mem::{align_down, align_offset, align_up, assert_power_of_two, mem_zero, WORD};
use crate::region::Region;
use crate::{AllocError, AllocFlags, AllocResult, Allocator, DEFAULT_ALIGNMENT};

/// Scratch allocator for short-lived temporary buffers
///
/// Blocks are carved from a ring buffer at the allocation cursor. Freeing a
/// block only marks it; the reclamation cursor then advances over every
/// consecutive freed block, so memory comes back in allocation order. A
/// block freed ahead of older live blocks stays unreclaimed until they are
/// freed too.
///
/// ```text
///          free_point       alloc_point
///              v                v
/// | reclaimed | in use ........ | available ...... |
/// ```
///
/// When a block does not fit before the end of the buffer, the tail is
/// marked as a wrap block and allocation restarts at the base. The call
/// fails whenever the block would run into memory still in use, even if
/// the buffer has room elsewhere.
pub struct ScratchAllocator<'a> {
    /// Backing memory
    region: Region<'a>,
    /// Usable bytes, a multiple of the word size
    capacity: usize,
    /// Offset where the next block starts
    alloc_point: Cell<usize>,
    /// Offset of the oldest block not yet reclaimed
    free_point: Cell<usize>,
}

impl<'a> ScratchAllocator<'a> {
    /// Create a scratch allocator over caller-provided memory
    pub fn from_memory(memory: &'a mut [u8]) -> Self {
        Self::with_region(Region::from_slice(memory))
    }

    /// Create a scratch allocator over raw memory
    ///
    /// # Safety
    /// `start` must be valid for reads and writes of `size` bytes for `'a`
    /// and must not be used through any other path meanwhile.
    pub unsafe fn from_raw(start: NonNull<u8>, size: usize) -> Self {
        Self::with_region(Region::from_raw(start, size))
    }

    /// Create a scratch allocator whose buffer is allocated from `backing`
    pub fn from_allocator(backing: &'a (dyn Allocator + Sync), size: usize) -> AllocResult<Self> {
        let region = Region::allocate(backing, size, DEFAULT_ALIGNMENT)?;
        Ok(Self::with_region(region))
    }

    fn with_region(mut region: Region<'a>) -> Self {
        let padding = align_offset(region.start().as_ptr(), WORD);
        if padding != 0 {
            let len = region.len().saturating_sub(padding);
            region.narrow(padding.min(region.len()), len);
        }

        let capacity = align_down(region.len(), WORD);
        assert!(
            capacity > HEADER_SIZE,
            "scratch buffer of {} bytes is too small",
            capacity
        );

        log::debug!("Created scratch allocator of {} bytes", capacity);
        Self {
            region,
            capacity,
            alloc_point: Cell::new(0),
            free_point: Cell::new(0),
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset of the allocation cursor
    pub fn alloc_point(&self) -> usize {
        self.alloc_point.get()
    }

    /// Offset of the reclamation cursor
    pub fn free_point(&self) -> usize {
        self.free_point.get()
    }

    /// Check whether `ptr` lies in the part of the ring still in use
    pub fn is_in_use(&self, ptr: *const u8) -> bool {
        if !self.region.contains(ptr) {
            return false;
        }
        let offset = self.region.offset_of(ptr);
        let free = self.free_point.get();
        let alloc = self.alloc_point.get();

        if free == alloc {
            false
        } else if alloc > free {
            offset >= free && offset < alloc
        } else {
            offset >= free || offset < alloc
        }
    }

    /// Bytes between the reclamation and allocation cursors
    pub fn in_use(&self) -> usize {
        let free = self.free_point.get();
        let alloc = self.alloc_point.get();
        if alloc >= free {
            alloc - free
        } else {
            self.capacity - free + alloc
        }
    }

    /// Get statistics
    pub fn stats(&self) -> ScratchStats {
        ScratchStats {
            capacity: self.capacity,
            in_use: self.in_use(),
            alloc_point: self.alloc_point(),
            free_point: self.free_point(),
        }
    }

    /// Data offset and end offset of a block whose header starts at `header_at`
    fn place(&self, header_at: usize, size: usize, align: usize) -> Option<(usize, usize)> {
        if self.capacity - header_at < HEADER_SIZE {
            return None;
        }
        let base = self.region.start().as_ptr() as usize;
        let data = align_up(base + header_at + HEADER_SIZE, align) - base;
        let end = data.checked_add(size)?;
        (end <= self.capacity).then_some((data, end))
    }

    /// Check that `[start, end)` stays clear of the in-use interval and does
    /// not close the ring completely
    fn fits(start: usize, end: usize, free: usize, alloc: usize) -> bool {
        if free == alloc {
            true
        } else if alloc > free {
            start >= alloc || end < free
        } else {
            start >= alloc && end < free
        }
    }

    /// Advance the reclamation cursor over freed and wrap blocks
    fn reclaim(&self) {
        let alloc = self.alloc_point.get();
        let mut free = self.free_point.get();

        while free != alloc {
            if self.capacity - free < HEADER_SIZE {
                // Tail too short for a header: implicit wrap
                free = 0;
                continue;
            }

            let header = unsafe { AllocationHeader::read_at(self.region.at(free)) };
            match header.state() {
                BlockState::Live => break,
                BlockState::Freed | BlockState::Wrap => free += header.span(),
            }
        }

        self.free_point.set(free);
    }
}

impl Allocator for ScratchAllocator<'_> {
    fn name(&self) -> &'static str {
        "scratch"
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        assert_power_of_two(align);
        let align = align.max(WORD);

        let out_of_memory = || AllocError::OutOfMemory {
            allocator: self.name(),
            requested: size,
            available: self.capacity - self.in_use(),
        };

        // Zero-size blocks still take a quantum so their data stays inside the buffer
        let quantized = size
            .max(1)
            .checked_add(WORD - 1)
            .map(|size| align_down(size, WORD))
            .ok_or_else(out_of_memory)?;

        let mut free = self.free_point.get();
        let mut alloc = self.alloc_point.get();

        let mut header_at = alloc;
        let mut wrap_marker = None;
        let mut placed = self.place(alloc, quantized, align);

        if placed.is_none() {
            if free == alloc {
                // Nothing in use: restart the whole ring at the base
                free = 0;
                alloc = 0;
            } else if self.capacity - alloc >= HEADER_SIZE {
                wrap_marker = Some(alloc);
            }
            header_at = 0;
            placed = self.place(0, quantized, align);
        }

        let Some((data_at, end_at)) = placed.filter(|(_, end)| Self::fits(header_at, *end, free, alloc))
        else {
            log::warn!(
                "Scratch allocator out of memory: requested {} bytes (align {}), {} of {} bytes in use",
                size,
                align,
                self.in_use(),
                self.capacity
            );
            return Err(out_of_memory());
        };

        unsafe {
            if let Some(marker) = wrap_marker {
                let at = self.region.at(marker);
                let header = AllocationHeader::with_state(BlockState::Wrap, self.capacity - marker, 0);
                AllocationHeader::write(at, self.region.at(marker + HEADER_SIZE), header);
            }

            let data = self.region.at(data_at);
            AllocationHeader::write(
                self.region.at(header_at),
                data,
                AllocationHeader::new(end_at - header_at, size),
            );

            self.free_point.set(free);
            self.alloc_point.set(end_at);

            if flags.contains(AllocFlags::ZERO_MEMORY) {
                mem_zero(data, size);
            }
            Ok(data)
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _old_size: usize) -> AllocResult<()> {
        assert!(
            self.region.contains(ptr.as_ptr()) && self.region.offset_of(ptr.as_ptr()) < self.capacity,
            "pointer {:p} is outside the scratch buffer",
            ptr
        );

        let (header_at, header) = AllocationHeader::read(ptr);
        assert_eq!(header.state(), BlockState::Live, "scratch block {:p} freed twice", ptr);
        AllocationHeader::set_state(header_at, BlockState::Freed);

        self.reclaim();
        Ok(())
    }

    fn free_all(&self) -> AllocResult<()> {
        log::debug!("Reset scratch allocator ({} bytes in use)", self.in_use());
        self.alloc_point.set(0);
        self.free_point.set(0);
        Ok(())
    }
}

/// Scratch allocator statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchStats {
    pub capacity: usize,
    pub in_use: usize,
    pub alloc_point: usize,
    pub free_point: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocatorExt, HeapAllocator};

    #[test]
    fn test_scratch_in_order_reclaim() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 1024).unwrap();

        let a = scratch.alloc(40).unwrap();
        let b = scratch.alloc(40).unwrap();
        let c = scratch.alloc(40).unwrap();
        let c_header = unsafe { scratch.region.offset_of(AllocationHeader::locate(c).as_ptr() as *const u8) };

        unsafe {
            scratch.free(a, 40).unwrap();
            assert!(!scratch.is_in_use(a.as_ptr()));
            assert!(scratch.is_in_use(b.as_ptr()));

            scratch.free(b, 40).unwrap();
        }

        assert_eq!(scratch.free_point(), c_header);
        assert!(scratch.is_in_use(c.as_ptr()));
    }

    #[test]
    fn test_scratch_out_of_order_reclaim() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 1024).unwrap();

        let a = scratch.alloc(40).unwrap();
        let b = scratch.alloc(40).unwrap();
        let c = scratch.alloc(40).unwrap();

        unsafe {
            scratch.free(c, 40).unwrap();
            assert_eq!(scratch.free_point(), 0);

            scratch.free(a, 40).unwrap();
            assert!(scratch.free_point() > 0);
            assert!(scratch.is_in_use(b.as_ptr()));

            scratch.free(b, 40).unwrap();
        }

        assert_eq!(scratch.free_point(), scratch.alloc_point());
        assert_eq!(scratch.in_use(), 0);
    }

    #[test]
    fn test_scratch_wraps_around() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 256).unwrap();

        // Header at 0, data at 32, end at 96; next block spans 96..192
        let a = scratch.alloc(64).unwrap();
        let b = scratch.alloc(64).unwrap();
        assert_eq!(scratch.alloc_point(), 192);

        // Does not fit in the tail and `a` still blocks the base
        assert!(scratch.alloc(64).is_err());

        unsafe { scratch.free(a, 64).unwrap() };
        assert_eq!(scratch.free_point(), 96);

        // Ending exactly at the free cursor would close the ring
        assert!(scratch.alloc(64).is_err());

        // 48 bytes do not fit in the 64 byte tail, so the block wraps
        let wrapped = scratch.alloc(48).unwrap();
        assert_eq!(scratch.region.offset_of(wrapped.as_ptr()), 32);
        assert_eq!(scratch.alloc_point(), 80);

        // Reclaiming `b` runs over the wrap marker back to the base
        unsafe { scratch.free(b, 64).unwrap() };
        assert_eq!(scratch.free_point(), 0);
        assert!(scratch.is_in_use(wrapped.as_ptr()));
    }

    #[test]
    fn test_scratch_empty_ring_restarts_at_base() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 256).unwrap();

        let a = scratch.alloc(100).unwrap();
        unsafe { scratch.free(a, 100).unwrap() };
        assert_eq!(scratch.in_use(), 0);
        assert_eq!(scratch.alloc_point(), scratch.free_point());

        // 200 bytes no longer fit after the cursor, but the ring is empty
        let b = scratch.alloc(200).unwrap();
        assert_eq!(scratch.free_point(), 0);
        assert!(scratch.is_in_use(b.as_ptr()));
    }

    #[test]
    fn test_scratch_too_large() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 128).unwrap();
        assert!(matches!(scratch.alloc(256), Err(AllocError::OutOfMemory { .. })));
    }

    #[test]
    fn test_scratch_free_all() {
        let mut memory = vec![0u8; 512];
        let scratch = ScratchAllocator::from_memory(&mut memory);

        scratch.alloc(64).unwrap();
        scratch.alloc(64).unwrap();
        scratch.free_all().unwrap();

        assert_eq!(scratch.alloc_point(), 0);
        assert_eq!(scratch.free_point(), 0);
    }

    #[test]
    #[should_panic(expected = "outside the scratch buffer")]
    fn test_scratch_foreign_free_panics() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 128).unwrap();
        let foreign = heap.alloc(16).unwrap();
        let _ = unsafe { scratch.free(foreign, 16) };
    }

    #[test]
    fn test_scratch_implicit_wrap() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 256).unwrap();

        // Header at 0, data at 24, end at 64; second block ends at 248
        let a = scratch.allocate(40, 8, AllocFlags::NONE).unwrap();
        let b = scratch.allocate(160, 8, AllocFlags::NONE).unwrap();
        assert_eq!(scratch.alloc_point(), scratch.capacity() - 8);

        unsafe { scratch.free(a, 40).unwrap() };
        assert_eq!(scratch.free_point(), 64);

        // The 8 byte tail has no room for a wrap marker
        let wrapped = scratch.allocate(16, 8, AllocFlags::NONE).unwrap();
        assert_eq!(scratch.region.offset_of(wrapped.as_ptr()), 24);
        assert_eq!(scratch.alloc_point(), 40);

        unsafe { scratch.free(b, 160).unwrap() };
        assert_eq!(scratch.free_point(), 0);
        assert!(scratch.is_in_use(wrapped.as_ptr()));
        assert!(!scratch.is_in_use(b.as_ptr()));

        unsafe { scratch.free(wrapped, 16).unwrap() };
        assert_eq!(scratch.in_use(), 0);
    }

    #[test]
    fn test_scratch_zero_size_stays_inside_buffer() {
        let heap = HeapAllocator::new();
        let scratch = ScratchAllocator::from_allocator(&heap, 256).unwrap();

        // Data at 24, end at 232: only a header fits in the tail
        let a = scratch.allocate(208, 8, AllocFlags::NONE).unwrap();
        assert!(scratch.allocate(0, 8, AllocFlags::NONE).is_err());

        unsafe { scratch.free(a, 208).unwrap() };
        assert_eq!(scratch.free_point(), 232);

        let empty = scratch.allocate(0, 8, AllocFlags::NONE).unwrap();
        assert!(scratch.region.offset_of(empty.as_ptr()) < scratch.capacity());
        assert!(scratch.is_in_use(empty.as_ptr()));

        unsafe { scratch.free(empty, 0).unwrap() };
        assert_eq!(scratch.in_use(), 0);
    }
}
