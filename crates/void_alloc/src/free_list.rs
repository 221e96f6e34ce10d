//! Free list allocator - general purpose with fragmentation management

use core::cell::Cell;
use core::ptr::NonNull;

use crate::header::{AllocationHeader, BlockState, HEADER_SIZE};
use crate::mem::{align_down, align_forward, align_offset, align_up, assert_power_of_two, mem_zero, ptr_add, WORD};
use crate::region::Region;
use crate::{AllocError, AllocFlags, AllocResult, Allocator, DEFAULT_ALIGNMENT};

/// End of the free chain
const NIL: usize = usize::MAX;

/// Free block node, stored at the start of every free block
#[repr(C)]
#[derive(Clone, Copy)]
struct FreeBlock {
    size: usize,
    /// Offset of the next free block
    next: usize,
}

/// Free list allocator
///
/// General-purpose allocator over a single region. Free blocks form a chain
/// kept in address order. Allocation takes the first block that fits and
/// splits off the unused tail; freeing merges the block with free
/// neighbours on either side.
///
/// Every live block starts with an [`AllocationHeader`] recording its span,
/// so `free` only needs the pointer.
///
/// Allocation and free are O(n) in the number of free blocks.
pub struct FreeList<'a> {
    /// Backing memory
    region: Region<'a>,
    /// Usable bytes, a multiple of the word size
    capacity: usize,
    /// Offset of the first free block
    head: Cell<usize>,
    /// Bytes held by live blocks, headers and padding included
    allocated: Cell<usize>,
    /// Number of live blocks
    allocation_count: Cell<usize>,
}

impl<'a> FreeList<'a> {
    /// Create a free list over caller-provided memory
    pub fn from_memory(memory: &'a mut [u8]) -> Self {
        Self::with_region(Region::from_slice(memory))
    }

    /// Create a free list over raw memory
    ///
    /// # Safety
    /// `start` must be valid for reads and writes of `size` bytes for `'a`
    /// and must not be used through any other path meanwhile.
    pub unsafe fn from_raw(start: NonNull<u8>, size: usize) -> Self {
        Self::with_region(Region::from_raw(start, size))
    }

    /// Create a free list whose region is allocated from `backing`
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
            "free list region of {} bytes is too small",
            capacity
        );

        let free_list = Self {
            region,
            capacity,
            head: Cell::new(NIL),
            allocated: Cell::new(0),
            allocation_count: Cell::new(0),
        };
        free_list.reset();

        log::debug!("Created free list of {} bytes", capacity);
        free_list
    }

    fn reset(&self) {
        unsafe {
            self.write_node(0, FreeBlock {
                size: self.capacity,
                next: NIL,
            });
        }
        self.head.set(0);
        self.allocated.set(0);
        self.allocation_count.set(0);
    }

    unsafe fn read_node(&self, offset: usize) -> FreeBlock {
        self.region.at(offset).cast::<FreeBlock>().as_ptr().read()
    }

    unsafe fn write_node(&self, offset: usize, node: FreeBlock) {
        self.region.at(offset).cast::<FreeBlock>().as_ptr().write(node);
    }

    /// Point `prev` (or the head when `None`) at `next`
    unsafe fn link(&self, prev: Option<usize>, next: usize) {
        match prev {
            Some(offset) => {
                let mut node = self.read_node(offset);
                node.next = next;
                self.write_node(offset, node);
            }
            None => self.head.set(next),
        }
    }

    /// Free blocks as `(offset, size)` pairs in address order
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut current = self.head.get();
        core::iter::from_fn(move || {
            if current == NIL {
                return None;
            }
            let offset = current;
            let node = unsafe { self.read_node(offset) };
            current = node.next;
            Some((offset, node.size))
        })
    }

    /// Size originally requested for the block at `ptr`
    ///
    /// # Safety
    /// `ptr` must be a live block from this allocator.
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        AllocationHeader::read(ptr).1.size()
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by live blocks, bookkeeping included
    pub fn used(&self) -> usize {
        self.allocated.get()
    }

    /// Number of live blocks
    pub fn allocation_count(&self) -> usize {
        self.allocation_count.get()
    }

    /// Get allocation statistics
    pub fn stats(&self) -> FreeListStats {
        let mut free_blocks = 0;
        let mut largest_free_block = 0;
        for (_, size) in self.free_blocks() {
            free_blocks += 1;
            largest_free_block = largest_free_block.max(size);
        }

        FreeListStats {
            capacity: self.capacity,
            used: self.used(),
            free: self.capacity - self.used(),
            free_blocks,
            largest_free_block,
            allocation_count: self.allocation_count(),
        }
    }
}

impl Allocator for FreeList<'_> {
    fn name(&self) -> &'static str {
        "free list"
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        assert_power_of_two(align);
        let align = align.max(WORD);

        let out_of_memory = |allocator: &Self| AllocError::OutOfMemory {
            allocator: allocator.name(),
            requested: size,
            available: allocator.capacity - allocator.used(),
        };

        // Room for the header and the worst-case alignment padding
        let total = match size.checked_add(align + HEADER_SIZE) {
            Some(total) if total <= isize::MAX as usize => align_up(total, WORD),
            _ => return Err(out_of_memory(self)),
        };

        let mut prev = None;
        let mut current = self.head.get();

        while current != NIL {
            let block = unsafe { self.read_node(current) };
            if block.size < total {
                prev = Some(current);
                current = block.next;
                continue;
            }

            let span = unsafe {
                if block.size - total <= HEADER_SIZE {
                    // Too small to be worth keeping: hand out the whole block
                    self.link(prev, block.next);
                    block.size
                } else {
                    let rest = current + total;
                    self.write_node(rest, FreeBlock {
                        size: block.size - total,
                        next: block.next,
                    });
                    self.link(prev, rest);
                    total
                }
            };

            let header_at = self.region.at(current);
            let data = unsafe {
                let data = align_forward(ptr_add(header_at, HEADER_SIZE), align);
                AllocationHeader::write(header_at, data, AllocationHeader::new(span, size));
                data
            };

            self.allocated.set(self.allocated.get() + span);
            self.allocation_count.set(self.allocation_count.get() + 1);

            if flags.contains(AllocFlags::ZERO_MEMORY) {
                unsafe { mem_zero(data, size) };
            }
            return Ok(data);
        }

        log::warn!(
            "Free list out of memory: no block fits {} bytes (align {}), {} of {} bytes used",
            size,
            align,
            self.used(),
            self.capacity
        );
        Err(out_of_memory(self))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _old_size: usize) -> AllocResult<()> {
        assert!(
            self.region.contains(ptr.as_ptr()),
            "pointer {:p} does not belong to this free list",
            ptr
        );

        let (header_at, header) = AllocationHeader::read(ptr);
        assert_eq!(header.state(), BlockState::Live, "free list block {:p} freed twice", ptr);

        let start = self.region.offset_of(header_at.as_ptr());
        let span = header.span();
        let end = start + span;
        assert!(end <= self.capacity, "corrupt free list header at offset {}", start);

        AllocationHeader::set_state(header_at, BlockState::Freed);

        // Find the free blocks on either side
        let mut prev = None;
        let mut current = self.head.get();
        while current != NIL && current < end {
            prev = Some(current);
            current = self.read_node(current).next;
        }

        if let Some(p) = prev {
            let node = self.read_node(p);
            assert!(
                p + node.size <= start,
                "corrupt free list: free block at {} overlaps freed block at {}",
                p,
                start
            );
        }

        let merged = match prev {
            Some(p) if p + self.read_node(p).size == start => {
                let mut node = self.read_node(p);
                node.size += span;
                self.write_node(p, node);
                p
            }
            _ => {
                self.write_node(start, FreeBlock {
                    size: span,
                    next: current,
                });
                self.link(prev, start);
                start
            }
        };

        if current == end {
            let next = self.read_node(current);
            let mut node = self.read_node(merged);
            node.size += next.size;
            node.next = next.next;
            self.write_node(merged, node);
        }

        self.allocated.set(self.allocated.get() - span);
        self.allocation_count.set(self.allocation_count.get() - 1);
        Ok(())
    }

    fn free_all(&self) -> AllocResult<()> {
        log::debug!(
            "Reset free list ({} live blocks, {} bytes)",
            self.allocation_count(),
            self.used()
        );
        self.reset();
        Ok(())
    }
}

/// Free list statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeListStats {
    pub capacity: usize,
    pub used: usize,
    pub free: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
    pub allocation_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{is_aligned, AllocatorExt, HeapAllocator};

    fn free_total(alloc: &FreeList<'_>) -> usize {
        alloc.free_blocks().map(|(_, size)| size).sum()
    }

    #[test]
    fn test_free_list_basic() {
        let heap = HeapAllocator::new();
        let alloc = FreeList::from_allocator(&heap, 1024).unwrap();

        let ptr1 = alloc.alloc_align(64, 8).unwrap();
        let ptr2 = alloc.alloc_align(128, 16).unwrap();

        assert_ne!(ptr1, ptr2);
        assert!(is_aligned(ptr2.as_ptr(), 16));
        assert_eq!(alloc.allocation_count(), 2);

        unsafe {
            alloc.free(ptr1, 64).unwrap();
            alloc.free(ptr2, 128).unwrap();
        }

        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.stats().free_blocks, 1);
    }

    #[test]
    fn test_free_list_coalesce() {
        let heap = HeapAllocator::new();
        let alloc = FreeList::from_allocator(&heap, 1024).unwrap();

        let ptr1 = alloc.alloc(100).unwrap();
        let ptr2 = alloc.alloc(100).unwrap();
        let ptr3 = alloc.alloc(100).unwrap();

        unsafe {
            alloc.free(ptr1, 100).unwrap();
            alloc.free(ptr3, 100).unwrap();
            // Blocks are now fragmented
            assert_eq!(alloc.stats().free_blocks, 2);

            alloc.free(ptr2, 100).unwrap();
            // After freeing ptr2, all blocks should coalesce
        }

        let stats = alloc.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, 1024);
    }

    #[test]
    fn test_header_reports_requested_size() {
        let mut memory = vec![0u8; 2048];
        let alloc = FreeList::from_memory(&mut memory);

        for (size, align) in [(1, 1), (7, 8), (33, 32), (100, 64), (5, 128)] {
            let ptr = alloc.allocate(size, align, AllocFlags::NONE).unwrap();
            assert!(is_aligned(ptr.as_ptr(), align));
            assert_eq!(unsafe { alloc.allocation_size(ptr) }, size);
            assert_eq!(alloc.used() + free_total(&alloc), alloc.capacity());
        }
    }

    #[test]
    fn test_small_remainder_consumes_block() {
        let heap = HeapAllocator::new();
        let alloc = FreeList::from_allocator(&heap, 256).unwrap();

        // 256 - align_up(200 + 16 + HEADER_SIZE, WORD) leaves at most a header
        let ptr = alloc.alloc(200).unwrap();
        assert_eq!(alloc.used(), 256);
        assert_eq!(alloc.free_blocks().count(), 0);
        assert!(alloc.alloc(1).is_err());

        unsafe { alloc.free(ptr, 200).unwrap() };
        assert_eq!(alloc.free_blocks().collect::<Vec<_>>(), vec![(0, 256)]);
    }

    #[test]
    fn test_free_all_restores_single_block() {
        let heap = HeapAllocator::new();
        let alloc = FreeList::from_allocator(&heap, 512).unwrap();

        for _ in 0..4 {
            alloc.alloc(40).unwrap();
        }
        alloc.free_all().unwrap();

        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.allocation_count(), 0);
        assert_eq!(alloc.free_blocks().collect::<Vec<_>>(), vec![(0, 512)]);
    }

    #[test]
    fn test_resize_moves_data() {
        let heap = HeapAllocator::new();
        let alloc = FreeList::from_allocator(&heap, 1024).unwrap();

        unsafe {
            let ptr = alloc.alloc_copy(&[9u8; 16]).unwrap();
            let grown = alloc
                .resize(Some(ptr), 16, 64, DEFAULT_ALIGNMENT, AllocFlags::NONE)
                .unwrap()
                .unwrap();
            assert_eq!(core::slice::from_raw_parts(grown.as_ptr(), 16), &[9u8; 16]);
            assert_eq!(alloc.allocation_count(), 1);
        }
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_panics() {
        let heap = HeapAllocator::new();
        let alloc = FreeList::from_allocator(&heap, 1024).unwrap();

        let a = alloc.alloc(32).unwrap();
        let b = alloc.alloc(32).unwrap();
        unsafe {
            alloc.free(a, 32).unwrap();
            // Merges into the block freed above, leaving its header behind
            alloc.free(b, 32).unwrap();
            let _ = alloc.free(b, 32);
        }
    }
}
