//! Pool allocator - fixed-size block allocation

use core::cell::Cell;
use core::ptr::NonNull;

use crate::mem::{align_up, assert_power_of_two, mem_zero, WORD};
use crate::region::Region;
use crate::{AllocError, AllocFlags, AllocResult, Allocator, AllocatorMode};

/// End of the free chain
const NIL: usize = usize::MAX;

/// Blocks tracked per word of the free map
const MAP_BITS: usize = u64::BITS as usize;

/// Pool allocator for fixed-size blocks
///
/// Every block has the same size and alignment, so a pool serves exactly
/// one object shape. Free blocks are chained through their own first word,
/// which holds the index of the next free block while the block is free.
/// Allocation pops the head and free pushes it back, so the most recently
/// freed block is handed out first.
///
/// A bitmap beside the chain records which blocks are free, so a double
/// free is caught in constant time in every build.
///
/// `free_all` is not implemented and reports [`AllocError::Unsupported`].
pub struct Pool<'a> {
    /// Backing memory
    region: Region<'a>,
    /// Block size requested at construction
    block_size: usize,
    /// Block alignment requested at construction
    block_align: usize,
    /// Distance between consecutive blocks
    stride: usize,
    /// Number of blocks
    block_count: usize,
    /// Index of the first free block
    free_head: Cell<usize>,
    /// One bit per block, set while the block is on the free chain
    free_map: Box<[Cell<u64>]>,
    /// Number of allocated blocks
    allocated: Cell<usize>,
}

impl<'a> Pool<'a> {
    /// Create a pool of `block_count` blocks of `block_size` bytes with the
    /// default alignment
    pub fn new(backing: &'a (dyn Allocator + Sync), block_count: usize, block_size: usize) -> AllocResult<Self> {
        Self::with_align(backing, block_count, block_size, crate::DEFAULT_ALIGNMENT)
    }

    /// Create a pool with an explicit block alignment
    pub fn with_align(
        backing: &'a (dyn Allocator + Sync),
        block_count: usize,
        block_size: usize,
        block_align: usize,
    ) -> AllocResult<Self> {
        assert_power_of_two(block_align);
        assert!(block_count > 0, "pool needs at least one block");

        // Free blocks hold a link word
        let stride = align_up(block_size.max(WORD), block_align);
        let total = stride.checked_mul(block_count).ok_or(AllocError::OutOfMemory {
            allocator: "pool",
            requested: usize::MAX,
            available: 0,
        })?;

        let region = Region::allocate(backing, total, block_align)?;

        let pool = Self {
            region,
            block_size,
            block_align,
            stride,
            block_count,
            free_head: Cell::new(NIL),
            free_map: (0..block_count.div_ceil(MAP_BITS)).map(|_| Cell::new(0)).collect(),
            allocated: Cell::new(0),
        };
        pool.initialize_free_list();

        log::debug!(
            "Created pool of {} blocks ({} bytes, align {}, stride {})",
            block_count,
            block_size,
            block_align,
            stride
        );
        Ok(pool)
    }

    /// Create a pool for a specific type
    pub fn for_type<T>(backing: &'a (dyn Allocator + Sync), count: usize) -> AllocResult<Self> {
        Self::with_align(
            backing,
            count,
            core::mem::size_of::<T>(),
            core::mem::align_of::<T>(),
        )
    }

    fn initialize_free_list(&self) {
        // Chain blocks in address order so allocation starts at the front
        for index in 0..self.block_count {
            let next = if index + 1 < self.block_count { index + 1 } else { NIL };
            unsafe { self.write_link(index, next) };
            self.set_free(index, true);
        }
        self.free_head.set(0);
    }

    fn block_ptr(&self, index: usize) -> NonNull<u8> {
        self.region.at(index * self.stride)
    }

    unsafe fn read_link(&self, index: usize) -> usize {
        self.block_ptr(index).cast::<usize>().as_ptr().read_unaligned()
    }

    unsafe fn write_link(&self, index: usize, next: usize) {
        self.block_ptr(index).cast::<usize>().as_ptr().write_unaligned(next);
    }

    /// Block index of `ptr`, panicking if it is not a block of this pool
    #[track_caller]
    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        assert!(
            self.region.contains(ptr.as_ptr()),
            "pointer {:p} does not belong to this pool",
            ptr
        );
        let offset = self.region.offset_of(ptr.as_ptr());
        assert!(
            offset % self.stride == 0,
            "pointer {:p} is not at a block boundary",
            ptr
        );
        offset / self.stride
    }

    /// Check whether block `index` is currently on the free chain
    fn is_free(&self, index: usize) -> bool {
        self.free_map[index / MAP_BITS].get() & (1 << (index % MAP_BITS)) != 0
    }

    fn set_free(&self, index: usize, free: bool) {
        let word = &self.free_map[index / MAP_BITS];
        let bit = 1u64 << (index % MAP_BITS);
        word.set(if free { word.get() | bit } else { word.get() & !bit });
    }

    /// Indices on the free chain, head first
    pub fn free_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let mut current = self.free_head.get();
        core::iter::from_fn(move || {
            if current == NIL {
                return None;
            }
            let index = current;
            current = unsafe { self.read_link(index) };
            Some(index)
        })
    }

    /// Check whether `ptr` is the start of one of this pool's blocks
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr.as_ptr()) && self.region.offset_of(ptr.as_ptr()) % self.stride == 0
    }

    /// Get the block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the block alignment
    pub fn block_align(&self) -> usize {
        self.block_align
    }

    /// Get the total number of blocks
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Get the number of allocated blocks
    pub fn allocated_count(&self) -> usize {
        self.allocated.get()
    }

    /// Get the number of free blocks
    pub fn free_count(&self) -> usize {
        self.block_count - self.allocated_count()
    }

    /// Get statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            stride: self.stride,
            total_blocks: self.block_count,
            allocated_blocks: self.allocated_count(),
            free_blocks: self.free_count(),
        }
    }
}

impl Allocator for Pool<'_> {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        assert_eq!(size, self.block_size, "pool serves blocks of exactly {} bytes", self.block_size);
        assert_eq!(align, self.block_align, "pool serves blocks aligned to exactly {}", self.block_align);

        let head = self.free_head.get();
        if head == NIL {
            log::warn!("Pool exhausted: all {} blocks in use", self.block_count);
            return Err(AllocError::OutOfMemory {
                allocator: self.name(),
                requested: size,
                available: 0,
            });
        }

        self.free_head.set(unsafe { self.read_link(head) });
        self.set_free(head, false);
        self.allocated.set(self.allocated.get() + 1);

        let ptr = self.block_ptr(head);
        if flags.contains(AllocFlags::ZERO_MEMORY) {
            unsafe { mem_zero(ptr, self.block_size) };
        }
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, old_size: usize) -> AllocResult<()> {
        assert_eq!(old_size, self.block_size, "pool blocks are exactly {} bytes", self.block_size);
        let index = self.index_of(ptr);
        assert!(!self.is_free(index), "pool block {} freed twice", index);

        self.write_link(index, self.free_head.get());
        self.free_head.set(index);
        self.set_free(index, true);
        self.allocated.set(self.allocated.get() - 1);
        Ok(())
    }

    fn free_all(&self) -> AllocResult<()> {
        log::error!("Pool free_all is not implemented");
        Err(AllocError::Unsupported {
            allocator: self.name(),
            mode: AllocatorMode::FreeAll,
        })
    }

    unsafe fn resize(
        &self,
        _ptr: Option<NonNull<u8>>,
        _old_size: usize,
        _new_size: usize,
        _align: usize,
        _flags: AllocFlags,
    ) -> AllocResult<Option<NonNull<u8>>> {
        panic!("cannot resize a block allocated by a pool");
    }
}

/// Pool statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub stride: usize,
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
}
