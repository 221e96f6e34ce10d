//! Heap allocator - passthrough to the platform allocator

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::Layout;

use crate::mem::{align_forward, assert_power_of_two, ptr_add, ptr_sub};
use crate::{AllocError, AllocFlags, AllocResult, Allocator};

/// Bookkeeping stored just before every heap block
#[repr(C)]
#[derive(Clone, Copy)]
struct HeapHeader {
    /// Distance from the platform pointer to the data
    offset: usize,
    /// Bytes requested from the platform allocator
    total: usize,
    /// Bytes requested by the caller
    size: usize,
}

/// Heap allocator backed by the global platform allocator
///
/// The platform allocator needs the original layout back on free, but the
/// capability only hands `free` a pointer. Each block therefore
/// over-allocates, aligns forward by hand and keeps a small header in front
/// of the data describing the platform allocation.
///
/// Construct one explicitly and pass it by reference to whatever needs a
/// backing allocator. [`HeapAllocator::with_limit`] gives a bounded heap
/// that fails once the live byte count would pass the limit.
///
/// The counters are atomic, so one heap can back strategies living on
/// different threads.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
    limit: Option<usize>,
}

impl HeapAllocator {
    const HEADER_SIZE: usize = core::mem::size_of::<HeapHeader>();
    const HEADER_ALIGN: usize = core::mem::align_of::<HeapHeader>();

    /// Create an unbounded heap allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a heap allocator that refuses to hold more than `limit` live bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Number of blocks not yet freed
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    /// Bytes requested by callers and not yet freed
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Configured byte limit, if any
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn platform_layout(total: usize) -> Option<Layout> {
        Layout::from_size_align(total, Self::HEADER_ALIGN).ok()
    }

    /// Count `size` bytes as live, failing if that would pass the limit
    fn reserve(&self, size: usize) -> AllocResult<()> {
        let Some(limit) = self.limit else {
            self.live_bytes.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };

        self.live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|live| {
                let available = limit.saturating_sub(live);
                log::warn!("Heap limit reached: requested {} bytes, {} available", size, available);
                AllocError::OutOfMemory {
                    allocator: "heap",
                    requested: size,
                    available,
                }
            })
    }

    /// Platform allocation with the heap header written in front of the data
    unsafe fn allocate_block(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        let platform_err = AllocError::Platform { size, align };
        let total = size
            .checked_add(align + Self::HEADER_SIZE)
            .ok_or(platform_err)?;
        let layout = Self::platform_layout(total).ok_or(platform_err)?;

        let raw = if flags.contains(AllocFlags::ZERO_MEMORY) {
            std::alloc::alloc_zeroed(layout)
        } else {
            std::alloc::alloc(layout)
        };
        let raw = NonNull::new(raw).ok_or(platform_err)?;

        let data = align_forward(ptr_add(raw, Self::HEADER_SIZE), align);
        let offset = data.as_ptr() as usize - raw.as_ptr() as usize;
        ptr_sub(data, Self::HEADER_SIZE)
            .cast::<HeapHeader>()
            .as_ptr()
            .write(HeapHeader { offset, total, size });
        Ok(data)
    }
}

impl Allocator for HeapAllocator {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        assert_power_of_two(align);
        let align = align.max(Self::HEADER_ALIGN);

        self.reserve(size)?;
        match unsafe { self.allocate_block(size, align, flags) } {
            Ok(data) => {
                self.live_blocks.fetch_add(1, Ordering::Relaxed);
                Ok(data)
            }
            Err(e) => {
                self.live_bytes.fetch_sub(size, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _old_size: usize) -> AllocResult<()> {
        let header = ptr_sub(ptr, Self::HEADER_SIZE)
            .cast::<HeapHeader>()
            .as_ptr()
            .read();
        let raw = ptr_sub(ptr, header.offset);

        let layout = Self::platform_layout(header.total)
            .unwrap_or_else(|| panic!("corrupt heap header: total size {}", header.total));
        std::alloc::dealloc(raw.as_ptr(), layout);

        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(header.size, Ordering::Relaxed);
        Ok(())
    }
}
