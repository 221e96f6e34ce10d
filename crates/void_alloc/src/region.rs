//! Backing memory shared by the region-based allocators

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::{AllocFlags, AllocResult, Allocator};

/// Who releases the region
enum Owner<'a> {
    /// Memory lent by the caller (a slice, raw memory or a parent arena)
    Borrowed(PhantomData<&'a mut [u8]>),
    /// Memory obtained from a backing allocator, returned on drop
    Backing(&'a (dyn Allocator + Sync)),
}

/// One contiguous block of memory an allocator carves up
pub(crate) struct Region<'a> {
    start: NonNull<u8>,
    len: usize,
    owner: Owner<'a>,
}

impl<'a> Region<'a> {
    /// Borrow a caller-provided buffer
    pub fn from_slice(memory: &'a mut [u8]) -> Self {
        let len = memory.len();
        Self {
            start: NonNull::from(memory).cast(),
            len,
            owner: Owner::Borrowed(PhantomData),
        }
    }

    /// Wrap raw memory that outlives `'a`
    ///
    /// # Safety
    /// `start` must be valid for reads and writes of `len` bytes for `'a` and
    /// must not be accessed through any other path meanwhile.
    pub unsafe fn from_raw(start: NonNull<u8>, len: usize) -> Self {
        Self {
            start,
            len,
            owner: Owner::Borrowed(PhantomData),
        }
    }

    /// Obtain `len` bytes from `backing`
    pub fn allocate(backing: &'a (dyn Allocator + Sync), len: usize, align: usize) -> AllocResult<Self> {
        let start = backing.allocate(len, align, AllocFlags::NONE)?;
        Ok(Self {
            start,
            len,
            owner: Owner::Backing(backing),
        })
    }

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Address one past the end
    #[inline]
    pub fn end_addr(&self) -> usize {
        self.start.as_ptr() as usize + self.len
    }

    /// Check whether `ptr` points inside the region
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.start.as_ptr() as usize && addr < self.end_addr()
    }

    /// Byte offset of `ptr` from the region start
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> usize {
        debug_assert!(ptr as usize >= self.start.as_ptr() as usize);
        ptr as usize - self.start.as_ptr() as usize
    }

    /// Pointer `offset` bytes into the region
    #[inline]
    pub fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);
        // Safety: offset stays within (or one past) the region
        unsafe { crate::mem::ptr_add(self.start, offset) }
    }

    /// Shrink the usable window to `[offset, offset + len)`
    pub fn narrow(&mut self, offset: usize, len: usize) {
        assert!(offset + len <= self.len, "narrowed window exceeds region");
        // Only borrowed regions may be narrowed: backing allocators expect
        // the original pointer and size back.
        assert!(
            matches!(self.owner, Owner::Borrowed(_)),
            "cannot narrow a region owned by a backing allocator"
        );
        self.start = self.at(offset);
        self.len = len;
    }

    /// True when the region goes back to a backing allocator on drop
    pub fn is_owned(&self) -> bool {
        matches!(self.owner, Owner::Backing(_))
    }
}

// Safety: the region has exclusive access to its memory and a backing
// allocator is shared through a `Sync` reference.
unsafe impl Send for Region<'_> {}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        if let Owner::Backing(backing) = &self.owner {
            // Safety: the region was allocated from `backing` with this size
            if let Err(e) = unsafe { backing.free(self.start, self.len) } {
                log::error!("Failed to release {} byte region to {}: {}", self.len, backing.name(), e);
            }
        }
    }
}
