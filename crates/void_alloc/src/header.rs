//! Allocation headers
//!
//! Allocators that free individual blocks store an [`AllocationHeader`]
//! in front of every block they hand out. The data pointer may sit further
//! forward than the end of the header because of alignment; the words in
//! between are filled with [`SENTINEL`] so the header can be found again by
//! walking backward from the data pointer alone.
//!
//! ```text
//! | state | span | size | SENTINEL | SENTINEL | data ...
//! ^ header                                   ^ data pointer
//! ```
//!
//! `size` is the last header word and is bounded by `isize::MAX`, so it can
//! never be mistaken for the sentinel.

use core::ptr::NonNull;

use crate::mem::{ptr_add, ptr_sub, WORD};

/// Word written between a header and its aligned data
pub const SENTINEL: usize = usize::MAX;

/// Bytes occupied by an [`AllocationHeader`]
pub const HEADER_SIZE: usize = core::mem::size_of::<AllocationHeader>();

/// State of the block a header describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Handed out and not yet freed
    Live,
    /// Freed but not yet reclaimed
    Freed,
    /// Dead space at the end of a ring buffer
    Wrap,
}

impl BlockState {
    const LIVE: usize = 0x4c49_5645;
    const FREED: usize = 0x4652_4545;
    const WRAP: usize = 0x5752_4150;

    fn tag(self) -> usize {
        match self {
            BlockState::Live => Self::LIVE,
            BlockState::Freed => Self::FREED,
            BlockState::Wrap => Self::WRAP,
        }
    }

    #[track_caller]
    fn from_tag(tag: usize) -> Self {
        match tag {
            Self::LIVE => BlockState::Live,
            Self::FREED => BlockState::Freed,
            Self::WRAP => BlockState::Wrap,
            other => panic!("corrupt allocation header: unknown state tag {:#x}", other),
        }
    }
}

/// Metadata stored immediately before an allocated block
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationHeader {
    state: usize,
    /// Bytes from the header start to the end of the block
    span: usize,
    /// Size requested by the caller
    size: usize,
}

impl AllocationHeader {
    /// Create a header for a live block
    pub fn new(span: usize, size: usize) -> Self {
        Self::with_state(BlockState::Live, span, size)
    }

    /// Create a header in the given state
    pub fn with_state(state: BlockState, span: usize, size: usize) -> Self {
        assert!(size <= isize::MAX as usize, "allocation size {} overflows isize", size);
        Self {
            state: state.tag(),
            span,
            size,
        }
    }

    /// Block state
    #[track_caller]
    pub fn state(&self) -> BlockState {
        BlockState::from_tag(self.state)
    }

    /// Total bytes covered by the block, header included
    pub fn span(&self) -> usize {
        self.span
    }

    /// Size requested by the caller
    pub fn size(&self) -> usize {
        self.size
    }

    /// Write `header` at `at` and sentinel-fill every word up to `data`
    ///
    /// # Safety
    /// `at` must be word aligned, `data` must be word aligned and at least
    /// [`HEADER_SIZE`] bytes after `at`, and the whole range must be writable.
    pub unsafe fn write(at: NonNull<u8>, data: NonNull<u8>, header: AllocationHeader) {
        debug_assert!(at.as_ptr() as usize % WORD == 0);
        debug_assert!(data.as_ptr() as usize >= at.as_ptr() as usize + HEADER_SIZE);

        at.cast::<AllocationHeader>().as_ptr().write(header);

        let mut word = ptr_add(at, HEADER_SIZE);
        while word < data {
            word.cast::<usize>().as_ptr().write(SENTINEL);
            word = ptr_add(word, WORD);
        }
    }

    /// Locate the header of the block whose data starts at `data`
    ///
    /// # Safety
    /// `data` must have been produced by [`AllocationHeader::write`] and the
    /// header must still be intact.
    pub unsafe fn locate(data: NonNull<u8>) -> NonNull<AllocationHeader> {
        let mut end = data;
        while ptr_sub(end, WORD).cast::<usize>().as_ptr().read() == SENTINEL {
            end = ptr_sub(end, WORD);
        }
        ptr_sub(end, HEADER_SIZE).cast()
    }

    /// Read the header of the block whose data starts at `data`
    ///
    /// # Safety
    /// Same as [`AllocationHeader::locate`].
    pub unsafe fn read(data: NonNull<u8>) -> (NonNull<u8>, AllocationHeader) {
        let at = Self::locate(data);
        (at.cast(), at.as_ptr().read())
    }

    /// Read the header stored at `at`
    ///
    /// # Safety
    /// `at` must point at a header written by [`AllocationHeader::write`].
    pub unsafe fn read_at(at: NonNull<u8>) -> AllocationHeader {
        at.cast::<AllocationHeader>().as_ptr().read()
    }

    /// Change the state of the header stored at `at`
    ///
    /// # Safety
    /// `at` must point at a header written by [`AllocationHeader::write`].
    pub unsafe fn set_state(at: NonNull<u8>, state: BlockState) {
        (*at.cast::<AllocationHeader>().as_ptr()).state = state.tag();
    }
}
