//! Mutex wrapper for sharing an allocator between threads

use core::ptr::NonNull;

use parking_lot::Mutex;

use crate::{AllocFlags, AllocResult, Allocator};

/// Allocator guarded by a mutex
///
/// The strategies themselves never lock. When one instance has to serve
/// several threads, wrap it here; every call takes the lock for its whole
/// duration.
pub struct Locked<A> {
    inner: Mutex<A>,
}

impl<A: Allocator> Locked<A> {
    /// Wrap an allocator
    pub fn new(allocator: A) -> Self {
        Self {
            inner: Mutex::new(allocator),
        }
    }

    /// Run `f` with exclusive access to the wrapped allocator
    pub fn with<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Unwrap the allocator
    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

impl<A: Allocator> Allocator for Locked<A> {
    fn name(&self) -> &'static str {
        self.inner.lock().name()
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        self.inner.lock().allocate(size, align, flags)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, old_size: usize) -> AllocResult<()> {
        self.inner.lock().free(ptr, old_size)
    }

    fn free_all(&self) -> AllocResult<()> {
        self.inner.lock().free_all()
    }

    unsafe fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> AllocResult<Option<NonNull<u8>>> {
        self.inner.lock().resize(ptr, old_size, new_size, align, flags)
    }
}
