//! Memory tracking wrapper

use core::ptr::NonNull;

use parking_lot::Mutex;

use crate::{AllocFlags, AllocResult, Allocator};

/// Allocation counters collected by [`Tracked`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub allocations: usize,
    pub frees: usize,
    pub failures: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

impl TrackingStats {
    /// Blocks allocated and not yet freed
    pub fn live_blocks(&self) -> usize {
        self.allocations - self.frees
    }
}

/// Wraps an allocator and records every call
///
/// Byte counts use the sizes callers pass in, so they are only as accurate
/// as the `old_size` values handed to `free` and `resize`. `free_all`
/// clears the live counts. The counters sit behind a mutex, so a tracked
/// heap can still back strategies on other threads.
pub struct Tracked<A> {
    inner: A,
    stats: Mutex<TrackingStats>,
}

impl<A: Allocator> Tracked<A> {
    /// Start tracking `inner`
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            stats: Mutex::new(TrackingStats::default()),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> TrackingStats {
        *self.stats.lock()
    }

    /// Access the wrapped allocator
    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn update(&self, f: impl FnOnce(&mut TrackingStats)) {
        let mut stats = self.stats.lock();
        f(&mut stats);
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
    }

    fn record_alloc(&self, result: &AllocResult<NonNull<u8>>, size: usize) {
        match result {
            Ok(ptr) => {
                log::trace!("{}: alloc {} bytes -> {:p}", self.inner.name(), size, ptr);
                self.update(|s| {
                    s.allocations += 1;
                    s.live_bytes += size;
                });
            }
            Err(e) => {
                log::trace!("{}: alloc {} bytes failed: {}", self.inner.name(), size, e);
                self.update(|s| s.failures += 1);
            }
        }
    }

    fn record_free(&self, size: usize) {
        self.update(|s| {
            s.frees += 1;
            s.live_bytes = s.live_bytes.saturating_sub(size);
        });
    }
}

impl<A: Allocator> Allocator for Tracked<A> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> AllocResult<NonNull<u8>> {
        let result = self.inner.allocate(size, align, flags);
        self.record_alloc(&result, size);
        result
    }

    unsafe fn free(&self, ptr: NonNull<u8>, old_size: usize) -> AllocResult<()> {
        log::trace!("{}: free {:p} ({} bytes)", self.inner.name(), ptr, old_size);
        self.inner.free(ptr, old_size)?;
        self.record_free(old_size);
        Ok(())
    }

    fn free_all(&self) -> AllocResult<()> {
        log::trace!("{}: free all", self.inner.name());
        self.inner.free_all()?;
        self.update(|s| {
            s.frees = s.allocations;
            s.live_bytes = 0;
        });
        Ok(())
    }

    unsafe fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> AllocResult<Option<NonNull<u8>>> {
        log::trace!(
            "{}: resize {:?} from {} to {} bytes",
            self.inner.name(),
            ptr,
            old_size,
            new_size
        );
        let result = self.inner.resize(ptr, old_size, new_size, align, flags);
        if let Ok(new) = &result {
            self.update(|s| {
                match (ptr.is_some(), new.is_some()) {
                    (false, true) => s.allocations += 1,
                    (true, false) => s.frees += 1,
                    _ => {}
                }
                s.live_bytes = s.live_bytes.saturating_sub(old_size)
                    + if new.is_some() { new_size } else { 0 };
            });
        }
        result
    }
}
