//! Pointer and alignment primitives shared by every allocator

use core::ptr::NonNull;

/// Size of a machine word
pub const WORD: usize = core::mem::size_of::<usize>();

/// Check if a value is a power of two (zero is not)
#[inline]
pub const fn is_power_of_two(value: usize) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Align a value up to the given alignment
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if a pointer is aligned
#[inline]
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    (ptr as usize) & (align - 1) == 0
}

/// Number of bytes needed to move `ptr` forward to the next multiple of `align`
#[inline]
pub fn align_offset(ptr: *const u8, align: usize) -> usize {
    assert_power_of_two(align);
    let addr = ptr as usize;
    align_up(addr, align) - addr
}

/// Move a pointer forward to the next multiple of `align`
///
/// The result keeps the provenance of `ptr`.
#[inline]
pub fn align_forward(ptr: NonNull<u8>, align: usize) -> NonNull<u8> {
    let offset = align_offset(ptr.as_ptr(), align);
    // Safety: adding to a non-null pointer inside the same allocation stays non-null
    unsafe { ptr_add(ptr, offset) }
}

/// Advance a pointer by `bytes`
///
/// # Safety
/// The result must stay within the allocation `ptr` points into.
#[inline]
pub unsafe fn ptr_add(ptr: NonNull<u8>, bytes: usize) -> NonNull<u8> {
    NonNull::new_unchecked(ptr.as_ptr().add(bytes))
}

/// Move a pointer back by `bytes`
///
/// # Safety
/// The result must stay within the allocation `ptr` points into.
#[inline]
pub unsafe fn ptr_sub(ptr: NonNull<u8>, bytes: usize) -> NonNull<u8> {
    NonNull::new_unchecked(ptr.as_ptr().sub(bytes))
}

/// Signed distance in bytes from `begin` to `end`
#[inline]
pub fn ptr_diff(begin: *const u8, end: *const u8) -> isize {
    (end as isize).wrapping_sub(begin as isize)
}

/// Copy `len` bytes between non-overlapping blocks
///
/// # Safety
/// Both blocks must be valid for `len` bytes and must not overlap.
#[inline]
pub unsafe fn mem_copy(dest: NonNull<u8>, src: NonNull<u8>, len: usize) {
    core::ptr::copy_nonoverlapping(src.as_ptr(), dest.as_ptr(), len);
}

/// Copy `len` bytes between possibly overlapping blocks
///
/// # Safety
/// Both blocks must be valid for `len` bytes.
#[inline]
pub unsafe fn mem_move(dest: NonNull<u8>, src: NonNull<u8>, len: usize) {
    core::ptr::copy(src.as_ptr(), dest.as_ptr(), len);
}

/// Fill `len` bytes with `value`
///
/// # Safety
/// The block must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn mem_set(dest: NonNull<u8>, value: u8, len: usize) {
    core::ptr::write_bytes(dest.as_ptr(), value, len);
}

/// Zero `len` bytes
///
/// # Safety
/// The block must be valid for writes of `len` bytes.
#[inline]
pub unsafe fn mem_zero(dest: NonNull<u8>, len: usize) {
    mem_set(dest, 0, len);
}

/// Lexicographically compare two blocks of `len` bytes
///
/// # Safety
/// Both blocks must be valid for reads of `len` bytes.
#[inline]
pub unsafe fn mem_compare(a: NonNull<u8>, b: NonNull<u8>, len: usize) -> core::cmp::Ordering {
    let a = core::slice::from_raw_parts(a.as_ptr(), len);
    let b = core::slice::from_raw_parts(b.as_ptr(), len);
    a.cmp(b)
}

/// Panic unless `align` is a power of two
#[inline]
#[track_caller]
pub fn assert_power_of_two(align: usize) {
    assert!(is_power_of_two(align), "alignment {} is not a power of two", align);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(64));
        assert!(!is_power_of_two(48));
    }

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_down(31, 16), 16);
    }

    #[test]
    fn test_align_forward() {
        let mut buffer = [0u64; 8];
        let base = NonNull::new(buffer.as_mut_ptr() as *mut u8).unwrap();
        let odd = unsafe { ptr_add(base, 1) };

        let aligned = align_forward(odd, 8);
        assert!(is_aligned(aligned.as_ptr(), 8));
        assert_eq!(ptr_diff(base.as_ptr(), aligned.as_ptr()), 8);
        assert_eq!(align_forward(base, 8), base);
    }

    #[test]
    fn test_block_ops() {
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        let pa = NonNull::new(a.as_mut_ptr()).unwrap();
        let pb = NonNull::new(b.as_mut_ptr()).unwrap();

        unsafe {
            mem_set(pa, 7, 16);
            mem_copy(pb, pa, 8);
            assert_eq!(mem_compare(pa, pb, 8), core::cmp::Ordering::Equal);
            assert_eq!(mem_compare(pa, pb, 16), core::cmp::Ordering::Greater);

            mem_move(ptr_add(pa, 2), pa, 8);
            mem_zero(pa, 2);
        }

        assert_eq!(&a[..4], &[0, 0, 7, 7]);
        assert_eq!(&b[8..], &[0; 8]);
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_bad_alignment_panics() {
        assert_power_of_two(24);
    }
}
