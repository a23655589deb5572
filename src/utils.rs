use core::{cell::UnsafeCell, mem::MaybeUninit, ptr::NonNull};

/// Polyfill for <https://github.com/rust-lang/rust/issues/71146>
///
/// # Safety
///
/// `ptr` must be dereferencable. This is a limitation of the polyfill.
#[inline]
pub(crate) unsafe fn nonnull_slice_len<T>(ptr: NonNull<[T]>) -> usize {
    // FIXME: Use `NonNull<[T]>::len` (stabilized in Rust 1.63)
    // Safety: We are just reading the slice length embedded in the fat
    //         pointer and not dereferencing the pointer. We also convert it
    //         to `*mut [MaybeUninit<UnsafeCell<u8>>]` just in case because the
    //         pool might be uninitialized and there might be outstanding
    //         mutable references to it.
    (&*(ptr.as_ptr() as *const [MaybeUninit<UnsafeCell<T>>])).len()
}

/// Get the byte range `start..end` covered by a pool, with `start` rounded up
/// and `end` rounded down to `align`-byte boundaries. Returns `None` if
/// nothing is left after rounding.
///
/// # Safety
///
/// See [`nonnull_slice_len`].
#[inline]
pub(crate) unsafe fn aligned_range(pool: NonNull<[u8]>, align: usize) -> Option<(usize, usize)> {
    debug_assert!(align.is_power_of_two());
    let len = nonnull_slice_len(pool);
    let unaligned_start = pool.as_ptr() as *mut u8 as usize;
    let start = unaligned_start.checked_add(align - 1)? & !(align - 1);
    let end = unaligned_start.checked_add(len)? & !(align - 1);
    if start < end {
        Some((start, end))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Align<T>(T);

    #[test]
    fn slice_len() {
        let mut buf = [MaybeUninit::<u8>::uninit(); 24];
        let ptr = NonNull::from(&mut buf[3..]);
        assert_eq!(unsafe { nonnull_slice_len(ptr) }, 21);

        let mut words = [0u64; 0];
        let empty = NonNull::from(&mut words[..]);
        assert_eq!(unsafe { nonnull_slice_len(empty) }, 0);
    }

    #[test]
    fn rounds_inward() {
        let mut buf = Align([0u8; 64]);
        let base = buf.0.as_ptr() as usize;

        let whole = NonNull::from(&mut buf.0[..]);
        assert_eq!(unsafe { aligned_range(whole, 8) }, Some((base, base + 64)));

        let inner = NonNull::from(&mut buf.0[1..47]);
        assert_eq!(unsafe { aligned_range(inner, 8) }, Some((base + 8, base + 40)));
        assert_eq!(unsafe { aligned_range(inner, 32) }, None);

        let sliver = NonNull::from(&mut buf.0[1..8]);
        assert_eq!(unsafe { aligned_range(sliver, 8) }, None);
    }
}
