//! Boundary tags
use core::{mem, ptr::NonNull};

/// The allocation granularity.
///
/// It is `size_of::<usize>()` bytes. Every payload size is a multiple of
/// this value, which keeps every tag and every payload word-aligned.
pub const GRANULARITY: usize = mem::size_of::<usize>();

/// The bit of a tag word indicating whether the block is free.
pub(crate) const TAG_FREE: usize = 1;
/// The bits of a tag word indicating the block's payload size.
pub(crate) const TAG_SIZE_MASK: usize = !(GRANULARITY - 1);

pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();
pub(crate) const TAIL_SIZE: usize = mem::size_of::<Tail>();

/// The marker at the start of every block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    ///  - `bit[0]` ([`TAG_FREE`]) indicates whether the block is free.
    ///
    ///  - the remaining bits ([`TAG_SIZE_MASK`]) represent the payload size,
    ///    excluding both tags.
    ///
    size: usize,
}

/// The marker at the end of every block. Always a copy of the block's
/// [`Header`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tail {
    size: usize,
}

macro_rules! impl_tag {
    ($ty:ty) => {
        impl $ty {
            #[inline]
            pub(crate) const fn new(payload_size: usize, free: bool) -> Self {
                debug_assert!(payload_size & !TAG_SIZE_MASK == 0);
                Self {
                    size: payload_size | if free { TAG_FREE } else { 0 },
                }
            }

            #[inline]
            pub(crate) const fn payload_size(&self) -> usize {
                self.size & TAG_SIZE_MASK
            }

            #[inline]
            pub(crate) const fn is_free(&self) -> bool {
                (self.size & TAG_FREE) != 0
            }

            #[inline]
            pub(crate) fn set_free(&mut self, free: bool) {
                *self = Self::new(self.payload_size(), free);
            }

            /// The raw tag word.
            #[inline]
            pub(crate) const fn word(&self) -> usize {
                self.size
            }
        }
    };
}

impl_tag!(Header);
impl_tag!(Tail);

impl From<Header> for Tail {
    #[inline]
    fn from(x: Header) -> Self {
        Self { size: x.size }
    }
}

/// The number of bytes a block with a `payload_size`-byte payload occupies.
#[inline]
pub(crate) const fn footprint(payload_size: usize) -> usize {
    payload_size + HEADER_SIZE + TAIL_SIZE
}

/// [`footprint`] that fails instead of overflowing.
#[inline]
pub(crate) fn checked_footprint(payload_size: usize) -> Option<usize> {
    payload_size.checked_add(HEADER_SIZE + TAIL_SIZE)
}

/// Get the tail of the block starting at `header`.
///
/// # Safety
///
/// `header` must point to an initialized header whose payload size matches
/// the block's actual extent.
#[inline]
pub(crate) unsafe fn tail_of(header: NonNull<Header>) -> NonNull<Tail> {
    let size = header.as_ref().payload_size();
    NonNull::new_unchecked(header.cast::<u8>().as_ptr().add(HEADER_SIZE + size)).cast()
}

/// Get the header of the block ending at `tail`.
///
/// # Safety
///
/// `tail` must point to an initialized tail whose payload size matches the
/// block's actual extent.
#[inline]
pub(crate) unsafe fn header_of(tail: NonNull<Tail>) -> NonNull<Header> {
    let size = tail.as_ref().payload_size();
    NonNull::new_unchecked(tail.cast::<u8>().as_ptr().sub(HEADER_SIZE + size)).cast()
}

/// The payload size of a block whose header is at `header` and whose tail is
/// at `tail`. Returns `0` if `tail` does not come after `header`.
#[inline]
pub(crate) fn span_size(header: NonNull<Header>, tail: NonNull<Tail>) -> usize {
    let header = header.as_ptr() as usize;
    let tail = tail.as_ptr() as usize;
    if header >= tail {
        0
    } else {
        // Saturate so that a tail overlapping the header is also `0`
        (tail - header).saturating_sub(HEADER_SIZE)
    }
}

/// Round `size` up to a multiple of [`GRANULARITY`].
#[inline]
pub(crate) fn round_up(size: usize) -> Option<usize> {
    Some(size.checked_add(GRANULARITY - 1)? & TAG_SIZE_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Align<T>(T);

    #[test]
    fn tag_word() {
        let hdr = Header::new(GRANULARITY * 3, true);
        assert_eq!(hdr.payload_size(), GRANULARITY * 3);
        assert!(hdr.is_free());
        assert_eq!(hdr.word(), GRANULARITY * 3 | TAG_FREE);

        let mut tail = Tail::from(hdr);
        tail.set_free(false);
        assert_eq!(tail.payload_size(), GRANULARITY * 3);
        assert!(!tail.is_free());
    }

    #[test]
    fn footprint_adds_both_tags() {
        assert_eq!(footprint(0), 2 * GRANULARITY);
        assert_eq!(footprint(40), 40 + HEADER_SIZE + TAIL_SIZE);
        assert_eq!(checked_footprint(usize::MAX), None);
        assert_eq!(checked_footprint(8), Some(footprint(8)));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(0), Some(0));
        assert_eq!(round_up(1), Some(GRANULARITY));
        assert_eq!(round_up(GRANULARITY), Some(GRANULARITY));
        assert_eq!(round_up(GRANULARITY + 1), Some(GRANULARITY * 2));
        assert_eq!(round_up(usize::MAX), None);
    }

    #[test]
    fn locate_tags() {
        let mut buf = Align([0usize; 8]);
        let base = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let payload_size = GRANULARITY * 4;

        unsafe {
            let header = base.cast::<Header>();
            *header.as_ptr() = Header::new(payload_size, true);

            let tail = tail_of(header);
            assert_eq!(
                tail.as_ptr() as usize,
                base.as_ptr() as usize + HEADER_SIZE + payload_size
            );
            *tail.as_ptr() = Tail::from(*header.as_ref());

            assert_eq!(header_of(tail), header);
            assert_eq!(span_size(header, tail), payload_size);
        }
    }

    #[test]
    fn span_size_rejects_misordered_tags() {
        let mut buf = Align([0usize; 4]);
        let base = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        let header = base.cast::<Header>();
        let same = base.cast::<Tail>();
        assert_eq!(span_size(header, same), 0);

        let before = unsafe { NonNull::new_unchecked(base.as_ptr().add(2)) }.cast::<Header>();
        assert_eq!(span_size(before, same), 0);

        let adjacent = unsafe { NonNull::new_unchecked(base.as_ptr().add(1)) }.cast::<Tail>();
        assert_eq!(span_size(header, adjacent), 0);
    }
}
