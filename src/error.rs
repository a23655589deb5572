use core::fmt;

/// The error type returned when a region cannot be initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The pool is too small to hold a single block after being aligned to
    /// [`GRANULARITY`](crate::GRANULARITY)-byte boundaries.
    TooSmall {
        /// The usable length of the pool, in bytes.
        available: usize,
        /// The smallest usable length accepted, in bytes.
        required: usize,
    },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TooSmall {
                available,
                required,
            } => write!(
                f,
                "pool too small: {} usable bytes, at least {} required",
                available, required
            ),
        }
    }
}

/// An inconsistency found by [`Region::check`](crate::Region::check).
///
/// `offset` is the byte offset of the offending block's header from the
/// start of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionError {
    /// The block's header claims a payload extending past the end of the
    /// region.
    OutOfBounds { offset: usize },
    /// The block's header and tail disagree.
    TagMismatch { offset: usize },
    /// The block and its predecessor are both free.
    UncoalescedFree { offset: usize },
}

impl fmt::Display for CorruptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OutOfBounds { offset } => {
                write!(f, "block at offset {} extends past the region", offset)
            }
            Self::TagMismatch { offset } => {
                write!(f, "block at offset {} has mismatching tags", offset)
            }
            Self::UncoalescedFree { offset } => write!(
                f,
                "free block at offset {} follows another free block",
                offset
            ),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for InitError {}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for CorruptionError {}
