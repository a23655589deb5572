//! The boundary-tag allocator core
use core::{
    debug_assert, debug_assert_eq,
    iter::FusedIterator,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::{self, NonNull},
};

use crate::{
    error::{CorruptionError, InitError},
    tag::{
        checked_footprint, footprint, header_of, round_up, span_size, tail_of, Header, Tail,
        GRANULARITY, HEADER_SIZE, TAIL_SIZE,
    },
    utils::aligned_range,
};

/// The default value of [`Region`]'s `MIN_SPLIT` parameter.
pub const DEFAULT_MIN_SPLIT: usize = 16;

/// The smallest pool length (after alignment) accepted by [`Region::new`].
/// It holds exactly one block with a [`GRANULARITY`]-byte payload.
pub const MIN_REGION_SIZE: usize = footprint(GRANULARITY);

#[cfg_attr(doc, svgbobdoc::transform)]
/// A boundary-tag memory allocator managing a single caller-supplied region.
///
/// # Data Structure Overview
///
/// The region is partitioned into blocks. Each block starts with a header
/// and ends with a tail, and both tags record the same payload size and
/// free flag. There are no link fields: the neighbours of a block are found
/// by stepping over its payload (forward) or over the preceding block's
/// tail (backward).
///
/// <center>
/// ```svgbob
///   first                                                             end
///     |                                                                |
///     v                                                                v
///     +-----+-----------+-----+-----+---------+-----+-----+-------+-----+
///     | H   |  payload  | T   | H   | payload | T   | H   |payload| T   |
///     |free |           |free | used|         | used|free |       |free |
///     | 48  |           | 48  | 16  |         | 16  | 24  |       | 24  |
///     +-----+-----------+-----+-----+---------+-----+-----+-------+-----+
///     '-------- block ------'   '----- block -----'   '---- block ----'
/// ```
/// </center>
///
/// # Properties
///
/// Payload sizes are multiples of [`GRANULARITY`] and payloads are aligned
/// to `GRANULARITY` bytes.
///
/// Allocation is first-fit and takes linear time in the number of blocks.
/// Deallocation merges the released block with all free neighbours, so no
/// two adjacent blocks are ever both free.
///
/// When a free block is split, the allocation is carved from its *end*. The
/// leftover (front) part must have at least `MIN_SPLIT` bytes of payload;
/// otherwise the whole block is handed out.
///
/// `Region` is not internally synchronized. Put it behind a lock to share it
/// between threads.
#[derive(Debug)]
pub struct Region<'pool, const MIN_SPLIT: usize = DEFAULT_MIN_SPLIT> {
    /// The header of the first block.
    first: NonNull<Header>,
    /// The tail of the last block.
    end: NonNull<Tail>,
    /// The number of managed bytes.
    size: usize,
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All block tags directly or indirectly referenced by a particular
//         instance of `Region` are logically owned by that `Region` and
//         have no interior mutability, so these are safe.
unsafe impl<const MIN_SPLIT: usize> Send for Region<'_, MIN_SPLIT> {}

unsafe impl<const MIN_SPLIT: usize> Sync for Region<'_, MIN_SPLIT> {}

/// A snapshot of one block, yielded by [`Region::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The offset of the block's header from the start of the region.
    pub offset: usize,
    /// The starting address of the payload.
    pub payload: NonNull<u8>,
    /// The payload size in bytes, excluding both tags.
    pub payload_size: usize,
    pub is_free: bool,
}

impl BlockInfo {
    /// The number of bytes the block occupies, including both tags.
    #[inline]
    pub fn footprint(&self) -> usize {
        footprint(self.payload_size)
    }
}

/// Usage statistics returned by [`Region::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub blocks: usize,
    pub free_blocks: usize,
    /// The total payload size of all free blocks.
    pub free_bytes: usize,
    /// The total payload size of all allocated blocks.
    pub used_bytes: usize,
    /// The payload size of the largest free block.
    pub largest_free: usize,
}

impl<'pool, const MIN_SPLIT: usize> Region<'pool, MIN_SPLIT> {
    /// Construct a `Region` managing the specified memory pool.
    ///
    /// The pool is trimmed to [`GRANULARITY`]-byte boundaries and formatted
    /// as one free block.
    ///
    /// # Examples
    ///
    /// ```
    /// use btalloc::Region;
    /// use std::mem::MaybeUninit;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// let mut region: Region = Region::new(&mut pool).unwrap();
    /// let ptr = region.allocate(100).unwrap();
    /// unsafe { region.deallocate(ptr) };
    /// assert_eq!(region.stats().blocks, 1);
    /// ```
    ///
    /// The pool must outlive the `Region`:
    ///
    /// ```rust,compile_fail
    /// use btalloc::Region;
    /// use std::mem::MaybeUninit;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// let region: Region = Region::new(&mut pool).unwrap();
    /// drop(pool); // dropping the pool first is not allowed
    /// drop(region);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`InitError::TooSmall`] if less than [`MIN_REGION_SIZE`] bytes
    /// remain after alignment.
    pub fn new(pool: &'pool mut [MaybeUninit<u8>]) -> Result<Self, InitError> {
        // Safety: `pool` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it will outlive `self`.
        unsafe {
            Self::from_ptr(NonNull::new_unchecked(
                pool as *mut [MaybeUninit<u8>] as *mut [u8],
            ))
        }
    }

    /// Construct a `Region` managing the memory pool specified by a slice
    /// pointer.
    ///
    /// # Safety
    ///
    /// The memory pool will be considered owned by the returned `Region`. It
    /// must be valid for reads and writes and must outlive the `Region`.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub unsafe fn from_ptr(pool: NonNull<[u8]>) -> Result<Self, InitError> {
        let (start, end) = aligned_range(pool, GRANULARITY).unwrap_or((0, 0));
        let size = end - start;

        if size < MIN_REGION_SIZE {
            return Err(InitError::TooSmall {
                available: size,
                required: MIN_REGION_SIZE,
            });
        }

        // Safety: `start` is not zero because `size` is not zero.
        let first = NonNull::new_unchecked(start as *mut Header);
        let payload_size = size - HEADER_SIZE - TAIL_SIZE;
        first.as_ptr().write(Header::new(payload_size, true));

        let end = tail_of(first);
        end.as_ptr().write(Tail::new(payload_size, true));
        debug_assert_eq!(end.as_ptr() as usize + TAIL_SIZE, start + size);

        log::trace!(
            "region: {:#x}..{:#x} ({} bytes), initial payload {}",
            start,
            start + size,
            size,
            payload_size
        );

        Ok(Self {
            first,
            end,
            size,
            _phantom: PhantomData,
        })
    }

    /// The number of bytes under management, including all tags.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if `ptr` points inside the payload area of this region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.first.as_ptr() as usize + HEADER_SIZE && addr < self.end.as_ptr() as usize
    }

    /// Get the block following `header`, or `None` if `header` is the last
    /// one.
    ///
    /// # Safety
    ///
    /// `header` must be a block header of `self`.
    #[inline]
    pub(crate) unsafe fn next(&self, header: NonNull<Header>) -> Option<NonNull<Header>> {
        let tail = tail_of(header);
        debug_assert_eq!(header.as_ref().word(), tail.as_ref().word());

        if tail == self.end {
            None
        } else {
            Some(NonNull::new_unchecked(tail.cast::<u8>().as_ptr().add(TAIL_SIZE)).cast())
        }
    }

    /// Get the block preceding `header`, or `None` if `header` is the first
    /// one.
    ///
    /// # Safety
    ///
    /// `header` must be a block header of `self`.
    #[inline]
    pub(crate) unsafe fn previous(&self, header: NonNull<Header>) -> Option<NonNull<Header>> {
        if header == self.first {
            return None;
        }

        let tail: NonNull<Tail> =
            NonNull::new_unchecked(header.cast::<u8>().as_ptr().sub(TAIL_SIZE)).cast();
        let prev = header_of(tail);
        debug_assert_eq!(prev.as_ref().word(), tail.as_ref().word());

        Some(prev)
    }

    #[inline]
    unsafe fn payload_of(header: NonNull<Header>) -> NonNull<u8> {
        NonNull::new_unchecked(header.cast::<u8>().as_ptr().add(HEADER_SIZE))
    }

    /// Find the header for an allocation (any `NonNull<u8>` returned by our
    /// allocation functions).
    #[inline]
    unsafe fn header_for_allocation(ptr: NonNull<u8>) -> NonNull<Header> {
        NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)).cast()
    }

    /// Attempt to allocate a block of memory with at least `size` bytes of
    /// payload.
    ///
    /// Returns the starting address of the payload on success; `None` if no
    /// free block is large enough. The region is unchanged on failure.
    ///
    /// A zero-byte request is served like a one-byte request, so every
    /// successful allocation has a distinct address.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time in the number of blocks.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = round_up(size.max(1))?;
        let needed = checked_footprint(size)?;

        let mut cursor = Some(self.first);
        while let Some(block) = cursor {
            // Safety: `block` was reached by walking from `self.first`
            unsafe {
                let hdr = *block.as_ref();
                // A block smaller than `needed` is still accepted if it can
                // hold `size` bytes. `utilize` will not split it.
                if hdr.is_free() && (hdr.payload_size() >= needed || hdr.payload_size() >= size)
                {
                    let block = self.utilize(block, size)?;
                    return Some(Self::payload_of(block));
                }
                cursor = self.next(block);
            }
        }

        log::trace!("allocate({}): no free block is large enough", size);
        None
    }

    /// Like [`Self::allocate`], but the whole payload of the returned block
    /// is zero-filled.
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        // Safety: `ptr` was just allocated by `self`
        unsafe {
            let len = self.usable_size(ptr);
            ptr::write_bytes(ptr.as_ptr(), 0, len);
        }
        Some(ptr)
    }

    /// Turn the free block `block` into a used block holding `size` bytes,
    /// splitting off the unused front part if it's large enough.
    ///
    /// Returns the header of the used block, which is `block` itself if no
    /// splitting took place.
    ///
    /// # Safety
    ///
    ///  - `block` must be a block header of `self`.
    ///  - `size` must be a multiple of [`GRANULARITY`].
    ///
    unsafe fn utilize(&mut self, block: NonNull<Header>, size: usize) -> Option<NonNull<Header>> {
        let hdr = *block.as_ref();
        if !hdr.is_free() || hdr.payload_size() < size {
            return None;
        }

        let payload_size = hdr.payload_size();
        // `size <= payload_size`, so this does not overflow
        let all_size = footprint(size);
        let end_tail = tail_of(block);

        if payload_size <= all_size || payload_size - all_size < MIN_SPLIT {
            // Not worth splitting. Hand out the whole block.
            (*block.as_ptr()).set_free(false);
            (*end_tail.as_ptr()).set_free(false);
            log::trace!("utilize({:p}, {}): whole block of {}", block, size, payload_size);
            return Some(block);
        }

        // Split the block into a free front part, which keeps `block`, and a
        // used back part, which keeps `end_tail`. The payload sizes are
        // recomputed from the tag positions.
        let front_tail: NonNull<Tail> =
            NonNull::new_unchecked(end_tail.cast::<u8>().as_ptr().sub(all_size)).cast();
        let front_size = span_size(block, front_tail);
        block.as_ptr().write(Header::new(front_size, true));
        front_tail.as_ptr().write(Tail::new(front_size, true));

        let back: NonNull<Header> =
            NonNull::new_unchecked(front_tail.cast::<u8>().as_ptr().add(TAIL_SIZE)).cast();
        let back_size = span_size(back, end_tail);
        debug_assert_eq!(back_size, size);
        back.as_ptr().write(Header::new(back_size, false));
        end_tail.as_ptr().write(Tail::new(back_size, false));

        log::trace!(
            "utilize({:p}, {}): split into free {} + used {} at {:p}",
            block,
            size,
            front_size,
            back_size,
            back
        );

        Some(back)
    }

    /// Merge two blocks and everything between them into one block.
    ///
    /// The blocks may be given in any order. The merged block inherits the
    /// free flag of the earlier one. Returns the header of the merged block.
    ///
    /// # Safety
    ///
    /// `a` and `b` must be block headers of the same region, and every block
    /// between them must be included in the merge.
    unsafe fn join(a: NonNull<Header>, b: NonNull<Header>) -> NonNull<Header> {
        if a == b {
            return a;
        }

        let (start, end) = if (a.as_ptr() as usize) < (b.as_ptr() as usize) {
            (a, b)
        } else {
            (b, a)
        };

        let end_tail = tail_of(end);
        let free = start.as_ref().is_free();
        let size = span_size(start, end_tail);
        start.as_ptr().write(Header::new(size, free));
        end_tail.as_ptr().write(Tail::new(size, free));

        log::trace!("join({:p}, {:p}): {} bytes", start, end, size);

        start
    }

    /// Deallocate a previously allocated memory block, merging it with any
    /// adjacent free blocks.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - The memory block must not have been deallocated since then.
    ///
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr.as_ptr()), "{:p} is not in this region", ptr);

        let mut block = Self::header_for_allocation(ptr);
        let tail = tail_of(block);
        debug_assert!(!block.as_ref().is_free(), "{:p} is already free", ptr);
        debug_assert_eq!(block.as_ref().word(), tail.as_ref().word());

        (*block.as_ptr()).set_free(true);
        (*tail.as_ptr()).set_free(true);

        log::trace!("deallocate({:p}): {} bytes", ptr, block.as_ref().payload_size());

        // Merge with the preceding free blocks. Afterwards `block` is the
        // head of the merged block.
        while let Some(prev) = self.previous(block) {
            if !prev.as_ref().is_free() {
                break;
            }
            block = Self::join(prev, block);
        }

        // Merge with the following free blocks
        while let Some(next) = self.next(block) {
            if !next.as_ref().is_free() {
                break;
            }
            block = Self::join(block, next);
        }
    }

    /// Deallocate a memory block previously returned by [`Self::allocate`].
    /// Does nothing if `ptr` is null.
    ///
    /// # Safety
    ///
    /// If `ptr` is non-null, see [`Self::deallocate`].
    #[inline]
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.deallocate(ptr);
        }
    }

    /// Get the payload size of an allocated memory block. It's at least as
    /// large as the size it was requested with.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via `self`.
    #[inline]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        debug_assert!(self.contains(ptr.as_ptr()), "{:p} is not in this region", ptr);
        Self::header_for_allocation(ptr).as_ref().payload_size()
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// Returns the new starting address of the memory block on success;
    /// `None` otherwise, in which case the original memory block is left
    /// intact. The contents are preserved up to the smaller of the old and
    /// new sizes.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously allocated via `self`.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let new_size = round_up(new_size.max(1))?;
        let block = Self::header_for_allocation(ptr);
        debug_assert!(!block.as_ref().is_free(), "{:p} is free", ptr);

        // First try to shrink or grow the block toward the end (i.e.,
        // preserving the starting address).
        if self.reallocate_in_place(block, new_size) {
            log::trace!("reallocate({:p}, {}): in place", ptr, new_size);
            return Some(ptr);
        }

        let old_size = block.as_ref().payload_size();
        let new_ptr = self.allocate(new_size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        self.deallocate(ptr);

        log::trace!("reallocate({:p}, {}): moved to {:p}", ptr, new_size, new_ptr);
        Some(new_ptr)
    }

    /// A subroutine of [`Self::reallocate`]. Resizes the used block `block`
    /// without moving its payload. Returns `false` if that's impossible.
    ///
    /// # Safety
    ///
    ///  - `block` must be a used block header of `self`.
    ///  - `size` must be a multiple of [`GRANULARITY`].
    ///
    unsafe fn reallocate_in_place(&mut self, block: NonNull<Header>, size: usize) -> bool {
        let payload_size = block.as_ref().payload_size();

        if size > payload_size {
            // Grow into the next block. Fail if it isn't free.
            let next = match self.next(block) {
                Some(next) if next.as_ref().is_free() => next,
                _ => return false,
            };

            let grown_size = payload_size + footprint(next.as_ref().payload_size());
            if grown_size < size {
                // Can't fit
                return false;
            }

            // `block` is used, so the merged block is used as well
            Self::join(block, next);
        }

        self.trim(block, size);
        true
    }

    /// Give the part of the used block `block`'s payload past the first
    /// `size` bytes back to the free pool, if it's large enough to form a
    /// block with at least `MIN_SPLIT` bytes of payload.
    ///
    /// # Safety
    ///
    ///  - `block` must be a used block header of `self`.
    ///  - `size` must be a multiple of [`GRANULARITY`] not larger than the
    ///    block's payload size.
    ///
    unsafe fn trim(&mut self, block: NonNull<Header>, size: usize) {
        let slack = block.as_ref().payload_size() - size;
        match checked_footprint(MIN_SPLIT) {
            Some(min_slack) if slack >= min_slack => {}
            _ => return,
        }

        let end_tail = tail_of(block);

        let new_tail: NonNull<Tail> =
            NonNull::new_unchecked(block.cast::<u8>().as_ptr().add(HEADER_SIZE + size)).cast();
        block.as_ptr().write(Header::new(size, false));
        new_tail.as_ptr().write(Tail::new(size, false));

        let rest: NonNull<Header> =
            NonNull::new_unchecked(new_tail.cast::<u8>().as_ptr().add(TAIL_SIZE)).cast();
        let rest_size = span_size(rest, end_tail);
        rest.as_ptr().write(Header::new(rest_size, true));
        end_tail.as_ptr().write(Tail::new(rest_size, true));

        log::trace!("trim({:p}, {}): released {} bytes", block, size, rest_size);

        // Invariant: No two adjacent free blocks
        let mut rest = rest;
        while let Some(next) = self.next(rest) {
            if !next.as_ref().is_free() {
                break;
            }
            rest = Self::join(rest, next);
        }
    }

    /// Iterate over all blocks in address order.
    pub fn blocks(&self) -> Blocks<'_, MIN_SPLIT> {
        Blocks {
            region: self,
            cursor: Some(self.first),
        }
    }

    /// Collect usage statistics.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time in the number of blocks.
    pub fn stats(&self) -> Stats {
        self.blocks().fold(Stats::default(), |mut stats, block| {
            stats.blocks += 1;
            if block.is_free {
                stats.free_blocks += 1;
                stats.free_bytes += block.payload_size;
                stats.largest_free = stats.largest_free.max(block.payload_size);
            } else {
                stats.used_bytes += block.payload_size;
            }
            stats
        })
    }

    /// Walk the region and verify its structural invariants: every block
    /// lies inside the region, every header matches its tail, and no two
    /// adjacent blocks are both free.
    ///
    /// Unlike the other methods, this one doesn't trust the block sizes it
    /// reads, so it can be used to detect memory corruption caused by
    /// out-of-bounds writes or invalid deallocations.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn check(&self) -> Result<(), CorruptionError> {
        let start = self.first.as_ptr() as usize;
        let end = self.end.as_ptr() as usize;
        let mut cursor = start;
        let mut prev_free = false;

        loop {
            let offset = cursor - start;

            // Safety: `start <= cursor <= end`, and there's a tag-sized word
            //         at `end`
            let hdr = unsafe { *(cursor as *const Header) };

            let tail_addr = match cursor
                .checked_add(HEADER_SIZE)
                .and_then(|x| x.checked_add(hdr.payload_size()))
            {
                Some(x) if x <= end => x,
                _ => return Err(CorruptionError::OutOfBounds { offset }),
            };

            // Safety: `cursor < tail_addr <= end`, and `tail_addr` is aligned
            //         because payload sizes are multiples of `GRANULARITY`
            let tail = unsafe { *(tail_addr as *const Tail) };
            if tail.word() != hdr.word() {
                return Err(CorruptionError::TagMismatch { offset });
            }

            if hdr.is_free() && prev_free {
                return Err(CorruptionError::UncoalescedFree { offset });
            }
            prev_free = hdr.is_free();

            if tail_addr == end {
                return Ok(());
            }
            cursor = tail_addr + TAIL_SIZE;
        }
    }
}

/// An iterator over the blocks of a [`Region`], created by
/// [`Region::blocks`].
#[derive(Debug, Clone)]
pub struct Blocks<'a, const MIN_SPLIT: usize> {
    region: &'a Region<'a, MIN_SPLIT>,
    cursor: Option<NonNull<Header>>,
}

impl<const MIN_SPLIT: usize> Iterator for Blocks<'_, MIN_SPLIT> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cursor?;
        // Safety: `block` was reached by walking from `region.first`, and
        //         `region` is borrowed immutably for the iterator's lifetime
        unsafe {
            let hdr = *block.as_ref();
            self.cursor = self.region.next(block);
            Some(BlockInfo {
                offset: block.as_ptr() as usize - self.region.first.as_ptr() as usize,
                payload: Region::<MIN_SPLIT>::payload_of(block),
                payload_size: hdr.payload_size(),
                is_free: hdr.is_free(),
            })
        }
    }
}

impl<const MIN_SPLIT: usize> FusedIterator for Blocks<'_, MIN_SPLIT> {}
