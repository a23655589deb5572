//! This crate implements a boundary-tag memory allocator for a single,
//! caller-supplied memory region.
//!
//!  - **The memory pool is provided by an application.** Examples of potential
//!    memory pool sources include: a `static` array, a memory-mapped region,
//!    a memory block allocated by another memory allocator for arena
//!    allocation. The allocator never obtains or releases memory on its own.
//!
//!  - **Every block carries its size at both ends.** A block's neighbours
//!    are found by address arithmetic, so the allocator needs no memory
//!    beyond two words per block and no auxiliary index.
//!
//!  - **Freed blocks are coalesced immediately** with all adjacent free
//!    blocks, so releasing every allocation restores the region to its
//!    initial state.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications.
//!
//! Allocation is first-fit. Payloads are aligned to [`GRANULARITY`] bytes
//! (the machine word size); larger alignments are not supported.
//!
//! # Examples
//!
//! ```rust
//! use btalloc::Region;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 4096];
//!
//! // `'pool` represents the memory pool's lifetime (`pool` in this case).
//! // The second parameter is the smallest payload a split-off free block
//! // may have.
//! let mut region: Region<'_, 16> = Region::new(&mut pool).unwrap();
//!
//! unsafe {
//!     let mut ptr1 = region.allocate(8).unwrap().cast::<u64>();
//!     let mut ptr2 = region.allocate(8).unwrap().cast::<u64>();
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!     region.deallocate(ptr1.cast());
//!     region.deallocate(ptr2.cast());
//! }
//!
//! // Everything has been coalesced back into one free block
//! assert_eq!(region.stats().blocks, 1);
//! assert_eq!(region.check(), Ok(()));
//! ```
//!
//! # Thread Safety
//!
//! [`Region`] performs no internal locking. Mutating methods take
//! `&mut self`, so sharing one region between threads requires an external
//! lock such as `std::sync::Mutex`. Regions built on distinct pools are
//! fully independent.
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod error;
mod region;
mod tag;
mod utils;
pub use self::{
    error::{CorruptionError, InitError},
    region::{BlockInfo, Blocks, Region, Stats, DEFAULT_MIN_SPLIT, MIN_REGION_SIZE},
    tag::GRANULARITY,
};

#[cfg(any(test, feature = "std"))]
extern crate std;
