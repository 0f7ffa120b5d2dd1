//! The Two-Level Segregated Fit (TLSF) allocator family.
//!
//! Both variants manage the interior of one borrowed pool with O(1) good-fit
//! allocation: block sizes are bucketed by a first-level index (the integer
//! log2 of the size) and, for [`Tlsf`], a second-level fractional refinement.
//! A bitmap per level makes "smallest non-empty class at least this big" a
//! pair of find-first-set instructions.
//!
//! [`Tlsf`] is the textbook rendition: 32-byte in-band headers, doubly-linked
//! free lists, eager coalescing through `prev_phys_block` back-pointers.
//! [`PageTlsf`] strips all of that down for use as a GC page recycler: used
//! blocks carry no header at all, free-list links are 32-bit base-relative
//! offsets packed into one word, list heads are lock-free, and coalescing is
//! deferred to an explicit [`PageTlsf::aggregate`] sweep.

mod base;
mod block;
mod mapping;
mod page_optimized;

pub use self::base::Tlsf;
pub use self::block::{Block, BLOCK_HEADER_BYTES, FREE_BLOCK_OVERLAY_BYTES};
pub use self::mapping::{BaseConfig, Mapping, PageConfig, TlsfConfig, ALIGNMENT, MIN_ALLOC_LOG2};
pub use self::page_optimized::{ObjectSizeFn, PageTlsf};
