//! An in-place segregated-fit allocator family for recycling the interior of
//! fixed-size memory pages used as relocation targets by a region-based
//! garbage collector.
//!
//! After a mark phase, a mostly-dead page still holds a handful of live
//! objects with large gaps between them. Rather than evacuating such a page,
//! the [`recycler`] reconstructs a free-list over the gaps so that new
//! allocations (object relocations) can be placed into its holes. The
//! free-list itself is managed by one of two Two-Level Segregated Fit
//! variants in [`tlsf`]:
//!
//! * [`tlsf::Tlsf`]: the textbook two-level variant with in-band block
//!   headers and eager coalescing, protected by a single list lock.
//! * [`tlsf::PageTlsf`]: a page-optimized variant with zero-byte headers for
//!   used blocks, 32-bit base-relative links, lock-free list heads, and
//!   deferred (bulk) coalescing, intended to be shared by concurrent
//!   relocation workers.
//!
//! Both variants borrow their pool: they never own, map, or free the
//! underlying memory, and they never allocate outside of it.

#[macro_use]
extern crate log;

pub mod recycler;
pub mod tlsf;
pub mod util;
