//! Size-class mapping: from a block size to a `(first level, second level)`
//! pair, and from a pair to a flat free-list index.

use crate::util::bits;

/// Pool addresses handed out by either allocator variant are aligned to this.
pub const ALIGNMENT: usize = 8;

/// log2 of the smallest size the single-level mapping distinguishes. The
/// page-optimized flat index is rebased by this amount.
pub const MIN_ALLOC_LOG2: usize = 4;

/// Compile-time parameters of one allocator variant. The allocators are
/// monomorphized per configuration; nothing is dispatched at run time.
pub trait TlsfConfig {
    /// Number of first-level (power-of-two) classes.
    const FL_INDEX: usize;
    /// log2 of the number of second-level subdivisions per first level.
    const SL_INDEX_LOG2: usize;
    /// Number of second-level subdivisions per first level.
    const SL_INDEX: usize = 1 << Self::SL_INDEX_LOG2;
    /// Number of indexed size classes. One extra oversize list head follows
    /// the indexed classes.
    const NUM_LISTS: usize = Self::FL_INDEX * Self::SL_INDEX;
    /// Smallest block the allocator will create; request sizes are rounded
    /// up to a multiple of this.
    const MIN_BLOCK_SIZE: usize;
    /// Bytes of in-band header preceding every block's payload.
    const HEADER_BYTES: usize;
    /// Whether the mapping uses the second level (two-level search) or is
    /// flattened to a single level.
    const USE_SECOND_LEVELS: bool;
    /// Whether coalescing is deferred to a bulk sweep instead of happening
    /// on every free. Deferring elides the `prev_phys_block` field.
    const DEFERRED_COALESCING: bool;
}

/// The textbook configuration used by [`crate::tlsf::Tlsf`].
pub struct BaseConfig;

impl TlsfConfig for BaseConfig {
    const FL_INDEX: usize = 32;
    const SL_INDEX_LOG2: usize = 5;
    const MIN_BLOCK_SIZE: usize = 32;
    const HEADER_BYTES: usize = super::block::BLOCK_HEADER_BYTES;
    const USE_SECOND_LEVELS: bool = true;
    const DEFERRED_COALESCING: bool = false;
}

/// The page-recycling configuration used by [`crate::tlsf::PageTlsf`].
pub struct PageConfig;

impl TlsfConfig for PageConfig {
    const FL_INDEX: usize = 14;
    const SL_INDEX_LOG2: usize = 2;
    const MIN_BLOCK_SIZE: usize = 16;
    const HEADER_BYTES: usize = 0;
    const USE_SECOND_LEVELS: bool = false;
    const DEFERRED_COALESCING: bool = true;
}

/// First- and second-level index of a size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub fl: usize,
    pub sl: usize,
}

/// Round a request up to the variant's block-size granularity. Zero-sized
/// requests are treated as one byte.
pub fn align_size<C: TlsfConfig>(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    crate::util::conversions::raw_align_up(size, C::MIN_BLOCK_SIZE)
}

/// Map a block size to its `(fl, sl)` class. `size` must be at least
/// `C::MIN_BLOCK_SIZE`.
pub fn get_mapping<C: TlsfConfig>(size: usize) -> Mapping {
    debug_assert!(size >= C::MIN_BLOCK_SIZE);
    let fl = bits::ilog2(size as u64);
    let sl = (size >> (fl - C::SL_INDEX_LOG2)) ^ (1 << C::SL_INDEX_LOG2);
    Mapping { fl, sl }
}

/// Flatten a two-level mapping to an index into the free-list table.
pub fn flatten<C: TlsfConfig>(mapping: Mapping) -> usize {
    mapping.fl * C::SL_INDEX + mapping.sl
}

/// Map a block size directly to a flat single-level index, clamped to the
/// oversize list at `C::NUM_LISTS` for sizes beyond the indexed classes.
pub fn single_level_index<C: TlsfConfig>(size: usize) -> usize {
    let Mapping { fl, sl } = get_mapping::<C>(size);
    let index = ((fl - MIN_ALLOC_LOG2) << C::SL_INDEX_LOG2) + sl;
    if index > C::NUM_LISTS {
        C::NUM_LISTS
    } else {
        index
    }
}

/// Round an aligned request up within its size class, so that the first block
/// of the class the result maps to is guaranteed to fit the request. This is
/// what makes the bitmap search a good fit rather than a first fit.
pub fn search_size<C: TlsfConfig>(aligned_size: usize) -> usize {
    aligned_size + (1 << (bits::ilog2(aligned_size as u64) - C::SL_INDEX_LOG2)) - 1
}
