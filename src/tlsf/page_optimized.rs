use atomic::Ordering;

use std::marker::PhantomData;
use std::sync::atomic::AtomicU64;

use crate::tlsf::block::{Block, FREE_BLOCK_OVERLAY_BYTES};
use crate::tlsf::mapping::{self, PageConfig, TlsfConfig, ALIGNMENT};
use crate::util::bits::{self, Half};
use crate::util::conversions::{raw_align_down, raw_align_up};
use crate::util::Address;

const NUM_LISTS: usize = PageConfig::NUM_LISTS;
const MIN_BLOCK_SIZE: usize = PageConfig::MIN_BLOCK_SIZE;

/// Reports the size in bytes of the object beginning at an address, or 0 if
/// no object begins there. For addresses that begin free blocks the
/// allocator reads the size from the block's first word instead, so the
/// callback only needs to know about live objects.
pub type ObjectSizeFn = fn(Address) -> usize;

// An empty head slot: version 0 in the upper half, the null offset in the
// lower half.
const EMPTY_HEAD: u64 = bits::NULL_OFFSET as u64;

/// The page-optimized TLSF variant used to recycle GC pages.
///
/// Used blocks carry no header at all; the metadata of free blocks overlays
/// their first 16 payload bytes. Free-list links are 32-bit base-relative
/// offsets, so the variant is limited to pools of at most 4 GiB. Each list
/// head is a lock-free 64-bit slot packing `(version:32 | offset:32)`;
/// concurrent relocation workers may call [`PageTlsf::allocate`],
/// [`PageTlsf::free`] and [`PageTlsf::free_range`] on a shared reference.
/// Coalescing is deferred: nothing merges until the quiesced
/// [`PageTlsf::aggregate`] sweep.
pub struct PageTlsf<'pool> {
    block_start: Address,
    pool_size: usize,
    size_fn: ObjectSizeFn,
    fl_bitmap: AtomicU64,
    heads: [AtomicU64; NUM_LISTS + 1],
    _pool: PhantomData<&'pool mut [u8]>,
}

impl<'pool> PageTlsf<'pool> {
    /// Construct an allocator over `pool`. With `start_full` the whole pool
    /// begins as one (implicit, headerless) used block and the caller
    /// populates the free list through [`PageTlsf::free_range`]; otherwise
    /// it begins as one free block.
    pub fn new(pool: &'pool mut [u8], size_fn: ObjectSizeFn, start_full: bool) -> Self {
        unsafe {
            Self::from_raw(
                Address::from_mut_ptr(pool.as_mut_ptr()),
                pool.len(),
                size_fn,
                start_full,
            )
        }
    }

    /// Construct an allocator over the raw region `[start, start + size)`.
    ///
    /// # Safety
    /// The region must be writable, at least 8-byte aligned, no larger than
    /// 4 GiB, and unused by anything else for the allocator's lifetime.
    pub unsafe fn from_raw(
        start: Address,
        size: usize,
        size_fn: ObjectSizeFn,
        start_full: bool,
    ) -> Self {
        let block_start = start.align_up(ALIGNMENT);
        let pool_size = raw_align_down(size - (block_start - start), MIN_BLOCK_SIZE);
        debug_assert!(pool_size >= MIN_BLOCK_SIZE);
        debug_assert!(pool_size < bits::NULL_OFFSET as usize);

        let tlsf = PageTlsf {
            block_start,
            pool_size,
            size_fn,
            fl_bitmap: AtomicU64::new(0),
            heads: std::array::from_fn(|_| AtomicU64::new(EMPTY_HEAD)),
            _pool: PhantomData,
        };

        if !start_full {
            let blk = Block::from_address(block_start);
            blk.set_size_and_clear_flags(pool_size);
            tlsf.insert_block(blk);
        }
        tlsf
    }

    /// Return the allocator to the entirely-used state: every list empty,
    /// the whole pool one implicit used block. No pool memory is written;
    /// used blocks have no headers to reinitialize.
    pub fn reset(&mut self) {
        self.fl_bitmap.store(0, Ordering::SeqCst);
        for head in self.heads.iter() {
            head.store(EMPTY_HEAD, Ordering::SeqCst);
        }
    }

    /// Allocate `size` bytes. Returns an 8-byte-aligned block address, or
    /// `None` on exhaustion.
    pub fn allocate(&self, size: usize) -> Option<Address> {
        let aligned = mapping::align_size::<PageConfig>(size);

        loop {
            let index = self.find_suitable(aligned)?;
            // The pop can fail under contention or because the class
            // drained before we got to it; re-run the bitmap search.
            let Some(blk) = self.remove_head(index) else {
                continue;
            };

            let blk_size = blk.size();
            debug_assert!(blk_size >= aligned);
            if blk_size - aligned >= MIN_BLOCK_SIZE {
                let remainder = Block::from_address(blk.start() + aligned);
                remainder.set_size_and_clear_flags(blk_size - aligned);
                self.insert_block(remainder);
                blk.set_size_and_clear_flags(aligned);
            }

            trace!("page-tlsf: allocate({}) -> {}", size, blk.start());
            return Some(blk.start());
        }
    }

    /// Free the `size`-byte block at `ptr`. The size is caller-supplied
    /// because used blocks store none. Null and out-of-pool pointers are
    /// ignored.
    pub fn free(&self, ptr: Address, size: usize) {
        if ptr.is_zero() || !self.contains(ptr) {
            return;
        }
        debug_assert!(size >= FREE_BLOCK_OVERLAY_BYTES);
        debug_assert!(ptr + size <= self.block_start + self.pool_size);

        let blk = Block::from_address(ptr);
        blk.set_size_and_clear_flags(size);
        self.insert_block(blk);
    }

    /// Record a contiguous, previously unregistered range as one free
    /// block. The range must hold exactly one as-yet-unrecorded block and
    /// must not overlap anything the allocator already tracks.
    pub fn free_range(&self, start: Address, size: usize) {
        trace!("page-tlsf: free_range({}, {})", start, size);
        self.free(start, size);
    }

    /// Coalesce every run of physically adjacent free blocks into one block
    /// each, rebuilding the free lists in a single pass over the pool.
    ///
    /// This is the only coalescing path for this variant. It requires every
    /// byte of the pool to be covered by exactly one block (live objects
    /// count as used blocks, reported by the `ObjectSizeFn`), and it is not
    /// safe against concurrent allocator traffic, which the `&mut self`
    /// receiver enforces.
    pub fn aggregate(&mut self) {
        self.fl_bitmap.store(0, Ordering::SeqCst);
        for head in self.heads.iter() {
            head.store(EMPTY_HEAD, Ordering::SeqCst);
        }

        let end = self.block_start + self.pool_size;
        let mut merged_runs = 0usize;
        // The free run currently being accumulated, if any.
        let mut run: Option<(Address, usize)> = None;
        let mut curr = self.block_start;

        while curr < end {
            let object_size = (self.size_fn)(curr);
            if object_size > 0 {
                // A used block. Flush the free run behind it.
                if let Some((start, len)) = run.take() {
                    self.insert_run(start, len, &mut merged_runs);
                }
                curr += raw_align_up(object_size, MIN_BLOCK_SIZE);
            } else {
                let blk = Block::from_address(curr);
                let size = blk.size();
                debug_assert!(size >= FREE_BLOCK_OVERLAY_BYTES);
                debug_assert!(curr + size <= end);
                run = match run {
                    None => Some((curr, size)),
                    Some((start, len)) => {
                        debug_assert!(start + len == curr);
                        Some((start, len + size))
                    }
                };
                curr += size;
            }
        }
        if let Some((start, len)) = run.take() {
            self.insert_run(start, len, &mut merged_runs);
        }

        debug!(
            "page-tlsf: aggregate over {} rebuilt {} free runs",
            self.block_start, merged_runs
        );
    }

    /// Usable bytes of the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// First byte of the pool.
    pub fn pool_start(&self) -> Address {
        self.block_start
    }

    /// Does `addr` point into the pool?
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.block_start && addr < self.block_start + self.pool_size
    }

    /// Total payload bytes on the free lists. Only meaningful while no
    /// other thread is mutating the allocator.
    pub fn free_bytes(&self) -> usize {
        self.walk_free_lists().0
    }

    /// Number of blocks on the free lists. Only meaningful while quiesced.
    pub fn free_blocks(&self) -> usize {
        self.walk_free_lists().1
    }

    fn walk_free_lists(&self) -> (usize, usize) {
        let mut bytes = 0;
        let mut blocks = 0;
        for head in self.heads.iter() {
            let mut cursor = self.head_block(head.load(Ordering::SeqCst));
            while let Some(blk) = cursor {
                bytes += blk.size();
                blocks += 1;
                cursor = blk.next_free_packed(self.block_start);
            }
        }
        (bytes, blocks)
    }

    fn head_block(&self, head: u64) -> Option<Block> {
        bits::from_offset(self.block_start, Half::Lower, head).map(Block::from_address)
    }

    fn pack_head(&self, version: u32, blk: Option<Block>) -> u64 {
        bits::combine_halves(version, bits::to_offset(blk.map(|b| b.start()), self.block_start))
    }

    fn find_suitable(&self, aligned_size: usize) -> Option<usize> {
        // Blocks on the oversize list are only guaranteed to be at least as
        // large as the biggest indexed class; requests beyond that cannot
        // be good-fit matched and are unfulfillable.
        if aligned_size > 1 << (PageConfig::FL_INDEX + mapping::MIN_ALLOC_LOG2) {
            return None;
        }

        let target = mapping::search_size::<PageConfig>(aligned_size);
        let index = mapping::single_level_index::<PageConfig>(target);
        let above = self.fl_bitmap.load(Ordering::SeqCst) & (u64::MAX << index);
        if above == 0 {
            None
        } else {
            Some(bits::ffs(above))
        }
    }

    fn insert_block(&self, blk: Block) {
        blk.mark_free();
        let index = mapping::single_level_index::<PageConfig>(blk.size());
        let slot = &self.heads[index];

        loop {
            let head = slot.load(Ordering::SeqCst);
            let next = self.head_block(head);
            // The links must be in place before the block is published.
            blk.init_links_packed(self.block_start, next);
            let new_head = self.pack_head(1, Some(blk));
            if slot
                .compare_exchange(head, new_head, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        self.fl_bitmap.fetch_or(1 << index, Ordering::SeqCst);
    }

    /// Pop the head of list `index`. Returns `None` when the list is empty
    /// or the CAS lost a race; the caller re-runs the bitmap search. Only
    /// the head may ever be removed from these lists.
    fn remove_head(&self, index: usize) -> Option<Block> {
        let slot = &self.heads[index];
        let head = slot.load(Ordering::SeqCst);

        let Some(actual_head) = self.head_block(head) else {
            // Empty list with its bitmap bit still set. Clear the stale
            // bit so the search can make progress, restoring it if an
            // insert published a block in the meantime.
            self.fl_bitmap.fetch_and(!(1 << index), Ordering::SeqCst);
            if self.head_block(slot.load(Ordering::SeqCst)).is_some() {
                self.fl_bitmap.fetch_or(1 << index, Ordering::SeqCst);
            }
            return None;
        };

        let version = bits::get_half(head, Half::Upper);
        let next = actual_head.next_free_packed(self.block_start);
        let new_head = self.pack_head(version.wrapping_add(1), next);

        if slot
            .compare_exchange(head, new_head, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        if next.is_none() {
            self.fl_bitmap.fetch_and(!(1 << index), Ordering::SeqCst);
        }
        Some(actual_head)
    }

    fn insert_run(&self, start: Address, len: usize, merged_runs: &mut usize) {
        let blk = Block::from_address(start);
        blk.set_size_and_clear_flags(len);
        self.insert_block(blk);
        *merged_runs += 1;
    }
}
