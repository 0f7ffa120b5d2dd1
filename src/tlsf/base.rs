use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::tlsf::block::{Block, BLOCK_HEADER_BYTES};
use crate::tlsf::mapping::{self, BaseConfig, Mapping, TlsfConfig, ALIGNMENT};
use crate::util::bits;
use crate::util::conversions::raw_align_down;
use crate::util::Address;

const FL_INDEX: usize = BaseConfig::FL_INDEX;
const NUM_LISTS: usize = BaseConfig::NUM_LISTS;
const MIN_BLOCK_SIZE: usize = BaseConfig::MIN_BLOCK_SIZE;
const HEADER: usize = BLOCK_HEADER_BYTES;

/// The segregated free-list table and its occupancy bitmaps. All of it sits
/// behind one lock; the block headers themselves are only written while the
/// lock is held.
struct FreeLists {
    fl_bitmap: u64,
    sl_bitmap: [u32; FL_INDEX],
    heads: [Option<Block>; NUM_LISTS + 1],
}

impl FreeLists {
    const fn empty() -> Self {
        FreeLists {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX],
            heads: [None; NUM_LISTS + 1],
        }
    }
}

/// The base Two-Level Segregated Fit allocator: in-band 32-byte headers,
/// doubly-linked free lists, eager coalescing via `prev_phys_block`.
///
/// The allocator borrows its pool and stores nothing outside of it except
/// its own metadata (this struct), which [`Tlsf::create`] can place inside
/// the pool's first bytes.
pub struct Tlsf<'pool> {
    block_start: Address,
    pool_size: usize,
    lists: Mutex<FreeLists>,
    /// Total payload bytes handed out, over the allocator's lifetime.
    allocated: AtomicUsize,
    /// Bytes handed out beyond what was asked for (internal fragmentation).
    overcommitted: AtomicUsize,
    _pool: PhantomData<&'pool mut [u8]>,
}

impl<'pool> Tlsf<'pool> {
    /// Construct an allocator over `pool`. With `start_full` the whole pool
    /// begins as one used block and the caller populates the free list
    /// through [`Tlsf::free`]; otherwise it begins as one free block.
    pub fn new(pool: &'pool mut [u8], start_full: bool) -> Self {
        // The slice is a live unique borrow for the allocator's lifetime.
        unsafe { Self::from_raw(Address::from_mut_ptr(pool.as_mut_ptr()), pool.len(), start_full) }
    }

    /// Construct an allocator over the raw region `[start, start + size)`.
    ///
    /// # Safety
    /// The region must be writable, at least 8-byte aligned, and unused by
    /// anything else for the allocator's lifetime.
    pub unsafe fn from_raw(start: Address, size: usize, start_full: bool) -> Self {
        let block_start = start.align_up(ALIGNMENT);
        // The pool shrinks to whole block-size granules. This wastes at most
        // MIN_BLOCK_SIZE - 1 bytes.
        let pool_size = raw_align_down(size - (block_start - start), MIN_BLOCK_SIZE);
        debug_assert!(pool_size >= HEADER + MIN_BLOCK_SIZE);
        debug_assert!(pool_size < 1 << FL_INDEX);

        let tlsf = Tlsf {
            block_start,
            pool_size,
            lists: Mutex::new(FreeLists::empty()),
            allocated: AtomicUsize::new(0),
            overcommitted: AtomicUsize::new(0),
            _pool: PhantomData,
        };
        tlsf.reset(start_full);
        tlsf
    }

    /// Placement-style factory: the allocator's own metadata is written to
    /// the first bytes of the region and the remainder becomes the pool, so
    /// metadata and pool share one lifetime.
    ///
    /// # Safety
    /// Same as [`Tlsf::from_raw`]; additionally `start` must be aligned for
    /// this type, and the returned reference must not outlive the region.
    /// The metadata is never dropped; `Tlsf` has no destructor.
    pub unsafe fn create<'a>(start: Address, size: usize, start_full: bool) -> &'a Self {
        let meta_bytes = mem::size_of::<Self>();
        debug_assert!(start.is_aligned_to(mem::align_of::<Self>()));
        debug_assert!(size > meta_bytes + HEADER + MIN_BLOCK_SIZE);
        let meta = start.to_mut_ptr::<Self>();
        meta.write(Self::from_raw(start + meta_bytes, size - meta_bytes, start_full));
        &*meta
    }

    /// Return the allocator to its initial state without touching its
    /// metadata allocation: every list empty and the whole pool covered by
    /// one block, used or free per `start_full`.
    pub fn reset(&self, start_full: bool) {
        let mut lists = self.lists.lock();
        *lists = FreeLists::empty();
        self.allocated.store(0, Ordering::Relaxed);
        self.overcommitted.store(0, Ordering::Relaxed);

        let blk = Block::from_address(self.block_start);
        blk.set_size_and_clear_flags(self.pool_size - HEADER);
        blk.set_prev_phys(None);
        if !start_full {
            Self::insert_block(&mut lists, blk);
        }
        blk.mark_last();
    }

    /// Allocate `size` bytes. Returns an 8-byte-aligned payload address, or
    /// `None` if no block can satisfy the request.
    pub fn allocate(&self, size: usize) -> Option<Address> {
        let aligned = mapping::align_size::<BaseConfig>(size);

        let blk = {
            let mut lists = self.lists.lock();
            let suitable = Self::find_suitable(&lists, aligned)?;
            let blk = Self::remove_block(&mut lists, None, suitable)?;

            // Split when the slack could hold a block of its own, to keep
            // internal fragmentation down.
            if blk.size() - aligned >= MIN_BLOCK_SIZE + HEADER {
                let remainder = self.split_block(blk, aligned);
                Self::insert_block(&mut lists, remainder);
            }
            blk
        };

        self.allocated.fetch_add(blk.size(), Ordering::Relaxed);
        self.overcommitted.fetch_add(blk.size() - size, Ordering::Relaxed);

        trace!("tlsf: allocate({}) -> {}", size, blk.start() + HEADER);
        Some(blk.start() + HEADER)
    }

    /// Free the allocation whose payload begins at `ptr`, coalescing with
    /// free physical neighbors. Null and out-of-pool pointers are ignored.
    pub fn free(&self, ptr: Address) {
        if ptr.is_zero() || !self.contains(ptr) {
            return;
        }

        let mut blk = Block::from_address(ptr - HEADER);

        let mut lists = self.lists.lock();
        trace!("tlsf: free({}) size {}", ptr, blk.size());
        let prev = blk.prev_phys();
        let next = self.next_phys(blk);

        if let Some(prev) = prev {
            if prev.is_free() {
                blk = self.coalesce(&mut lists, prev, blk);
            }
        }
        if let Some(next) = next {
            if next.is_free() {
                blk = self.coalesce(&mut lists, blk, next);
            }
        }

        Self::insert_block(&mut lists, blk);
    }

    /// Payload bytes of the active allocation at `ptr`.
    pub fn get_allocated_size(&self, ptr: Address) -> usize {
        debug_assert!(self.contains(ptr));
        Block::from_address(ptr - HEADER).size()
    }

    /// The ratio of bytes handed out beyond what was requested to all bytes
    /// handed out.
    pub fn internal_fragmentation(&self) -> f64 {
        let allocated = self.allocated.load(Ordering::Relaxed);
        if allocated == 0 {
            return 0.0;
        }
        self.overcommitted.load(Ordering::Relaxed) as f64 / allocated as f64
    }

    /// Usable bytes of the pool (headers included, metadata excluded).
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Does `addr` point into the pool?
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.block_start && addr < self.block_start + self.pool_size
    }

    /// Total payload bytes currently on the free lists.
    pub fn free_bytes(&self) -> usize {
        self.walk_free_lists().0
    }

    /// Number of blocks currently on the free lists.
    pub fn free_blocks(&self) -> usize {
        self.walk_free_lists().1
    }

    fn walk_free_lists(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        let mut bytes = 0;
        let mut blocks = 0;
        for head in lists.heads.iter() {
            let mut cursor = *head;
            while let Some(blk) = cursor {
                bytes += blk.size();
                blocks += 1;
                cursor = blk.next_free();
            }
        }
        (bytes, blocks)
    }

    fn next_phys(&self, blk: Block) -> Option<Block> {
        let next = blk.start() + HEADER + blk.size();
        if self.contains(next) {
            Some(Block::from_address(next))
        } else {
            None
        }
    }

    fn find_suitable(lists: &FreeLists, aligned_size: usize) -> Option<Mapping> {
        let target = mapping::search_size::<BaseConfig>(aligned_size);
        let m = mapping::get_mapping::<BaseConfig>(target);

        // A first level past the table means the request is larger than the
        // largest indexed class and cannot be fulfilled.
        if m.fl >= FL_INDEX {
            return None;
        }

        let sl_map = lists.sl_bitmap[m.fl] & (u32::MAX << m.sl);
        if sl_map != 0 {
            return Some(Mapping {
                fl: m.fl,
                sl: bits::ffs(sl_map as u64),
            });
        }

        // Nothing in this first level at or above sl; search the next
        // non-empty first level and take its smallest class.
        let fl_map = lists.fl_bitmap & (u64::MAX << (m.fl + 1));
        if fl_map == 0 {
            return None;
        }
        let fl = bits::ffs(fl_map);
        Some(Mapping {
            fl,
            sl: bits::ffs(lists.sl_bitmap[fl] as u64),
        })
    }

    fn insert_block(lists: &mut FreeLists, blk: Block) {
        let m = mapping::get_mapping::<BaseConfig>(blk.size());
        let flat = mapping::flatten::<BaseConfig>(m);

        let head = lists.heads[flat];
        if let Some(head) = head {
            head.set_prev_free(Some(blk));
        }
        blk.set_next_free(head);
        blk.set_prev_free(None);
        lists.heads[flat] = Some(blk);

        blk.mark_free();

        lists.fl_bitmap |= 1 << m.fl;
        lists.sl_bitmap[m.fl] |= 1 << m.sl;
    }

    /// Unlink `blk` from its list, or pop the head of the `mapping` list
    /// when `blk` is `None`. The removed block is marked used.
    fn remove_block(lists: &mut FreeLists, blk: Option<Block>, m: Mapping) -> Option<Block> {
        let flat = mapping::flatten::<BaseConfig>(m);
        let target = blk.or(lists.heads[flat])?;

        let next = target.next_free();
        let prev = target.prev_free();

        if lists.heads[flat] == Some(target) {
            lists.heads[flat] = next;
        }
        if let Some(next) = next {
            next.set_prev_free(prev);
        }
        if let Some(prev) = prev {
            prev.set_next_free(next);
        }

        if lists.heads[flat].is_none() {
            lists.sl_bitmap[m.fl] &= !(1 << m.sl);
            if lists.sl_bitmap[m.fl] == 0 {
                lists.fl_bitmap &= !(1 << m.fl);
            }
        }

        target.set_next_free(None);
        target.set_prev_free(None);
        target.mark_used();
        Some(target)
    }

    /// Shrink `blk` to `size` payload bytes and carve the rest into a new
    /// block immediately after it. The LAST flag moves to the remainder.
    fn split_block(&self, blk: Block, size: usize) -> Block {
        let remainder_size = blk.size() - HEADER - size;
        let was_last = blk.is_last();

        blk.set_size_and_clear_flags(size);

        let remainder = Block::from_address(blk.start() + HEADER + size);
        remainder.set_size_and_clear_flags(remainder_size);
        remainder.set_prev_phys(Some(blk));

        if was_last {
            remainder.mark_last();
        } else if let Some(next) = self.next_phys(remainder) {
            next.set_prev_phys(Some(remainder));
        }

        trace!(
            "tlsf: split {:?} -> {} + {}",
            blk,
            blk.size(),
            remainder_size
        );
        remainder
    }

    /// Merge `b2` into `b1`, where `b1` immediately precedes `b2`
    /// physically. Either block is first removed from its list if free.
    fn coalesce(&self, lists: &mut FreeLists, b1: Block, b2: Block) -> Block {
        let b2_size = b2.size();
        if b1.is_free() {
            Self::remove_block(lists, Some(b1), mapping::get_mapping::<BaseConfig>(b1.size()));
        }
        if b2.is_free() {
            Self::remove_block(lists, Some(b2), mapping::get_mapping::<BaseConfig>(b2_size));
        }

        let b2_was_last = b2.is_last();
        b1.set_size(b1.size() + HEADER + b2_size);

        if b2_was_last {
            b1.mark_last();
        } else if let Some(next) = self.next_phys(b1) {
            next.set_prev_phys(Some(b1));
        }

        b1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(bytes: usize) -> Vec<u8> {
        vec![0u8; bytes]
    }

    #[test]
    fn starts_with_one_free_block() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        assert_eq!(tlsf.free_blocks(), 1);
        assert_eq!(tlsf.free_bytes(), tlsf.pool_size() - HEADER);
    }

    #[test]
    fn starts_full_when_asked() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, true);
        assert_eq!(tlsf.free_blocks(), 0);
        assert_eq!(tlsf.allocate(64), None);
    }

    #[test]
    fn allocate_returns_aligned_payloads() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        for size in [1, 7, 32, 100, 500] {
            let ptr = tlsf.allocate(size).unwrap();
            assert!(ptr.is_aligned_to(ALIGNMENT));
            assert!(tlsf.contains(ptr));
        }
    }

    #[test]
    fn allocation_too_large_fails() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        assert_eq!(tlsf.allocate(8192), None);
        // A failed allocation leaves the free list intact.
        assert_eq!(tlsf.free_blocks(), 1);
    }

    #[test]
    fn free_of_null_and_foreign_pointers_is_ignored() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        tlsf.free(Address::ZERO);
        let mut elsewhere = [0u8; 64];
        tlsf.free(Address::from_mut_ptr(elsewhere.as_mut_ptr()));
        assert_eq!(tlsf.free_blocks(), 1);
    }

    #[test]
    fn split_and_coalesce_restore_the_pool() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        let usable = tlsf.free_bytes();

        let p1 = tlsf.allocate(100).unwrap();
        let p2 = tlsf.allocate(100).unwrap();
        assert_eq!(tlsf.free_blocks(), 1);

        tlsf.free(p1);
        assert_eq!(tlsf.free_blocks(), 2);
        tlsf.free(p2);
        // p2 merges with both neighbors.
        assert_eq!(tlsf.free_blocks(), 1);
        assert_eq!(tlsf.free_bytes(), usable);
    }

    #[test]
    fn reused_size_class_is_lifo() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        let p1 = tlsf.allocate(100).unwrap();
        let _p2 = tlsf.allocate(200).unwrap();
        tlsf.free(p1);
        let p3 = tlsf.allocate(100).unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn get_allocated_size_reports_block_payload() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        let p = tlsf.allocate(100).unwrap();
        // 100 rounds up to the 128-byte granule.
        assert_eq!(tlsf.get_allocated_size(p), 128);
    }

    #[test]
    fn placement_create_carves_metadata_from_the_pool() {
        let mut buf = pool(64 * 1024);
        let start = Address::from_mut_ptr(buf.as_mut_ptr()).align_up(mem::align_of::<Tlsf>());
        let tlsf = unsafe { Tlsf::create(start, 64 * 1024 - mem::align_of::<Tlsf>(), false) };
        assert!(tlsf.pool_size() < 64 * 1024 - mem::size_of::<Tlsf>());
        let p = tlsf.allocate(256).unwrap();
        assert!(tlsf.contains(p));
        assert!(p.as_usize() >= start.as_usize() + mem::size_of::<Tlsf>());
        tlsf.free(p);
        assert_eq!(tlsf.free_blocks(), 1);
    }

    #[test]
    fn reset_returns_to_a_single_block() {
        let mut buf = pool(4096);
        let tlsf = Tlsf::new(&mut buf, false);
        let _ = tlsf.allocate(100).unwrap();
        let _ = tlsf.allocate(200).unwrap();
        tlsf.reset(false);
        assert_eq!(tlsf.free_blocks(), 1);
        assert_eq!(tlsf.free_bytes(), tlsf.pool_size() - HEADER);
    }
}
