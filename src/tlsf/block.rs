use std::num::NonZeroUsize;

use crate::util::bits::{self, Half};
use crate::util::Address;

/// Bytes of in-band metadata preceding the payload of every block in the
/// headered (base) configuration.
pub const BLOCK_HEADER_BYTES: usize = 32;

/// Bytes of free-block metadata the zero-header configuration overlays onto
/// the first bytes of a free block's payload: the size word plus one packed
/// link word.
pub const FREE_BLOCK_OVERLAY_BYTES: usize = 16;

// Header field offsets, in bytes from the block's first byte.
const SIZE_OFFSET: usize = 0;
const F1_OFFSET: usize = 8;
const F2_OFFSET: usize = 16;
const PREV_PHYS_OFFSET: usize = 24;

// The two low bits of the size word. Block sizes are multiples of the
// minimum block size, so these bits are always available.
const FREE_MASK: usize = 1;
const LAST_MASK: usize = 1 << 1;

/// A handle to one block inside a pool, addressed by its first byte (the
/// header in the headered configuration, the payload itself in the
/// zero-header one). This type always holds a non-zero address; the
/// underlying `NonZeroUsize` ensures `Option<Block>` is the same size as
/// `Block` itself.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(transparent)]
pub struct Block(NonZeroUsize);

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Block({:#x})", self.0)
    }
}

impl Block {
    pub fn from_address(address: Address) -> Self {
        debug_assert!(!address.is_zero());
        Self(unsafe { NonZeroUsize::new_unchecked(address.as_usize()) })
    }

    pub fn start(&self) -> Address {
        unsafe { Address::from_usize(self.0.get()) }
    }

    /// The block's 32-bit offset from the pool base, for the packed link
    /// representation.
    pub fn offset_from(&self, base: Address) -> u32 {
        bits::to_offset(Some(self.start()), base)
    }

    fn load_size_word(&self) -> usize {
        unsafe { (self.start() + SIZE_OFFSET).load::<usize>() }
    }

    fn store_size_word(&self, word: usize) {
        unsafe { (self.start() + SIZE_OFFSET).store::<usize>(word) }
    }

    /// Usable payload bytes, with the flag bits masked off. Does not include
    /// the header.
    pub fn size(&self) -> usize {
        self.load_size_word() & !(FREE_MASK | LAST_MASK)
    }

    /// Overwrite the size, preserving the flag bits.
    pub fn set_size(&self, size: usize) {
        debug_assert!(size & (FREE_MASK | LAST_MASK) == 0);
        let flags = self.load_size_word() & (FREE_MASK | LAST_MASK);
        self.store_size_word(size | flags);
    }

    /// Overwrite the size word entirely, clearing both flags.
    pub fn set_size_and_clear_flags(&self, size: usize) {
        debug_assert!(size & (FREE_MASK | LAST_MASK) == 0);
        self.store_size_word(size);
    }

    pub fn is_free(&self) -> bool {
        self.load_size_word() & FREE_MASK == FREE_MASK
    }

    pub fn is_last(&self) -> bool {
        self.load_size_word() & LAST_MASK == LAST_MASK
    }

    pub fn mark_free(&self) {
        self.store_size_word(self.load_size_word() | FREE_MASK);
    }

    pub fn mark_used(&self) {
        self.store_size_word(self.load_size_word() & !FREE_MASK);
    }

    pub fn mark_last(&self) {
        self.store_size_word(self.load_size_word() | LAST_MASK);
    }

    pub fn unmark_last(&self) {
        self.store_size_word(self.load_size_word() & !LAST_MASK);
    }

    fn load_link(&self, offset: usize) -> Option<Block> {
        let raw = unsafe { (self.start() + offset).load::<usize>() };
        NonZeroUsize::new(raw).map(Block)
    }

    fn store_link(&self, offset: usize, block: Option<Block>) {
        let raw = block.map_or(0, |b| b.start().as_usize());
        unsafe { (self.start() + offset).store::<usize>(raw) }
    }

    /// Next block in this block's free list (raw-pointer linkage).
    pub fn next_free(&self) -> Option<Block> {
        self.load_link(F1_OFFSET)
    }

    pub fn set_next_free(&self, next: Option<Block>) {
        self.store_link(F1_OFFSET, next);
    }

    /// Previous block in this block's free list (raw-pointer linkage).
    pub fn prev_free(&self) -> Option<Block> {
        self.load_link(F2_OFFSET)
    }

    pub fn set_prev_free(&self, prev: Option<Block>) {
        self.store_link(F2_OFFSET, prev);
    }

    /// The physically preceding block. Only maintained by configurations
    /// that coalesce eagerly.
    pub fn prev_phys(&self) -> Option<Block> {
        self.load_link(PREV_PHYS_OFFSET)
    }

    pub fn set_prev_phys(&self, prev: Option<Block>) {
        self.store_link(PREV_PHYS_OFFSET, prev);
    }

    fn load_f1(&self) -> u64 {
        unsafe { (self.start() + F1_OFFSET).load::<u64>() }
    }

    fn store_f1(&self, word: u64) {
        unsafe { (self.start() + F1_OFFSET).store::<u64>(word) }
    }

    /// Next block in this block's free list, in the packed base-relative
    /// representation: the lower half of `f1` holds the offset of the next
    /// block, the upper half the offset of the previous one.
    pub fn next_free_packed(&self, base: Address) -> Option<Block> {
        bits::from_offset(base, Half::Lower, self.load_f1()).map(Block::from_address)
    }

    pub fn set_next_free_packed(&self, base: Address, next: Option<Block>) {
        let mut word = self.load_f1();
        bits::set_half(
            &mut word,
            Half::Lower,
            bits::to_offset(next.map(|b| b.start()), base),
        );
        self.store_f1(word);
    }

    pub fn prev_free_packed(&self, base: Address) -> Option<Block> {
        bits::from_offset(base, Half::Upper, self.load_f1()).map(Block::from_address)
    }

    pub fn set_prev_free_packed(&self, base: Address, prev: Option<Block>) {
        let mut word = self.load_f1();
        bits::set_half(
            &mut word,
            Half::Upper,
            bits::to_offset(prev.map(|b| b.start()), base),
        );
        self.store_f1(word);
    }

    /// Initialize both packed links at once. Used when a block is first
    /// freed, so the previous payload bytes cannot be misread as links.
    pub fn init_links_packed(&self, base: Address, next: Option<Block>) {
        self.store_f1(bits::combine_halves(
            bits::NULL_OFFSET,
            bits::to_offset(next.map(|b| b.start()), base),
        ));
    }
}
