use enum_map::Enum;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::recycler::livemap::LiveMap;
use crate::recycler::{MIN_FREE_RANGE_BYTES, OBJECT_ALIGNMENT};
use crate::tlsf::{ObjectSizeFn, PageTlsf};
use crate::util::conversions::{raw_align_down, raw_align_up};
use crate::util::Address;

/// The age of a page's objects. Only young pages (eden or survivor) are
/// recycled; old pages are swept by other means.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Enum)]
pub enum PageAge {
    Eden,
    Survivor,
    Old,
}

/// Per-cycle statistics of one recycled page.
///
/// The counters are mutated from the allocation path by whichever relocation
/// worker happens to use the page, so they are relaxed atomics; nothing
/// orders on them.
pub struct RecycleStats {
    bytes_freed: AtomicUsize,
    bytes_used: AtomicUsize,
    exhausted: AtomicBool,
    failed_relocation_size: AtomicUsize,
    free_list_nanos: AtomicU64,
}

impl RecycleStats {
    fn new() -> Self {
        RecycleStats {
            bytes_freed: AtomicUsize::new(0),
            bytes_used: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            failed_relocation_size: AtomicUsize::new(0),
            free_list_nanos: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.bytes_freed.store(0, Ordering::Relaxed);
        self.bytes_used.store(0, Ordering::Relaxed);
        self.exhausted.store(false, Ordering::Relaxed);
        self.failed_relocation_size.store(0, Ordering::Relaxed);
        self.free_list_nanos.store(0, Ordering::Relaxed);
    }
}

/// One fixed-size page and its recycling state: the live map produced by
/// marking, the lazily-created page-optimized allocator over its interior,
/// a bump pointer for the non-recycling allocation path, and statistics.
pub struct Page<'buf> {
    start: Address,
    size: usize,
    age: PageAge,
    /// Bump cursor for the normal (non-recycled) allocation path.
    top: AtomicUsize,
    /// The collection cycle this page was last prepared for as a recycle
    /// target. Allocations carrying a different seqnum bypass the free list.
    recycling_seqnum: AtomicU32,
    live_map: LiveMap,
    size_fn: ObjectSizeFn,
    allocator: Option<PageTlsf<'buf>>,
    stats: RecycleStats,
    _buf: PhantomData<&'buf mut [u8]>,
}

impl<'buf> Page<'buf> {
    /// Wrap `buffer` as a page. The buffer must be 8-byte aligned.
    pub fn new(buffer: &'buf mut [u8], age: PageAge, size_fn: ObjectSizeFn) -> Self {
        let start = Address::from_mut_ptr(buffer.as_mut_ptr());
        debug_assert!(start.is_aligned_to(OBJECT_ALIGNMENT));
        let size = buffer.len();
        Page {
            start,
            size,
            age,
            top: AtomicUsize::new(start.as_usize()),
            recycling_seqnum: AtomicU32::new(0),
            live_map: LiveMap::new(size),
            size_fn,
            allocator: None,
            stats: RecycleStats::new(),
            _buf: PhantomData,
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn age(&self) -> PageAge {
        self.age
    }

    pub fn set_age(&mut self, age: PageAge) {
        self.age = age;
    }

    /// Record a live object found by marking, at `offset` bytes into the
    /// page.
    pub fn record_live(&mut self, offset: usize, size: usize) {
        debug_assert!(offset + size <= self.size);
        self.live_map.record_live(offset, size);
    }

    /// Forget all marks, e.g. when the page is reset for fresh allocation.
    pub fn clear_live_map(&mut self) {
        self.live_map.reset();
    }

    pub fn live_objects(&self) -> usize {
        self.live_map.live_objects()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_map.live_bytes()
    }

    /// Rebuild the page's free list from its live map, making it a recycle
    /// target for collection cycle `seqnum`.
    ///
    /// The allocator starts (or resets to) entirely used, and every
    /// inter-object gap of at least [`MIN_FREE_RANGE_BYTES`] is freed into
    /// it. Returns false when the page is not recyclable: old pages, and
    /// pages with no live objects at all (those become fresh bump-allocation
    /// targets instead).
    pub fn init_free_list(&mut self, seqnum: u32) -> bool {
        if let Some(allocator) = self.allocator.as_mut() {
            allocator.reset();
        }
        if self.allocator.is_none() {
            // Everything starts used; the walk below frees the holes.
            self.allocator =
                Some(unsafe { PageTlsf::from_raw(self.start, self.size, self.size_fn, true) });
        }

        if self.age == PageAge::Old {
            return false;
        }
        if self.live_map.live_objects() == 0 {
            self.top.store(self.start.as_usize(), Ordering::Relaxed);
            return false;
        }

        let timer = Instant::now();
        self.stats.reset();
        let allocator = self.allocator.as_ref().unwrap();

        let mut freed = 0usize;
        let mut curr = self.start;
        for offset in self.live_map.iter_offsets() {
            let addr = self.start + offset;
            let gap = raw_align_down(addr - curr, OBJECT_ALIGNMENT);
            if gap >= MIN_FREE_RANGE_BYTES {
                allocator.free_range(curr, gap);
                freed += gap;
            }

            let object_size = (self.size_fn)(addr);
            debug_assert!(object_size > 0, "live map bit without an object at {}", addr);
            curr = addr + raw_align_up(object_size, OBJECT_ALIGNMENT);
        }

        // The tail gap between the last live object and the page end.
        let tail = raw_align_down(self.end() - curr, OBJECT_ALIGNMENT);
        if tail >= MIN_FREE_RANGE_BYTES {
            allocator.free_range(curr, tail);
            freed += tail;
        }

        self.stats.bytes_freed.store(freed, Ordering::Relaxed);
        self.stats
            .free_list_nanos
            .store(timer.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.recycling_seqnum.store(seqnum, Ordering::Relaxed);

        debug!(
            "page {}: free list rebuilt, {} live objects, {} bytes freed",
            self.start,
            self.live_map.live_objects(),
            freed
        );
        true
    }

    /// Allocate room for a relocated object out of the page's holes.
    ///
    /// When the page is not a recycle target for `seqnum` (or has no
    /// allocator yet) the request falls through to the page's normal bump
    /// pointer. A free-list failure marks the page exhausted and records the
    /// size that did not fit; the caller should move on to another page.
    pub fn alloc_object_free_list(&self, size: usize, seqnum: u32) -> Option<Address> {
        let aligned = raw_align_up(size, OBJECT_ALIGNMENT);

        let recycling = self.recycling_seqnum.load(Ordering::Relaxed) == seqnum;
        let allocator = match (recycling, self.allocator.as_ref()) {
            (true, Some(allocator)) => allocator,
            _ => return self.alloc_object_bump(aligned),
        };

        match allocator.allocate(aligned) {
            Some(addr) => {
                self.stats.bytes_used.fetch_add(aligned, Ordering::Relaxed);
                Some(addr)
            }
            None => {
                self.stats.exhausted.store(true, Ordering::Relaxed);
                self.stats
                    .failed_relocation_size
                    .store(aligned, Ordering::Relaxed);
                None
            }
        }
    }

    fn alloc_object_bump(&self, aligned: usize) -> Option<Address> {
        loop {
            let top = self.top.load(Ordering::Relaxed);
            let new_top = top + aligned;
            if new_top > self.end().as_usize() {
                return None;
            }
            if self
                .top
                .compare_exchange(top, new_top, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { Address::from_usize(top) });
            }
        }
    }

    /// Has a free-list allocation failed on this page this cycle?
    pub fn exhausted(&self) -> bool {
        self.stats.exhausted.load(Ordering::Relaxed)
    }

    /// Bytes returned to the free list by the last reconstruction.
    pub fn bytes_freed(&self) -> usize {
        self.stats.bytes_freed.load(Ordering::Relaxed)
    }

    /// Bytes handed out of the free list this cycle.
    pub fn bytes_used(&self) -> usize {
        self.stats.bytes_used.load(Ordering::Relaxed)
    }

    /// The aligned size of the first allocation that did not fit.
    pub fn failed_relocation_size(&self) -> usize {
        self.stats.failed_relocation_size.load(Ordering::Relaxed)
    }

    /// How long the last free-list reconstruction took.
    pub fn free_list_time(&self) -> Duration {
        Duration::from_nanos(self.stats.free_list_nanos.load(Ordering::Relaxed))
    }
}
