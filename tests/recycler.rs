//! End-to-end scenarios for free-list reconstruction and the page recycler.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tlsf_recycler::recycler::{Page, PageAge, PageRecycler, MIN_FREE_RANGE_BYTES};
use tlsf_recycler::util::Address;

/// The GC side of the `ObjectSizeFn` contract: a registry of live objects,
/// keyed by address. Tests register objects before reconstruction; buffers
/// never overlap, so tests can share the registry.
static OBJECT_SIZES: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());

fn object_size(addr: Address) -> usize {
    OBJECT_SIZES
        .lock()
        .unwrap()
        .get(&addr.as_usize())
        .copied()
        .unwrap_or(0)
}

fn register_objects(page: &mut Page, objects: &[(usize, usize)]) {
    let mut sizes = OBJECT_SIZES.lock().unwrap();
    for &(offset, size) in objects {
        sizes.insert((page.start() + offset).as_usize(), size);
        page.record_live(offset, size);
    }
}

fn aligned_buffer(bytes: usize) -> Vec<u64> {
    vec![0u64; bytes / 8]
}

fn as_bytes(buf: &mut [u64]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf.len() * 8) }
}

#[test]
fn reconstruction_frees_exactly_the_qualifying_gaps() {
    let _ = env_logger::builder().is_test(true).try_init();

    const PAGE: usize = 2 * 1024 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Eden, object_size);

    let objects = [(0x0, 64), (0x4000, 128), (0x10000, 64)];
    register_objects(&mut page, &objects);

    assert!(page.init_free_list(1));

    // Gaps: between object ends (aligned up) and the next object start,
    // plus the tail; only those of at least the threshold count.
    let mut expected = 0;
    let mut curr = 0usize;
    for &(offset, size) in &objects {
        let gap = offset - curr;
        if gap >= MIN_FREE_RANGE_BYTES {
            expected += gap;
        }
        curr = offset + tlsf_recycler::util::conversions::raw_align_up(size, 8);
    }
    let tail = PAGE - curr;
    if tail >= MIN_FREE_RANGE_BYTES {
        expected += tail;
    }

    assert_eq!(page.bytes_freed(), expected);
    assert_eq!(
        expected,
        (0x4000 - 64) + (0x10000 - 0x4080) + (PAGE - 0x10040)
    );
}

#[test]
fn allocations_never_overlap_live_objects() {
    const PAGE: usize = 2 * 1024 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Eden, object_size);

    let objects = [(0x0, 64), (0x4000, 128), (0x10000, 64)];
    register_objects(&mut page, &objects);
    assert!(page.init_free_list(1));

    let live_ranges: Vec<(usize, usize)> = objects
        .iter()
        .map(|&(offset, size)| {
            let start = (page.start() + offset).as_usize();
            (start, start + size)
        })
        .collect();

    let mut total = 0usize;
    while let Some(addr) = page.alloc_object_free_list(512, 1) {
        let (alloc_start, alloc_end) = (addr.as_usize(), addr.as_usize() + 512);
        for &(live_start, live_end) in &live_ranges {
            assert!(
                alloc_end <= live_start || alloc_start >= live_end,
                "allocation [{:#x}, {:#x}) overlaps live object [{:#x}, {:#x})",
                alloc_start,
                alloc_end,
                live_start,
                live_end
            );
        }
        assert!(addr >= page.start() && addr + 512usize <= page.end());
        total += 512;
    }

    assert!(page.exhausted());
    assert_eq!(page.bytes_used(), total);
    assert!(total <= page.bytes_freed());
}

#[test]
fn oversize_relocation_reports_exhaustion() {
    const PAGE: usize = 64 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Eden, object_size);

    register_objects(&mut page, &[(0x0, 64)]);
    assert!(page.init_free_list(1));
    assert!(!page.exhausted());

    let result = page.alloc_object_free_list(128 * 1024, 1);
    assert_eq!(result, None);
    assert!(page.exhausted());
    assert_eq!(page.failed_relocation_size(), 128 * 1024);
}

#[test]
fn old_pages_are_not_recycled() {
    const PAGE: usize = 64 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Old, object_size);
    register_objects(&mut page, &[(0x0, 64)]);
    assert!(!page.init_free_list(1));
}

#[test]
fn empty_pages_become_bump_targets_instead() {
    const PAGE: usize = 64 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Eden, object_size);

    // No live objects recorded: not a recycle target.
    assert!(!page.init_free_list(1));

    // Allocations fall back to the bump pointer, from the page start.
    let p = page.alloc_object_free_list(64, 1).unwrap();
    assert_eq!(p, page.start());
    let q = page.alloc_object_free_list(64, 1).unwrap();
    assert_eq!(q, page.start() + 64usize);
}

#[test]
fn reconstruction_can_be_repeated_across_cycles() {
    const PAGE: usize = 256 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Survivor, object_size);

    register_objects(&mut page, &[(0x0, 128)]);
    assert!(page.init_free_list(1));
    let freed_first = page.bytes_freed();
    let a1 = page.alloc_object_free_list(4096, 1).unwrap();
    assert!(page.bytes_used() >= 4096);

    // Next cycle: same survivors, allocator is reset in place.
    assert!(page.init_free_list(2));
    assert_eq!(page.bytes_freed(), freed_first);
    assert_eq!(page.bytes_used(), 0);

    // The rebuilt free list hands the same hole out again.
    let a2 = page.alloc_object_free_list(4096, 2).unwrap();
    assert_eq!(a2, a1);
}

#[test]
fn recycler_routes_around_exhausted_pages() {
    const PAGE: usize = 64 * 1024;
    let mut small_buf = aligned_buffer(PAGE);
    let mut big_buf = aligned_buffer(4 * PAGE);

    let mut small = Page::new(as_bytes(&mut small_buf), PageAge::Eden, object_size);
    let mut big = Page::new(as_bytes(&mut big_buf), PageAge::Eden, object_size);
    register_objects(&mut small, &[(0x0, 64)]);
    register_objects(&mut big, &[(0x0, 64)]);

    let recycler = PageRecycler::new();
    let seqnum = recycler.begin_cycle();
    assert!(small.init_free_list(seqnum));
    assert!(big.init_free_list(seqnum));
    recycler.add_page(&small);
    recycler.add_page(&big);

    // Too big for the small page: it gets marked exhausted and the big
    // page serves the request.
    let addr = recycler.alloc_object(100 * 1024, PageAge::Eden).unwrap();
    assert!(small.exhausted());
    assert!(addr >= big.start() && addr < big.end());

    // Subsequent requests skip the exhausted page entirely.
    let addr2 = recycler.alloc_object(1024, PageAge::Eden).unwrap();
    assert!(addr2 >= big.start() && addr2 < big.end());

    // Nothing can take more than the big page holds.
    assert_eq!(recycler.alloc_object(16 * PAGE, PageAge::Eden), None);
}

#[test]
fn recycler_targets_are_grouped_by_age() {
    const PAGE: usize = 64 * 1024;
    let mut eden_buf = aligned_buffer(PAGE);
    let mut survivor_buf = aligned_buffer(PAGE);

    let mut eden = Page::new(as_bytes(&mut eden_buf), PageAge::Eden, object_size);
    let mut survivor = Page::new(as_bytes(&mut survivor_buf), PageAge::Survivor, object_size);
    register_objects(&mut eden, &[(0x0, 64)]);
    register_objects(&mut survivor, &[(0x0, 64)]);

    let recycler = PageRecycler::new();
    let seqnum = recycler.begin_cycle();
    assert!(eden.init_free_list(seqnum));
    assert!(survivor.init_free_list(seqnum));
    recycler.add_page(&eden);
    recycler.add_page(&survivor);

    let to_eden = recycler.alloc_object(256, PageAge::Eden).unwrap();
    assert!(to_eden >= eden.start() && to_eden < eden.end());

    let to_survivor = recycler.alloc_object(256, PageAge::Survivor).unwrap();
    assert!(to_survivor >= survivor.start() && to_survivor < survivor.end());

    // No old targets were registered.
    assert_eq!(recycler.alloc_object(256, PageAge::Old), None);
}

#[test]
fn free_list_time_is_recorded() {
    const PAGE: usize = 2 * 1024 * 1024;
    let mut buf = aligned_buffer(PAGE);
    let mut page = Page::new(as_bytes(&mut buf), PageAge::Eden, object_size);

    // A page dense with live objects makes for a non-trivial walk.
    let objects: Vec<(usize, usize)> = (0..512).map(|i| (i * 4096, 64)).collect();
    register_objects(&mut page, &objects);

    assert!(page.init_free_list(1));
    assert!(page.free_list_time().as_nanos() > 0);
    // 511 inter-object gaps of 4032 bytes plus a 4032-byte tail.
    assert_eq!(page.bytes_freed(), 512 * 4032);
}
