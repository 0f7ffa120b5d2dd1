//! Free-list reconstruction: turning mostly-dead pages back into allocation
//! targets.
//!
//! After marking, each candidate page holds a handful of live objects and a
//! [`LiveMap`] of their start offsets. [`Page::init_free_list`] resets the
//! page's [`crate::tlsf::PageTlsf`] to "entirely used" and frees every
//! qualifying inter-object gap into it; relocation workers then place
//! objects into the holes through [`Page::alloc_object_free_list`]. The
//! [`PageRecycler`] keeps the per-age lists of such target pages and routes
//! each relocation to the first page that can take it.

pub mod livemap;
pub mod page;

pub use self::livemap::LiveMap;
pub use self::page::{Page, PageAge, RecycleStats};

use enum_map::EnumMap;
use spin::RwLock;

use std::sync::atomic::{AtomicU32, Ordering};

use crate::util::Address;

/// Relocated objects are aligned to this.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Inter-object gaps smaller than this are not worth tracking as free
/// blocks; they stay dead until the page is eventually evacuated or freed.
pub const MIN_FREE_RANGE_BYTES: usize = 1024;

/// The set of pages currently serving as relocation targets, grouped by the
/// age the relocated objects will have.
pub struct PageRecycler<'a> {
    targets: EnumMap<PageAge, RwLock<Vec<&'a Page<'a>>>>,
    seqnum: AtomicU32,
}

impl<'a> PageRecycler<'a> {
    pub fn new() -> Self {
        PageRecycler {
            targets: EnumMap::default(),
            seqnum: AtomicU32::new(0),
        }
    }

    /// Start a new collection cycle and return its seqnum. Pages must be
    /// re-prepared (and re-added) with this seqnum to serve as targets.
    pub fn begin_cycle(&self) -> u32 {
        for list in self.targets.values() {
            list.write().clear();
        }
        self.seqnum.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The current collection cycle.
    pub fn seqnum(&self) -> u32 {
        self.seqnum.load(Ordering::SeqCst)
    }

    /// Register a prepared page as a relocation target.
    pub fn add_page(&self, page: &'a Page<'a>) {
        self.targets[page.age()].write().push(page);
    }

    /// Allocate room for a relocated object in some target page of the
    /// destination age. Pages that have already reported exhaustion are
    /// skipped. Returns `None` when no target can take the object; the
    /// caller falls back to relocating elsewhere (or in place).
    pub fn alloc_object(&self, size: usize, to_age: PageAge) -> Option<Address> {
        let seqnum = self.seqnum();
        for page in self.targets[to_age].read().iter() {
            if page.exhausted() {
                continue;
            }
            if let Some(addr) = page.alloc_object_free_list(size, seqnum) {
                return Some(addr);
            }
        }
        None
    }

    /// Drop every target page, e.g. at the end of a cycle.
    pub fn reset(&self) {
        for list in self.targets.values() {
            list.write().clear();
        }
    }
}

impl<'a> Default for PageRecycler<'a> {
    fn default() -> Self {
        Self::new()
    }
}
