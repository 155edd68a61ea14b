//! Page-granular memory source with per-page kind tags.
//!
//! One contiguous region is reserved from the operating system up front and
//! handed out in 4 KiB page runs. A side table records a kind tag for every
//! page, so any address inside the region can be classified in O(1) and
//! walked back to the base of its run.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

/// Size of one page.
pub const PAGE_SIZE: usize = 4096;

/// Mask extracting the page-aligned base of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Classification tag recorded for every page in the managed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// Unallocated page.
    Free = 0,
    /// Continuation page of a multi-page run; the run's head page carries
    /// the real kind.
    Extension,
    /// Collector-owned segment holding movable-never, walkable objects.
    HeapSegment,
    /// Collector-owned segment for pinned objects.
    PinnedSegment,
    /// The handle-table segment.
    HandleTable,
    /// A whole-page-run object allocated directly from the page source.
    RawObject,
    /// Externally managed small-object heap page.
    ExternalSmall,
    /// Externally managed medium-object heap page.
    ExternalMedium,
    /// Externally managed large-object heap page.
    ExternalLarge,
    /// Bookkeeping region (page tag table, registries).
    Metadata,
    /// The address does not fall inside the managed region.
    NotOurs = 0xFF,
}

/// A page source carved from one reserved region.
///
/// All methods take `&mut self`; callers serialize access externally (the
/// collector runs under a global lock with interrupts masked).
pub struct PageAllocator {
    region: os::Mapping,
    base: usize,
    page_count: usize,
    tags: Box<[PageKind]>,
    /// Pages that have been handed out at least once and therefore may
    /// contain stale data when reused.
    dirty: Box<[bool]>,
}

impl PageAllocator {
    /// Reserve a managed region of at least `reserve_bytes`, rounded up to
    /// whole pages.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when the region cannot be mapped.
    pub fn new(reserve_bytes: usize) -> io::Result<Self> {
        let page_count = reserve_bytes.div_ceil(PAGE_SIZE).max(1);
        let region = os::Mapping::map_anon(page_count * PAGE_SIZE)?;
        let base = region.ptr() as usize;
        debug_assert_eq!(base % PAGE_SIZE, 0);
        Ok(Self {
            region,
            base,
            page_count,
            tags: vec![PageKind::Free; page_count].into_boxed_slice(),
            dirty: vec![false; page_count].into_boxed_slice(),
        })
    }

    /// First address of the managed region.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// One past the last address of the managed region.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.page_count * PAGE_SIZE
    }

    /// Total number of pages in the region.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    /// Number of pages currently tagged [`PageKind::Free`].
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.tags.iter().filter(|t| **t == PageKind::Free).count()
    }

    /// Whether `addr` lies inside the managed region.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.page_count * PAGE_SIZE
    }

    fn index_of(&self, addr: usize) -> Option<usize> {
        if self.contains(addr) {
            Some((addr - self.base) / PAGE_SIZE)
        } else {
            None
        }
    }

    /// Allocate `count` consecutive pages tagged `kind`.
    ///
    /// The head page carries `kind`; continuation pages are tagged
    /// [`PageKind::Extension`]. Returns `None` when no run of `count` free
    /// pages exists. When `zero` is set, previously used pages in the run
    /// are cleared before being returned.
    pub fn alloc_pages(&mut self, kind: PageKind, count: usize, zero: bool) -> Option<NonNull<u8>> {
        assert!(count > 0, "page run must be non-empty");
        assert!(
            !matches!(kind, PageKind::Free | PageKind::Extension | PageKind::NotOurs),
            "cannot allocate pages of kind {kind:?}"
        );

        let head = self.find_free_run(count)?;
        self.tags[head] = kind;
        for tag in &mut self.tags[head + 1..head + count] {
            *tag = PageKind::Extension;
        }

        let ptr = (self.base + head * PAGE_SIZE) as *mut u8;
        if zero {
            for i in head..head + count {
                if self.dirty[i] {
                    // SAFETY: page i is inside the mapped region and owned
                    // by this allocation.
                    unsafe {
                        std::ptr::write_bytes(
                            (self.base + i * PAGE_SIZE) as *mut u8,
                            0,
                            PAGE_SIZE,
                        );
                    }
                }
            }
        }
        for d in &mut self.dirty[head..head + count] {
            *d = true;
        }

        // SAFETY: ptr points into the mapped region, never null.
        Some(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// First-fit search for `count` consecutive free pages.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (i, tag) in self.tags.iter().enumerate() {
            if *tag == PageKind::Free {
                run += 1;
                if run == count {
                    return Some(i + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Return the run containing `ptr` to the free pool.
    ///
    /// `ptr` may point anywhere inside the run. Returns the number of pages
    /// released, or 0 when the address is not inside an allocated run.
    pub fn free(&mut self, ptr: NonNull<u8>) -> usize {
        let Some(head) = self.run_head_index(ptr.as_ptr() as usize) else {
            return 0;
        };
        self.tags[head] = PageKind::Free;
        let mut released = 1;
        for tag in &mut self.tags[head + 1..] {
            if *tag != PageKind::Extension {
                break;
            }
            *tag = PageKind::Free;
            released += 1;
        }
        released
    }

    /// Kind tag of the page containing `addr`.
    ///
    /// Continuation pages report [`PageKind::Extension`]; use
    /// [`Self::run_kind_of`] to resolve to the run's kind.
    #[must_use]
    pub fn kind_of(&self, addr: usize) -> PageKind {
        self.index_of(addr)
            .map_or(PageKind::NotOurs, |i| self.tags[i])
    }

    /// Kind tag of the run containing `addr`, resolving continuation pages
    /// to their head's kind.
    #[must_use]
    pub fn run_kind_of(&self, addr: usize) -> PageKind {
        self.run_head_index(addr)
            .map_or(PageKind::NotOurs, |i| self.tags[i])
    }

    /// Base address of the allocated run containing `addr`.
    #[must_use]
    pub fn page_base_of(&self, addr: usize) -> Option<NonNull<u8>> {
        let head = self.run_head_index(addr)?;
        NonNull::new((self.base + head * PAGE_SIZE) as *mut u8)
    }

    fn run_head_index(&self, addr: usize) -> Option<usize> {
        let mut i = self.index_of(addr)?;
        while self.tags[i] == PageKind::Extension {
            i -= 1;
        }
        if self.tags[i] == PageKind::Free {
            None
        } else {
            Some(i)
        }
    }

    /// Iterate `(page_base_address, kind)` over every page in the region.
    pub fn pages(&self) -> impl Iterator<Item = (usize, PageKind)> + '_ {
        self.tags
            .iter()
            .enumerate()
            .map(|(i, tag)| (self.base + i * PAGE_SIZE, *tag))
    }

    /// Keep the region mapping alive for the allocator's lifetime.
    #[must_use]
    pub const fn region_len(&self) -> usize {
        self.region.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(pages: usize) -> PageAllocator {
        PageAllocator::new(pages * PAGE_SIZE).expect("failed to reserve test region")
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut pa = alloc(16);
        let p = pa.alloc_pages(PageKind::HeapSegment, 4, true).unwrap();
        assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(pa.kind_of(p.as_ptr() as usize), PageKind::HeapSegment);
        assert_eq!(
            pa.kind_of(p.as_ptr() as usize + PAGE_SIZE),
            PageKind::Extension
        );
        assert_eq!(pa.free_page_count(), 12);

        assert_eq!(pa.free(p), 4);
        assert_eq!(pa.free_page_count(), 16);
        assert_eq!(pa.kind_of(p.as_ptr() as usize), PageKind::Free);
    }

    #[test]
    fn interior_pointer_resolves_to_run_head() {
        let mut pa = alloc(8);
        let p = pa.alloc_pages(PageKind::RawObject, 3, false).unwrap();
        let interior = p.as_ptr() as usize + 2 * PAGE_SIZE + 123;
        assert_eq!(pa.run_kind_of(interior), PageKind::RawObject);
        assert_eq!(pa.page_base_of(interior).unwrap(), p);
    }

    #[test]
    fn out_of_range_is_not_ours() {
        let pa = alloc(4);
        assert_eq!(pa.kind_of(pa.base() - 8), PageKind::NotOurs);
        assert_eq!(pa.kind_of(pa.end()), PageKind::NotOurs);
        assert!(pa.page_base_of(pa.end() + PAGE_SIZE).is_none());
    }

    #[test]
    fn free_pages_have_no_run_head() {
        let pa = alloc(4);
        assert_eq!(pa.run_kind_of(pa.base()), PageKind::NotOurs);
        assert!(pa.page_base_of(pa.base()).is_none());
    }

    #[test]
    fn first_fit_reuses_released_runs() {
        let mut pa = alloc(8);
        let a = pa.alloc_pages(PageKind::HeapSegment, 2, true).unwrap();
        let _b = pa.alloc_pages(PageKind::HeapSegment, 2, true).unwrap();
        pa.free(a);
        let c = pa.alloc_pages(PageKind::PinnedSegment, 2, true).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn reused_pages_are_zeroed_on_request() {
        let mut pa = alloc(4);
        let p = pa.alloc_pages(PageKind::HeapSegment, 1, true).unwrap();
        unsafe { p.as_ptr().write_bytes(0xAB, PAGE_SIZE) };
        pa.free(p);
        let q = pa.alloc_pages(PageKind::HeapSegment, 1, true).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pa = alloc(4);
        assert!(pa.alloc_pages(PageKind::HeapSegment, 5, false).is_none());
        let _p = pa.alloc_pages(PageKind::HeapSegment, 4, false).unwrap();
        assert!(pa.alloc_pages(PageKind::HeapSegment, 1, false).is_none());
    }
}
