//! The managed heap: segment chains, allocation paths, global state.
//!
//! Two independent singly linked segment chains exist, regular and pinned,
//! plus one standalone segment for the handle table. Allocation tries the
//! free lists, then bumps in the chain starting at the "last segment",
//! then grows by reserving fresh pages; a failed growth triggers one
//! collection and one retry before reporting exhaustion with a null
//! return.

use std::collections::HashSet;
use std::io;
use std::ptr::NonNull;

use page_alloc::{PageAllocator, PageKind, PAGE_SIZE};
use parking_lot::Mutex;

use crate::desc::TypeDesc;
use crate::frozen::FrozenRegistry;
use crate::handles::{HandleTable, HANDLE_SLOT_SIZE};
use crate::object;
use crate::segment::{Occupancy, Segment, SEGMENT_HEADER_SIZE};
use crate::freelist::FreeLists;

/// Which space an allocation lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// The regular mark-sweep heap.
    Regular,
    /// The pinned heap; addresses never move.
    Pinned,
    /// Whole-page runs handed straight to the page source.
    Raw,
}

/// Deallocation hook of an externally managed heap, invoked by sweep for
/// dead objects found in that heap's pages.
pub type ExternalFreeFn = unsafe fn(*mut u8);

/// Startup parameters.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Bytes reserved from the platform for the whole managed region.
    pub heap_reserve: usize,
    /// Number of handle-table slots.
    pub handle_capacity: usize,
    /// Minimum pages per freshly grown segment.
    pub min_segment_pages: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            heap_reserve: 32 << 20,
            handle_capacity: 512,
            min_segment_pages: 4,
        }
    }
}

// ============================================================================
// Segment chains
// ============================================================================

/// A singly linked chain of segments with the two cursor pointers the
/// allocator steers by: `last` is where the next bump attempt begins,
/// `current` is the segment that most recently served an allocation.
pub(crate) struct SegmentChain {
    pub(crate) head: *mut Segment,
    pub(crate) last: *mut Segment,
    pub(crate) current: *mut Segment,
}

impl SegmentChain {
    const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            last: std::ptr::null_mut(),
            current: std::ptr::null_mut(),
        }
    }

    pub(crate) fn iter(&self) -> ChainIter {
        ChainIter { cur: self.head }
    }

    fn push_back(&mut self, seg: NonNull<Segment>) {
        if self.head.is_null() {
            self.head = seg.as_ptr();
            return;
        }
        let mut cur = self.head;
        // SAFETY: chain nodes are live segments owned by this heap.
        unsafe {
            while !(*cur).next().is_null() {
                cur = (*cur).next();
            }
            (*cur).set_next(seg.as_ptr());
        }
    }

    /// Bump-allocate starting at `last`, walking the chain and wrapping
    /// once so every segment is visited one time.
    fn bump_alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let start = if self.last.is_null() {
            self.head
        } else {
            self.last
        };
        let mut cur = start;
        while !cur.is_null() {
            // SAFETY: chain nodes are live segments.
            if let Some(p) = unsafe { (*cur).try_bump(size) } {
                self.current = cur;
                return Some(p);
            }
            cur = unsafe { (*cur).next() };
        }
        cur = self.head;
        while cur != start {
            // SAFETY: chain nodes are live segments.
            if let Some(p) = unsafe { (*cur).try_bump(size) } {
                self.current = cur;
                return Some(p);
            }
            cur = unsafe { (*cur).next() };
        }
        None
    }

    fn len(&self) -> usize {
        self.iter().count()
    }
}

pub(crate) struct ChainIter {
    cur: *mut Segment,
}

impl Iterator for ChainIter {
    type Item = NonNull<Segment>;

    fn next(&mut self) -> Option<NonNull<Segment>> {
        let seg = NonNull::new(self.cur)?;
        // SAFETY: chain nodes are live segments.
        self.cur = unsafe { (*self.cur).next() };
        Some(seg)
    }
}

// ============================================================================
// External heaps
// ============================================================================

#[derive(Default)]
pub(crate) struct ExternalHeaps {
    small: Option<ExternalFreeFn>,
    medium: Option<ExternalFreeFn>,
    large: Option<ExternalFreeFn>,
}

impl ExternalHeaps {
    pub(crate) fn for_kind(&self, kind: PageKind) -> Option<ExternalFreeFn> {
        match kind {
            PageKind::ExternalSmall => self.small,
            PageKind::ExternalMedium => self.medium,
            PageKind::ExternalLarge => self.large,
            _ => None,
        }
    }

    fn set(&mut self, kind: PageKind, free: ExternalFreeFn) -> bool {
        match kind {
            PageKind::ExternalSmall => self.small = Some(free),
            PageKind::ExternalMedium => self.medium = Some(free),
            PageKind::ExternalLarge => self.large = Some(free),
            _ => return false,
        }
        true
    }
}

// ============================================================================
// The heap
// ============================================================================

/// How a conservative candidate address classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Candidate {
    /// A possible object start; descriptor validation decides.
    Object(NonNull<u8>),
    /// Inside a frozen segment: always live, traversal stops here.
    Frozen,
    /// Cannot be an object.
    Reject,
}

/// Process-wide collector state.
pub struct GcHeap {
    pub(crate) pages: PageAllocator,
    pub(crate) regular: SegmentChain,
    pub(crate) pinned: SegmentChain,
    pub(crate) free_lists: FreeLists,
    pub(crate) handles: HandleTable,
    pub(crate) frozen: FrozenRegistry,
    pub(crate) external: ExternalHeaps,
    /// Every descriptor ever passed to an allocation entry point. A mark
    /// candidate whose header word is not in this set is not an object.
    descriptors: HashSet<usize>,
    static_roots: Vec<(usize, usize)>,
    bounds: (usize, usize),
    min_segment_pages: usize,
    allocs_since_collect: usize,
    bytes_since_collect: usize,
}

impl GcHeap {
    /// Reserve the managed region and carve out the handle segment.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot supply the reserved region or the
    /// handle segment does not fit in it.
    pub fn new(config: GcConfig) -> io::Result<Self> {
        let mut pages = PageAllocator::new(config.heap_reserve)?;
        let handle_bytes = config.handle_capacity * HANDLE_SLOT_SIZE;
        let handle_pages = handle_bytes.div_ceil(PAGE_SIZE);
        let region = pages
            .alloc_pages(PageKind::HandleTable, handle_pages, true)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "handle segment does not fit")
            })?;
        // SAFETY: freshly allocated zeroed pages sized for the capacity.
        let handles = unsafe {
            HandleTable::init(region, handle_pages * PAGE_SIZE, config.handle_capacity)
        };
        let mut heap = Self {
            pages,
            regular: SegmentChain::new(),
            pinned: SegmentChain::new(),
            free_lists: FreeLists::new(),
            handles,
            frozen: FrozenRegistry::new(),
            external: ExternalHeaps::default(),
            descriptors: HashSet::new(),
            static_roots: Vec::new(),
            bounds: (0, 0),
            min_segment_pages: config.min_segment_pages.max(1),
            allocs_since_collect: 0,
            bytes_since_collect: 0,
        };
        heap.recompute_bounds();
        Ok(heap)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate and initialize one instance of `desc`.
    ///
    /// Returns null territory (`None`) only after a collection retry also
    /// failed.
    ///
    /// # Safety
    ///
    /// `desc` must be a valid compiler-emitted descriptor outside the
    /// managed region.
    pub unsafe fn allocate(
        &mut self,
        desc: *const TypeDesc,
        elements: u32,
        space: Space,
    ) -> Option<NonNull<u8>> {
        if desc.is_null() {
            return None;
        }
        // SAFETY: caller guarantees desc validity.
        let size = object::instance_size(unsafe { &*desc }, elements)?;
        // SAFETY: size >= MIN_OBJECT_SIZE per instance_size.
        let p = unsafe { self.allocate_cells_for(size, desc, elements, space)? };
        Some(p)
    }

    /// Allocate an instance of `desc` with an explicit byte size (variable
    /// sized types). The descriptor's own size fields are ignored.
    ///
    /// # Safety
    ///
    /// As for [`Self::allocate`].
    pub unsafe fn allocate_sized(
        &mut self,
        desc: *const TypeDesc,
        size: usize,
        space: Space,
    ) -> Option<NonNull<u8>> {
        if desc.is_null() {
            return None;
        }
        let size = object::align_size(size);
        // SAFETY: per contract.
        unsafe { self.allocate_cells_for(size, desc, 0, space) }
    }

    unsafe fn allocate_cells_for(
        &mut self,
        size: usize,
        desc: *const TypeDesc,
        elements: u32,
        space: Space,
    ) -> Option<NonNull<u8>> {
        self.descriptors.insert(desc as usize);
        let p = match self.alloc_cells(size, space) {
            Some(p) => p,
            None => {
                crate::gc::collect_locked(self);
                self.alloc_cells(size, space)?
            }
        };
        // SAFETY: p points at `size` writable bytes owned by this
        // allocation; headers are written before the pointer escapes.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0, size);
            object::init_header(p.as_ptr(), desc, elements);
        }
        self.allocs_since_collect += 1;
        self.bytes_since_collect += size;
        Some(p)
    }

    fn alloc_cells(&mut self, size: usize, space: Space) -> Option<NonNull<u8>> {
        match space {
            Space::Regular => self.alloc_regular(size),
            Space::Pinned => self.alloc_pinned(size),
            Space::Raw => self.alloc_raw(size),
        }
    }

    fn alloc_regular(&mut self, size: usize) -> Option<NonNull<u8>> {
        if let Some(p) = self.try_alloc_regular_no_grow(size) {
            return Some(p);
        }
        if crate::gc::should_collect_before_grow(self) {
            crate::gc::collect_locked(self);
            if let Some(p) = self.try_alloc_regular_no_grow(size) {
                return Some(p);
            }
        }
        let mut seg = self.grow(size, Space::Regular)?;
        // SAFETY: freshly grown segment.
        let p = unsafe { seg.as_mut() }.try_bump(size)?;
        self.regular.current = seg.as_ptr();
        Some(p)
    }

    fn try_alloc_regular_no_grow(&mut self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: listed blocks are formatted by sweep and splitting.
        if let Some((p, consumed)) = unsafe { self.free_lists.alloc(size) } {
            if let Some(mut seg) = self.segment_containing(p.as_ptr() as usize) {
                // SAFETY: the block's segment is a live chain node.
                unsafe { seg.as_mut().note_reuse(consumed) };
            }
            return Some(p);
        }
        self.regular.bump_alloc(size)
    }

    fn alloc_pinned(&mut self, size: usize) -> Option<NonNull<u8>> {
        if let Some(p) = self.pinned.bump_alloc(size) {
            return Some(p);
        }
        let mut seg = self.grow(size, Space::Pinned)?;
        // SAFETY: freshly grown segment.
        let p = unsafe { seg.as_mut() }.try_bump(size)?;
        self.pinned.current = seg.as_ptr();
        Some(p)
    }

    fn alloc_raw(&mut self, size: usize) -> Option<NonNull<u8>> {
        let pages = size.div_ceil(PAGE_SIZE);
        self.pages.alloc_pages(PageKind::RawObject, pages, true)
    }

    fn grow(&mut self, size: usize, space: Space) -> Option<NonNull<Segment>> {
        let kind = match space {
            Space::Regular => PageKind::HeapSegment,
            Space::Pinned => PageKind::PinnedSegment,
            Space::Raw => return None,
        };
        let pages = (size + SEGMENT_HEADER_SIZE)
            .div_ceil(PAGE_SIZE)
            .max(self.min_segment_pages);
        let base = self.pages.alloc_pages(kind, pages, true)?;
        // SAFETY: fresh page-aligned zeroed region.
        let seg = unsafe { Segment::init(base, pages * PAGE_SIZE) };
        match space {
            Space::Regular => self.regular.push_back(seg),
            Space::Pinned => self.pinned.push_back(seg),
            Space::Raw => unreachable!(),
        }
        self.recompute_bounds();
        #[cfg(feature = "tracing")]
        tracing::debug!(pages, kind = ?kind, "segment_grown");
        Some(seg)
    }

    // ------------------------------------------------------------------
    // Address classification
    // ------------------------------------------------------------------

    /// The segment (either chain) whose payload contains `addr`.
    pub(crate) fn segment_containing(&self, addr: usize) -> Option<NonNull<Segment>> {
        self.regular
            .iter()
            .chain(self.pinned.iter())
            // SAFETY: chain nodes are live segments.
            .find(|seg| unsafe { seg.as_ref() }.contains(addr))
    }

    /// Bounding box plus per-segment confirmation: is `addr` inside the
    /// collector's own heap (segments or the handle table)?
    #[must_use]
    pub fn is_in_gc_heap(&self, addr: usize) -> bool {
        if addr < self.bounds.0 || addr >= self.bounds.1 {
            return false;
        }
        if self.handles.contains_address(addr) {
            return true;
        }
        self.regular
            .iter()
            .chain(self.pinned.iter())
            // SAFETY: chain nodes are live segments.
            .any(|seg| unsafe {
                let s = seg.as_ref();
                addr >= s.base() && addr < s.region_end()
            })
    }

    /// Falsification predicate for descriptor candidates: no descriptor
    /// can live in collector-owned or externally swept pages.
    #[must_use]
    pub fn is_gc_address(&self, addr: usize) -> bool {
        if self.is_in_gc_heap(addr) {
            return true;
        }
        matches!(
            self.pages.run_kind_of(addr),
            PageKind::RawObject
                | PageKind::ExternalSmall
                | PageKind::ExternalMedium
                | PageKind::ExternalLarge
        )
    }

    /// Whether the allocator has ever seen `desc` at an entry point.
    pub(crate) fn is_known_descriptor(&self, desc: usize) -> bool {
        self.descriptors.contains(&desc)
    }

    /// Coarse classification of a conservative root candidate.
    pub(crate) fn classify_candidate(&self, addr: usize) -> Candidate {
        if addr == 0 || addr % object::WORD != 0 {
            return Candidate::Reject;
        }
        if self.frozen.contains(addr) {
            return Candidate::Frozen;
        }
        if self.handles.contains_address(addr) {
            return Candidate::Reject;
        }
        if addr >= self.bounds.0 && addr < self.bounds.1 {
            let in_walkable = self
                .regular
                .iter()
                .chain(self.pinned.iter())
                // SAFETY: chain nodes are live segments.
                .any(|seg| unsafe { seg.as_ref() }.contains_allocated(addr));
            return if in_walkable {
                // SAFETY: addr is non-null inside a mapped segment.
                Candidate::Object(unsafe { NonNull::new_unchecked(addr as *mut u8) })
            } else {
                Candidate::Reject
            };
        }
        match self.pages.run_kind_of(addr) {
            PageKind::RawObject
            | PageKind::ExternalSmall
            | PageKind::ExternalMedium
            | PageKind::ExternalLarge => {
                let base = self.pages.page_base_of(addr);
                match base {
                    Some(base) if base.as_ptr() as usize == addr => Candidate::Object(base.cast()),
                    _ => Candidate::Reject,
                }
            }
            _ => Candidate::Reject,
        }
    }

    // ------------------------------------------------------------------
    // Post-collection maintenance
    // ------------------------------------------------------------------

    /// Relink a chain as `[FULL..][SEMIFULL..][FREE..]`, returning empty
    /// multi-page segments to the page source, and repoint `last`.
    pub(crate) fn reorder_segments(&mut self, space: Space) {
        let head = match space {
            Space::Regular => self.regular.head,
            Space::Pinned => self.pinned.head,
            Space::Raw => return,
        };
        let mut full: Vec<NonNull<Segment>> = Vec::new();
        let mut semifull: Vec<NonNull<Segment>> = Vec::new();
        let mut free: Vec<NonNull<Segment>> = Vec::new();

        let mut cur = head;
        while let Some(seg) = NonNull::new(cur) {
            // SAFETY: chain nodes are live segments.
            let r = unsafe { seg.as_ref() };
            cur = r.next();
            match r.occupancy() {
                Occupancy::Full => full.push(seg),
                Occupancy::SemiFull => semifull.push(seg),
                Occupancy::Free => {
                    if r.total() > PAGE_SIZE {
                        // SAFETY: the segment is empty; nothing references
                        // its payload.
                        let base = unsafe { NonNull::new_unchecked(r.base() as *mut u8) };
                        self.pages.free(base);
                    } else {
                        free.push(seg);
                    }
                }
            }
        }

        let last = semifull.first().or(free.first()).copied();
        let ordered: Vec<NonNull<Segment>> =
            full.into_iter().chain(semifull).chain(free).collect();
        let mut head = std::ptr::null_mut();
        let mut prev: Option<NonNull<Segment>> = None;
        for seg in &ordered {
            match prev {
                // SAFETY: chain nodes are live segments.
                Some(mut p) => unsafe { p.as_mut().set_next(seg.as_ptr()) },
                None => head = seg.as_ptr(),
            }
            prev = Some(*seg);
        }
        if let Some(mut p) = prev {
            // SAFETY: chain nodes are live segments.
            unsafe { p.as_mut().set_next(std::ptr::null_mut()) };
        }

        let chain = match space {
            Space::Regular => &mut self.regular,
            Space::Pinned => &mut self.pinned,
            Space::Raw => unreachable!(),
        };
        chain.head = head;
        chain.last = last.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        chain.current = chain.last;
    }

    /// Recompute the `[heap_min, heap_max)` bounding box over every
    /// segment extent and the handle segment.
    pub(crate) fn recompute_bounds(&mut self) {
        let mut min = usize::MAX;
        let mut max = 0;
        for seg in self.regular.iter().chain(self.pinned.iter()) {
            // SAFETY: chain nodes are live segments.
            let r = unsafe { seg.as_ref() };
            min = min.min(r.base());
            max = max.max(r.region_end());
        }
        let (hbase, hlen) = self.handles.region();
        min = min.min(hbase);
        max = max.max(hbase + hlen);
        self.bounds = (min, max);
    }

    // ------------------------------------------------------------------
    // Registration and introspection
    // ------------------------------------------------------------------

    /// Register a static-root region (module statics emitted by the
    /// compiler); scanned conservatively at every collection.
    pub fn register_static_roots(&mut self, start: *const u8, len: usize) {
        self.static_roots.push((start as usize, len));
    }

    pub(crate) fn static_roots(&self) -> &[(usize, usize)] {
        &self.static_roots
    }

    /// Install the deallocation hook of an externally managed heap kind.
    /// Returns false for non-external kinds.
    pub fn register_external_heap(&mut self, kind: PageKind, free: ExternalFreeFn) -> bool {
        self.external.set(kind, free)
    }

    /// Hand an external heap a run of pages tagged with its kind.
    pub fn alloc_external_pages(&mut self, kind: PageKind, count: usize) -> Option<NonNull<u8>> {
        if !matches!(
            kind,
            PageKind::ExternalSmall | PageKind::ExternalMedium | PageKind::ExternalLarge
        ) {
            return None;
        }
        self.pages.alloc_pages(kind, count, true)
    }

    /// Make a descriptor known to candidate validation without going
    /// through an allocation entry point. External heaps and the producer
    /// register their type tables here at startup.
    pub fn register_descriptor(&mut self, desc: *const TypeDesc) {
        self.descriptors.insert(desc as usize);
    }

    /// Whether `addr` lies inside a registered frozen segment.
    #[must_use]
    pub fn frozen_contains(&self, addr: usize) -> bool {
        self.frozen.contains(addr)
    }

    /// Kind tag of the page containing `addr`.
    #[must_use]
    pub fn page_kind_of(&self, addr: usize) -> PageKind {
        self.pages.kind_of(addr)
    }

    /// Whether a free block starting at `addr` sits in any size-class
    /// list.
    #[must_use]
    pub fn free_list_contains(&self, addr: usize) -> bool {
        // SAFETY: listed blocks are maintained by sweep and splitting.
        unsafe { self.free_lists.contains(addr) }
    }

    /// Total bytes currently sitting in the free lists.
    #[must_use]
    pub fn free_list_bytes(&self) -> usize {
        // SAFETY: listed blocks are maintained by sweep and splitting.
        unsafe { self.free_lists.total_bytes() }
    }

    /// `[heap_min, heap_max)`.
    #[must_use]
    pub const fn bounds(&self) -> (usize, usize) {
        self.bounds
    }

    /// Total bytes held in segments of both chains.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.regular
            .iter()
            .chain(self.pinned.iter())
            // SAFETY: chain nodes are live segments.
            .map(|seg| unsafe { seg.as_ref() }.total())
            .sum()
    }

    /// Objects allocated since the last collection finished.
    #[must_use]
    pub const fn allocs_since_collect(&self) -> usize {
        self.allocs_since_collect
    }

    /// Bytes allocated since the last collection finished.
    #[must_use]
    pub const fn bytes_since_collect(&self) -> usize {
        self.bytes_since_collect
    }

    pub(crate) fn reset_alloc_counters(&mut self) {
        self.allocs_since_collect = 0;
        self.bytes_since_collect = 0;
    }

    /// Segment counts `(regular, pinned)`, for diagnostics and tests.
    #[must_use]
    pub fn segment_counts(&self) -> (usize, usize) {
        (self.regular.len(), self.pinned.len())
    }

    /// Whether every segment in both chains walks exactly to its bump
    /// cursor.
    #[must_use]
    pub fn verify_walkable(&self) -> bool {
        self.regular
            .iter()
            .chain(self.pinned.iter())
            // SAFETY: invariant holds between collections.
            .all(|seg| unsafe { seg.as_ref().verify_walkable() })
    }
}

// SAFETY: GcHeap owns all the raw memory it points into; access is
// serialized by the global lock.
unsafe impl Send for GcHeap {}

// ============================================================================
// Global state
// ============================================================================

static HEAP: Mutex<Option<GcHeap>> = Mutex::new(None);

/// Initialize the process-wide heap. Must run before any entry point.
///
/// # Errors
///
/// Propagates region reservation failures.
pub fn gc_init(config: GcConfig) -> io::Result<()> {
    let heap = GcHeap::new(config)?;
    *HEAP.lock() = Some(heap);
    Ok(())
}

/// Whether [`gc_init`] has run.
#[must_use]
pub fn is_initialized() -> bool {
    HEAP.lock().is_some()
}

/// Run `f` with exclusive access to the global heap.
///
/// # Panics
///
/// Panics when [`gc_init`] has not run.
pub fn with_heap<R>(f: impl FnOnce(&mut GcHeap) -> R) -> R {
    let mut guard = HEAP.lock();
    let heap = guard.as_mut().expect("gc_init must run before heap use");
    f(heap)
}

/// Like [`with_heap`], but `None` when [`gc_init`] has not run. The ABI
/// surface uses this so an uninitialized heap degrades to null returns.
pub fn try_with_heap<R>(f: impl FnOnce(&mut GcHeap) -> R) -> Option<R> {
    let mut guard = HEAP.lock();
    guard.as_mut().map(f)
}

/// Replace the global heap with a fresh one. Test isolation only.
#[doc(hidden)]
pub fn reinit_for_testing(config: GcConfig) {
    let heap = GcHeap::new(config).expect("failed to reserve test heap");
    *HEAP.lock() = Some(heap);
}
