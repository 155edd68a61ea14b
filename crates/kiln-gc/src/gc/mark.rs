//! The mark engine.
//!
//! An explicit worklist drives the traversal. Every candidate address
//! runs the same gauntlet: classify against the heap's spaces, then
//! falsify the header's descriptor word. Candidates that survive are
//! marked and, when their type carries reference fields, pushed for field
//! enumeration through the pointer-series map.

use std::ptr::NonNull;

use crate::desc::{self, TypeDesc};
use crate::heap::{Candidate, GcHeap};
use crate::object;

/// Single-collection marking state.
pub(crate) struct Marker<'h> {
    heap: &'h GcHeap,
    worklist: Vec<NonNull<u8>>,
    marked: usize,
}

impl<'h> Marker<'h> {
    pub(crate) fn new(heap: &'h GcHeap) -> Self {
        Self {
            heap,
            worklist: Vec::new(),
            marked: 0,
        }
    }

    pub(crate) const fn heap(&self) -> &'h GcHeap {
        self.heap
    }

    /// Objects marked so far.
    pub(crate) const fn marked_count(&self) -> usize {
        self.marked
    }

    /// Feed one candidate word through classification and validation.
    /// Marking is idempotent; anything that fails a check is silently
    /// dropped.
    pub(crate) fn consider(&mut self, addr: usize) {
        match self.heap.classify_candidate(addr) {
            Candidate::Object(obj) => self.validate_and_mark(obj),
            // Frozen objects are always live and reference only frozen
            // objects; traversal stops cleanly here.
            Candidate::Frozen | Candidate::Reject => {}
        }
    }

    /// Whether `obj` is live (marked, or frozen and thus always live).
    /// Used for the dependent-handle fixpoint.
    pub(crate) fn is_live(&self, addr: usize) -> bool {
        match self.heap.classify_candidate(addr) {
            // SAFETY: classified object starts have readable headers.
            Candidate::Object(obj) => unsafe { object::is_marked(obj.as_ptr()) },
            Candidate::Frozen => true,
            Candidate::Reject => false,
        }
    }

    fn validate_and_mark(&mut self, obj: NonNull<u8>) {
        // SAFETY: classification confirmed obj lies in mapped heap memory.
        let word = unsafe { object::header_word(obj.as_ptr()) };
        let already_marked = word & 1 != 0;
        let d = word & !1;

        if d == 0 || d == object::free_sentinel() || d % object::WORD != 0 {
            return;
        }
        // A descriptor cannot live inside the collector's own pages.
        if self.heap.is_gc_address(d) {
            return;
        }
        if !self.heap.is_known_descriptor(d) {
            return;
        }
        // SAFETY: known descriptors point at live producer metadata.
        if !unsafe { desc::sanity_check(d as *const TypeDesc) } {
            return;
        }
        if already_marked {
            return;
        }

        // SAFETY: obj passed validation; the header is ours to tag.
        unsafe { object::mark(obj.as_ptr()) };
        self.marked += 1;

        // SAFETY: d was validated above.
        if unsafe { &*(d as *const TypeDesc) }.contains_gc_pointers() {
            self.worklist.push(obj);
        }
    }

    /// Drain the worklist, enumerating reference fields of each marked
    /// object and feeding them back through `consider`.
    pub(crate) fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            // SAFETY: worklist entries are validated marked objects.
            unsafe {
                let d = object::descriptor_of(obj.as_ptr());
                let size = object::object_size(obj.as_ptr());
                let elements = if (*d).has_component_size() {
                    object::element_count(obj.as_ptr())
                } else {
                    0
                };
                for span in desc::pointer_spans(d, size, elements) {
                    for i in 0..span.count {
                        let slot = obj.as_ptr().add(span.offset + i * object::WORD);
                        let field = slot.cast::<usize>().read();
                        if field != 0 {
                            self.consider(field);
                        }
                    }
                }
            }
        }
    }
}
