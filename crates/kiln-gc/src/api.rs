//! Runtime entry points.
//!
//! The surface the compiler's emitted code and the runtime glue link
//! against. Every failure is reported in-band: allocations and handle
//! creation return null, queries return null or zero. Nothing here
//! panics over heap conditions; an uninitialized heap degrades to null
//! returns the same way exhaustion does.

use std::ptr::NonNull;

use crate::desc::TypeDesc;
use crate::frozen::FrozenId;
use crate::handles::{HandleKind, HandleSlot};
use crate::heap::{try_with_heap, Space};

/// `alloc_with_flags`: route the allocation to the pinned heap.
pub const ALLOC_PINNED: u32 = 1 << 0;
/// `alloc_with_flags`: allocate a whole page run outside the segment
/// chains.
pub const ALLOC_RAW: u32 = 1 << 1;

fn out(p: Option<NonNull<u8>>) -> *mut u8 {
    p.map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Allocate a zero-initialized fixed-size instance of `desc`.
///
/// # Safety
///
/// `desc` must be a valid compiler-emitted descriptor.
pub unsafe extern "C" fn alloc_object_fast(desc: *const TypeDesc) -> *mut u8 {
    // SAFETY: per contract.
    out(try_with_heap(|h| unsafe { h.allocate(desc, 0, Space::Regular) }).flatten())
}

/// Allocate an array-shaped instance with `length` elements, header and
/// element count set.
///
/// # Safety
///
/// `desc` must be a valid compiler-emitted array descriptor.
pub unsafe extern "C" fn alloc_array(desc: *const TypeDesc, length: u32) -> *mut u8 {
    // SAFETY: per contract.
    out(try_with_heap(|h| unsafe { h.allocate(desc, length, Space::Regular) }).flatten())
}

/// String allocation entry; strings are array-shaped.
///
/// # Safety
///
/// As for [`alloc_array`].
pub unsafe extern "C" fn alloc_string(desc: *const TypeDesc, length: u32) -> *mut u8 {
    // SAFETY: per contract.
    unsafe { alloc_array(desc, length) }
}

/// Allocate `size` bytes carrying `desc`'s header, for variable-sized
/// types whose payload the runtime lays out itself.
///
/// # Safety
///
/// `desc` must be a valid compiler-emitted descriptor.
pub unsafe extern "C" fn alloc_variable_size(desc: *const TypeDesc, size: usize) -> *mut u8 {
    // SAFETY: per contract.
    out(try_with_heap(|h| unsafe { h.allocate_sized(desc, size, Space::Regular) }).flatten())
}

/// Allocate with placement flags; see `ALLOC_PINNED` and `ALLOC_RAW`.
///
/// # Safety
///
/// `desc` must be a valid compiler-emitted descriptor.
pub unsafe extern "C" fn alloc_with_flags(
    desc: *const TypeDesc,
    length: u32,
    flags: u32,
) -> *mut u8 {
    let space = if flags & ALLOC_RAW != 0 {
        Space::Raw
    } else if flags & ALLOC_PINNED != 0 {
        Space::Pinned
    } else {
        Space::Regular
    };
    // SAFETY: per contract.
    out(try_with_heap(|h| unsafe { h.allocate(desc, length, space) }).flatten())
}

/// Create a handle of `kind` referencing `object`. Null on exhaustion or
/// an unknown kind.
pub extern "C" fn handle_alloc(object: *mut u8, kind: u32) -> *mut HandleSlot {
    let Some(kind) = HandleKind::from_raw(kind as usize) else {
        return std::ptr::null_mut();
    };
    try_with_heap(|h| h.handles.alloc(object, kind, std::ptr::null_mut()))
        .flatten()
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Create a dependent handle: `secondary` lives exactly as long as
/// `primary`.
pub extern "C" fn handle_alloc_dependent(
    primary: *mut u8,
    secondary: *mut u8,
) -> *mut HandleSlot {
    try_with_heap(|h| h.handles.alloc(primary, HandleKind::Dependent, secondary))
        .flatten()
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Return a handle's slot to the table. Stale or foreign handles are
/// ignored.
pub extern "C" fn handle_free(handle: *mut HandleSlot) {
    if let Some(h) = NonNull::new(handle) {
        try_with_heap(|heap| heap.handles.free(h));
    }
}

/// The handle's referent; null for empty, freed, cleared, or invalid
/// handles.
pub extern "C" fn handle_get(handle: *mut HandleSlot) -> *mut u8 {
    NonNull::new(handle)
        .and_then(|h| try_with_heap(|heap| heap.handles.get(h)))
        .unwrap_or(std::ptr::null_mut())
}

/// Primary of a dependent handle; the secondary lands in `*secondary`
/// when that pointer is non-null. Both read as null once the primary has
/// been collected.
///
/// # Safety
///
/// `secondary`, when non-null, must be writable.
pub unsafe extern "C" fn handle_get_dependent(
    handle: *mut HandleSlot,
    secondary: *mut *mut u8,
) -> *mut u8 {
    let (primary, extra) = NonNull::new(handle)
        .and_then(|h| try_with_heap(|heap| heap.handles.get_dependent(h)))
        .unwrap_or((std::ptr::null_mut(), std::ptr::null_mut()));
    if !secondary.is_null() {
        // SAFETY: per contract.
        unsafe { secondary.write(extra) };
    }
    primary
}

/// Register a frozen read-only segment. Returns an opaque id, zero when
/// the heap is uninitialized.
pub extern "C" fn frozen_register(
    start: *mut u8,
    alloc_size: usize,
    commit_size: usize,
    reserved_size: usize,
) -> usize {
    try_with_heap(|h| {
        h.frozen
            .register(start as usize, alloc_size, commit_size, reserved_size)
            .to_raw()
    })
    .unwrap_or(0)
}

/// Update a frozen segment's allocated and committed sizes.
pub extern "C" fn frozen_update(id: usize, alloc_size: usize, commit_size: usize) {
    if let Some(id) = FrozenId::from_raw(id) {
        try_with_heap(|h| h.frozen.update(id, alloc_size, commit_size));
    }
}

/// Run one full collection; returns the number of objects freed.
pub extern "C" fn collect() -> usize {
    crate::gc::collect()
}
