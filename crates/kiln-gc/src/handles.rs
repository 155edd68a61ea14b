//! The handle table.
//!
//! One dedicated segment holds a flat array of 24-byte slots referencing
//! heap objects from outside the heap (runtime data structures, interop).
//! A slot is empty exactly when its target is null. Handles are opaque
//! slot pointers; the table validates them before dereferencing so a stale
//! or fabricated handle degrades to a null read instead of corruption.

use std::ptr::NonNull;

/// Liveness semantics of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HandleKind {
    /// Does not keep its target alive; nulled when the target dies.
    Weak = 0,
    /// Keeps its target alive.
    Strong = 1,
    /// Keeps its target alive and forbids relocation.
    Pinned = 2,
    /// Target is weak; the secondary lives exactly as long as the target.
    Dependent = 3,
}

impl HandleKind {
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Weak),
            1 => Some(Self::Strong),
            2 => Some(Self::Pinned),
            3 => Some(Self::Dependent),
            _ => None,
        }
    }
}

/// One table slot.
#[repr(C)]
pub struct HandleSlot {
    /// Referenced object; null marks the slot empty.
    pub target: *mut u8,
    /// `HandleKind` as a word.
    pub kind: usize,
    /// Secondary object of a dependent handle.
    pub extra: *mut u8,
}

/// Slot size fixed by the table layout.
pub const HANDLE_SLOT_SIZE: usize = 24;

#[cfg(target_pointer_width = "64")]
const _: () = assert!(std::mem::size_of::<HandleSlot>() == HANDLE_SLOT_SIZE);

/// The flat slot array living in its own segment.
pub struct HandleTable {
    slots: NonNull<HandleSlot>,
    capacity: usize,
    region_base: usize,
    region_len: usize,
}

impl HandleTable {
    /// Build the table over a zeroed region of `region_len` bytes.
    ///
    /// # Safety
    ///
    /// The region must be writable, zero-filled, and live as long as the
    /// table.
    pub unsafe fn init(region: NonNull<u8>, region_len: usize, capacity: usize) -> Self {
        debug_assert!(capacity * HANDLE_SLOT_SIZE <= region_len);
        Self {
            slots: region.cast::<HandleSlot>(),
            capacity,
            region_base: region.as_ptr() as usize,
            region_len,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `addr` lies inside the table's segment. Used to reject
    /// table addresses as mark candidates.
    #[must_use]
    pub const fn contains_address(&self, addr: usize) -> bool {
        addr >= self.region_base && addr < self.region_base + self.region_len
    }

    /// `(base, len)` of the table's segment.
    #[must_use]
    pub const fn region(&self) -> (usize, usize) {
        (self.region_base, self.region_len)
    }

    /// Whether `h` is a real slot of this table.
    #[must_use]
    pub fn is_valid_handle(&self, h: NonNull<HandleSlot>) -> bool {
        let addr = h.as_ptr() as usize;
        if addr < self.region_base || (addr - self.region_base) % HANDLE_SLOT_SIZE != 0 {
            return false;
        }
        (addr - self.region_base) / HANDLE_SLOT_SIZE < self.capacity
    }

    fn slot_at(&self, index: usize) -> NonNull<HandleSlot> {
        debug_assert!(index < self.capacity);
        // SAFETY: index is in range, the region outlives self.
        unsafe { NonNull::new_unchecked(self.slots.as_ptr().add(index)) }
    }

    /// Claim the first empty slot. Null handle territory: returns `None`
    /// when every slot is occupied.
    pub fn alloc(
        &mut self,
        target: *mut u8,
        kind: HandleKind,
        extra: *mut u8,
    ) -> Option<NonNull<HandleSlot>> {
        for i in 0..self.capacity {
            let slot = self.slot_at(i);
            // SAFETY: slot is in range and exclusively ours under &mut.
            unsafe {
                if (*slot.as_ptr()).target.is_null() {
                    slot.as_ptr().write(HandleSlot {
                        target,
                        kind: kind as usize,
                        extra,
                    });
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Release a handle. A slot freed twice, or a foreign pointer, is a
    /// no-op.
    pub fn free(&mut self, h: NonNull<HandleSlot>) -> bool {
        if !self.is_valid_handle(h) {
            return false;
        }
        // SAFETY: validated slot, exclusive under &mut.
        unsafe {
            h.as_ptr().write(HandleSlot {
                target: std::ptr::null_mut(),
                kind: 0,
                extra: std::ptr::null_mut(),
            });
        }
        true
    }

    /// The handle's target; null for empty, freed, or invalid handles.
    #[must_use]
    pub fn get(&self, h: NonNull<HandleSlot>) -> *mut u8 {
        if !self.is_valid_handle(h) {
            return std::ptr::null_mut();
        }
        // SAFETY: validated slot.
        unsafe { (*h.as_ptr()).target }
    }

    /// Target and secondary of a dependent handle. `(null, null)` when the
    /// handle is invalid, empty, or not dependent.
    #[must_use]
    pub fn get_dependent(&self, h: NonNull<HandleSlot>) -> (*mut u8, *mut u8) {
        if !self.is_valid_handle(h) {
            return (std::ptr::null_mut(), std::ptr::null_mut());
        }
        // SAFETY: validated slot.
        let slot = unsafe { &*h.as_ptr() };
        if slot.target.is_null() || slot.kind != HandleKind::Dependent as usize {
            return (std::ptr::null_mut(), std::ptr::null_mut());
        }
        (slot.target, slot.extra)
    }

    /// Iterate the occupied slots.
    pub fn occupied(&self) -> impl Iterator<Item = (NonNull<HandleSlot>, HandleKind)> + '_ {
        (0..self.capacity).filter_map(|i| {
            let slot = self.slot_at(i);
            // SAFETY: slot is in range.
            let raw = unsafe { &*slot.as_ptr() };
            if raw.target.is_null() {
                return None;
            }
            HandleKind::from_raw(raw.kind).map(|kind| (slot, kind))
        })
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.occupied().count()
    }
}
