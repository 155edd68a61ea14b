//! Size-classed free lists.
//!
//! Twelve classes at powers of two from 16 to 32768 bytes. Blocks larger
//! than the top bound are filed in the top class. The lists are cleared at
//! the start of every collection and rebuilt wholesale by sweep, so they
//! never have to be maintained across mutation.

use std::ptr::NonNull;

use crate::object::{self, FreeBlock, MIN_OBJECT_SIZE};

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Upper bound in bytes of size class `i`.
#[must_use]
pub const fn class_upper_bound(i: usize) -> usize {
    16 << i
}

/// Smallest class whose upper bound covers `size`; `None` when `size`
/// exceeds the top bound.
#[must_use]
pub fn class_index(size: usize) -> Option<usize> {
    (0..NUM_SIZE_CLASSES).find(|i| class_upper_bound(*i) >= size)
}

/// Class a free block of `size` bytes is filed under. Oversized blocks go
/// to the top class.
fn class_for_block(size: usize) -> usize {
    class_index(size).unwrap_or(NUM_SIZE_CLASSES - 1)
}

/// The per-class singly linked lists of free blocks.
pub struct FreeLists {
    heads: [*mut FreeBlock; NUM_SIZE_CLASSES],
}

impl FreeLists {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [std::ptr::null_mut(); NUM_SIZE_CLASSES],
        }
    }

    /// Drop every list. The blocks themselves stay formatted in place and
    /// are rediscovered by the next sweep.
    pub fn clear(&mut self) {
        self.heads = [std::ptr::null_mut(); NUM_SIZE_CLASSES];
    }

    /// Format `size` bytes at `at` as a free block and push it onto its
    /// class list.
    ///
    /// # Safety
    ///
    /// `at` must be writable for `size` bytes, pointer-aligned, with
    /// `size >= MIN_OBJECT_SIZE`, and must not alias a listed block.
    pub unsafe fn insert(&mut self, at: NonNull<u8>, size: u32) {
        let class = class_for_block(size as usize);
        // SAFETY: per contract.
        unsafe {
            object::format_free_block(at.as_ptr(), size, self.heads[class]);
        }
        self.heads[class] = at.as_ptr().cast::<FreeBlock>();
    }

    /// First-fit removal of a block serving `size` bytes, escalating
    /// through the classes. A block is taken only when it fits exactly or
    /// leaves a remainder big enough to stand alone, so the segment walk
    /// never meets a sub-minimum tail. Returns the block and its full
    /// size.
    ///
    /// # Safety
    ///
    /// Listed blocks must be validly formatted.
    unsafe fn take(&mut self, size: usize) -> Option<(NonNull<u8>, u32)> {
        let first = class_index(size).unwrap_or(NUM_SIZE_CLASSES - 1);
        for class in first..NUM_SIZE_CLASSES {
            let mut prev: *mut FreeBlock = std::ptr::null_mut();
            let mut cur = self.heads[class];
            while !cur.is_null() {
                // SAFETY: list nodes are valid free blocks per contract.
                let block = unsafe { &*cur };
                let b = block.size as usize;
                if b == size || b >= size + MIN_OBJECT_SIZE {
                    if prev.is_null() {
                        self.heads[class] = block.next;
                    } else {
                        // SAFETY: prev is a valid list node.
                        unsafe { (*prev).next = block.next };
                    }
                    let found = NonNull::new(cur.cast::<u8>())?;
                    return Some((found, block.size));
                }
                prev = cur;
                cur = block.next;
            }
        }
        None
    }

    /// Allocate `size` bytes from the lists, splitting off the remainder
    /// when the block is larger. Returns the block and the number of
    /// bytes actually consumed.
    ///
    /// # Safety
    ///
    /// Listed blocks must be validly formatted; `size` must be
    /// pointer-aligned and at least `MIN_OBJECT_SIZE`.
    pub unsafe fn alloc(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        debug_assert!(size >= MIN_OBJECT_SIZE && size % object::WORD == 0);
        // SAFETY: per contract.
        let (block, block_size) = unsafe { self.take(size)? };
        let remainder = block_size as usize - size;
        if remainder > 0 {
            debug_assert!(remainder >= MIN_OBJECT_SIZE);
            // SAFETY: the tail of the block is ours to reformat.
            unsafe {
                let tail = NonNull::new_unchecked(block.as_ptr().add(size));
                #[allow(clippy::cast_possible_truncation)]
                self.insert(tail, remainder as u32);
            }
        }
        Some((block, size))
    }

    /// Total bytes sitting in the lists.
    ///
    /// # Safety
    ///
    /// Listed blocks must be validly formatted.
    #[must_use]
    pub unsafe fn total_bytes(&self) -> usize {
        let mut total = 0;
        for head in self.heads {
            let mut cur = head;
            while !cur.is_null() {
                // SAFETY: per contract.
                let block = unsafe { &*cur };
                total += block.size as usize;
                cur = block.next;
            }
        }
        total
    }

    /// Whether any list contains a block starting at `addr`.
    ///
    /// # Safety
    ///
    /// Listed blocks must be validly formatted.
    #[must_use]
    pub unsafe fn contains(&self, addr: usize) -> bool {
        for head in self.heads {
            let mut cur = head;
            while !cur.is_null() {
                if cur as usize == addr {
                    return true;
                }
                // SAFETY: per contract.
                cur = unsafe { (*cur).next };
            }
        }
        false
    }

    /// Number of blocks in class `i`.
    ///
    /// # Safety
    ///
    /// Listed blocks must be validly formatted.
    #[must_use]
    pub unsafe fn class_len(&self, i: usize) -> usize {
        let mut n = 0;
        let mut cur = self.heads[i];
        while !cur.is_null() {
            n += 1;
            // SAFETY: per contract.
            cur = unsafe { (*cur).next };
        }
        n
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_bounds() {
        assert_eq!(class_upper_bound(0), 16);
        assert_eq!(class_upper_bound(11), 32768);
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(16), Some(0));
        assert_eq!(class_index(17), Some(1));
        assert_eq!(class_index(24), Some(1));
        assert_eq!(class_index(32768), Some(11));
        assert_eq!(class_index(32769), None);
    }

    fn block_arena(bytes: usize) -> (Vec<u8>, NonNull<u8>) {
        let mut buf = vec![0u8; bytes + 16];
        let addr = buf.as_mut_ptr() as usize;
        let aligned = (addr + 15) & !15;
        (buf, NonNull::new(aligned as *mut u8).unwrap())
    }

    #[test]
    fn insert_take_roundtrip() {
        let (_buf, base) = block_arena(256);
        let mut lists = FreeLists::new();
        unsafe {
            lists.insert(base, 64);
            assert!(lists.contains(base.as_ptr() as usize));
            assert_eq!(lists.total_bytes(), 64);

            let (p, consumed) = lists.alloc(64).unwrap();
            assert_eq!(p, base);
            assert_eq!(consumed, 64);
            assert_eq!(lists.total_bytes(), 0);
        }
    }

    #[test]
    fn split_refiles_the_remainder() {
        let (_buf, base) = block_arena(256);
        let mut lists = FreeLists::new();
        unsafe {
            lists.insert(base, 128);
            let (p, consumed) = lists.alloc(48).unwrap();
            assert_eq!(p, base);
            assert_eq!(consumed, 48);
            // 80-byte remainder sits in the 128-class.
            assert_eq!(lists.total_bytes(), 80);
            assert_eq!(lists.class_len(3), 1);
            assert!(lists.contains(base.as_ptr() as usize + 48));
        }
    }

    #[test]
    fn near_fit_blocks_are_passed_over() {
        let (_buf, base) = block_arena(256);
        let mut lists = FreeLists::new();
        unsafe {
            // 64 - 48 = 16 cannot stand alone as a block, so the request
            // must not carve this one up.
            lists.insert(base, 64);
            assert!(lists.alloc(48).is_none());

            // An exact fit is taken whole.
            let (p, consumed) = lists.alloc(64).unwrap();
            assert_eq!(p, base);
            assert_eq!(consumed, 64);
        }
    }

    #[test]
    fn escalates_to_larger_classes() {
        let (_buf, base) = block_arena(1024);
        let mut lists = FreeLists::new();
        unsafe {
            lists.insert(base, 512);
            // A 24-byte request starts at class 1 and must escalate.
            let (p, _) = lists.alloc(24).unwrap();
            assert_eq!(p, base);
        }
    }

    #[test]
    fn skips_blocks_smaller_than_the_request() {
        let (_buf, base) = block_arena(512);
        let mut lists = FreeLists::new();
        unsafe {
            // Both blocks land in the 128-class; only the second fits.
            lists.insert(base, 72);
            let second = NonNull::new_unchecked(base.as_ptr().add(128));
            lists.insert(second, 128);
            let (p, _) = lists.alloc(96).unwrap();
            assert_eq!(p, second);
            assert!(lists.contains(base.as_ptr() as usize));
            // The 32-byte remainder of the second block was refiled.
            assert!(lists.contains(second.as_ptr() as usize + 96));
        }
    }

    #[test]
    fn clear_drops_everything() {
        let (_buf, base) = block_arena(128);
        let mut lists = FreeLists::new();
        unsafe {
            lists.insert(base, 64);
            lists.clear();
            assert!(lists.alloc(32).is_none());
            assert_eq!(lists.total_bytes(), 0);
        }
    }
}
