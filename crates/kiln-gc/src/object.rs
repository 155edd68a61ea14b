//! Object header codec and the free-block format.
//!
//! Every managed object begins with one pointer-sized word holding its
//! descriptor pointer; descriptors are aligned, so bit 0 doubles as the
//! mark flag. Array-shaped instances carry a 32-bit element count in the
//! next four bytes. Dead space is reformatted in place into free blocks
//! that walk exactly like objects: a process-wide sentinel descriptor
//! address, a 32-bit total size, and a next pointer threading the block
//! into its size-class list.

use crate::desc::TypeDesc;

/// Pointer size in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Smallest allocatable unit. Large enough for a free block, so the sweep
/// walker cannot tell live and dead entries apart before reading the
/// header word.
pub const MIN_OBJECT_SIZE: usize = 24;

const MARK_BIT: usize = 1;

/// Byte offset of the element-count field.
pub const COUNT_OFFSET: usize = WORD;

// The one descriptor address that never belongs to a real type. Its
// address, not its contents, is the free marker.
static FREE_SENTINEL: TypeDesc = TypeDesc {
    base_size: 0,
    component_size: 0,
    flags: 0,
};

/// Address of the process-wide free-block sentinel descriptor.
#[must_use]
pub fn free_sentinel() -> usize {
    &raw const FREE_SENTINEL as usize
}

/// Dead space formatted to be walkable like an object.
#[repr(C)]
pub struct FreeBlock {
    /// Always the free sentinel address.
    pub header: usize,
    /// Total block size in bytes, header included.
    pub size: u32,
    _pad: u32,
    /// Next block in the same size class.
    pub next: *mut FreeBlock,
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(std::mem::size_of::<FreeBlock>() == MIN_OBJECT_SIZE);

/// Write a free block over `at`. `size` covers the whole block.
///
/// # Safety
///
/// `at` must be writable for `size` bytes and `size >= MIN_OBJECT_SIZE`.
pub unsafe fn format_free_block(at: *mut u8, size: u32, next: *mut FreeBlock) {
    debug_assert!(size as usize >= MIN_OBJECT_SIZE);
    // SAFETY: caller guarantees the range.
    unsafe {
        at.cast::<FreeBlock>().write(FreeBlock {
            header: free_sentinel(),
            size,
            _pad: 0,
            next,
        });
    }
}

/// Read the raw header word.
///
/// # Safety
///
/// `obj` must point to a readable header word.
#[must_use]
pub unsafe fn header_word(obj: *const u8) -> usize {
    // SAFETY: caller guarantees readability.
    unsafe { obj.cast::<usize>().read() }
}

/// Whether the entry at `obj` is a free block.
///
/// # Safety
///
/// `obj` must point to a readable header word.
#[must_use]
pub unsafe fn is_free_block(obj: *const u8) -> bool {
    // SAFETY: per contract.
    unsafe { header_word(obj) == free_sentinel() }
}

/// Initialize a fresh object header. Clears the mark bit.
///
/// # Safety
///
/// `obj` must be writable for at least `MIN_OBJECT_SIZE` bytes and `desc`
/// must be aligned so that bit 0 is clear.
pub unsafe fn init_header(obj: *mut u8, desc: *const TypeDesc, elements: u32) {
    debug_assert_eq!(desc as usize & MARK_BIT, 0);
    // SAFETY: per contract.
    unsafe {
        obj.cast::<usize>().write(desc as usize);
        if (*desc).has_component_size() {
            obj.add(COUNT_OFFSET).cast::<u32>().write(elements);
        }
    }
}

/// The object's descriptor, mark bit masked off.
///
/// # Safety
///
/// `obj` must point to a readable header word.
#[must_use]
pub unsafe fn descriptor_of(obj: *const u8) -> *const TypeDesc {
    // SAFETY: per contract.
    unsafe { (header_word(obj) & !MARK_BIT) as *const TypeDesc }
}

/// # Safety
///
/// `obj` must point to a readable header word.
#[must_use]
pub unsafe fn is_marked(obj: *const u8) -> bool {
    // SAFETY: per contract.
    unsafe { header_word(obj) & MARK_BIT != 0 }
}

/// Set the mark bit. Idempotent.
///
/// # Safety
///
/// `obj` must point to a writable object header.
pub unsafe fn mark(obj: *mut u8) {
    // SAFETY: per contract.
    unsafe {
        let w = header_word(obj);
        obj.cast::<usize>().write(w | MARK_BIT);
    }
}

/// Clear the mark bit.
///
/// # Safety
///
/// `obj` must point to a writable object header.
pub unsafe fn unmark(obj: *mut u8) {
    // SAFETY: per contract.
    unsafe {
        let w = header_word(obj);
        obj.cast::<usize>().write(w & !MARK_BIT);
    }
}

/// The element count of an array-shaped instance.
///
/// Only meaningful for types whose descriptor has a component size.
///
/// # Safety
///
/// `obj` must point to a readable object at least `MIN_OBJECT_SIZE` long.
#[must_use]
pub unsafe fn element_count(obj: *const u8) -> u32 {
    // SAFETY: per contract.
    unsafe { obj.add(COUNT_OFFSET).cast::<u32>().read() }
}

/// Total size in bytes of an instance of `desc` with `elements` array
/// elements, rounded to pointer alignment with the minimum enforced.
/// `None` when the size computation overflows.
#[must_use]
pub fn instance_size(desc: &TypeDesc, elements: u32) -> Option<usize> {
    let base = desc.base_size as usize;
    let size = if desc.has_component_size() {
        let payload = (desc.component_size as usize).checked_mul(elements as usize)?;
        base.checked_add(payload)?
    } else {
        base
    };
    Some(align_size(size))
}

/// Round a request up to pointer alignment and the minimum object size.
#[must_use]
pub const fn align_size(size: usize) -> usize {
    let aligned = (size + WORD - 1) & !(WORD - 1);
    if aligned < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        aligned
    }
}

/// Size in bytes of the (live) object at `obj`, derived from its header.
///
/// # Safety
///
/// `obj` must be a valid object with a readable descriptor.
#[must_use]
pub unsafe fn object_size(obj: *const u8) -> usize {
    // SAFETY: per contract.
    unsafe {
        let desc = &*descriptor_of(obj);
        let elements = if desc.has_component_size() {
            element_count(obj)
        } else {
            0
        };
        instance_size(desc, elements).unwrap_or(MIN_OBJECT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::DescBuilder;

    #[test]
    fn mark_roundtrip_is_idempotent() {
        let d = DescBuilder::object(32).build();
        let mut buf = [0u8; 32];
        let obj = buf.as_mut_ptr();
        unsafe {
            init_header(obj, d, 0);
            assert!(!is_marked(obj));
            assert_eq!(descriptor_of(obj), std::ptr::from_ref(d));

            mark(obj);
            mark(obj);
            assert!(is_marked(obj));
            assert_eq!(descriptor_of(obj), std::ptr::from_ref(d));

            unmark(obj);
            assert!(!is_marked(obj));
        }
    }

    #[test]
    fn array_header_carries_element_count() {
        let d = DescBuilder::array(16, 8).build();
        let mut buf = [0u8; 64];
        let obj = buf.as_mut_ptr();
        unsafe {
            init_header(obj, d, 5);
            assert_eq!(element_count(obj), 5);
            assert_eq!(object_size(obj), 16 + 5 * 8);
        }
    }

    #[test]
    fn instance_size_rounds_and_clamps() {
        let small = DescBuilder::object(8).build();
        assert_eq!(instance_size(small, 0), Some(MIN_OBJECT_SIZE));

        let odd = DescBuilder::object(33).build();
        assert_eq!(instance_size(odd, 0), Some(40));

        let arr = DescBuilder::array(16, 24).build();
        assert_eq!(instance_size(arr, 3), Some(16 + 72));
    }

    #[test]
    fn free_block_walks_like_an_object() {
        let mut buf = [0u8; 48];
        let at = buf.as_mut_ptr();
        unsafe {
            format_free_block(at, 48, std::ptr::null_mut());
            assert!(is_free_block(at));
            let block = &*at.cast::<FreeBlock>();
            assert_eq!(block.size, 48);
            assert!(block.next.is_null());
        }
    }
}
