//! Conservative stack access.
//!
//! Spills the callee-saved registers onto the stack and walks every
//! pointer-sized word between the stack pointer and the stack base, so
//! values live only in registers at collection time are still seen. On a
//! kernel build the scheduler reports each thread's saved register file
//! and stack extent instead; this module covers the single-context case.

/// Bounds of the current thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// The base of the stack (highest address; the scan stops here).
    pub base: usize,
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
pub fn get_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: standard pthread attribute queries on the current thread.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        Some(StackBounds {
            base: stackaddr as usize + stacksize,
        })
    }
}

/// Stack bounds are unavailable here; the scan is skipped and roots come
/// from registered regions only.
#[cfg(any(not(target_os = "linux"), miri))]
pub fn get_stack_bounds() -> Option<StackBounds> {
    None
}

/// Spill callee-saved registers and feed every word between the current
/// stack pointer and the stack base to `scan_word`.
///
/// # Safety
///
/// Must run on the thread whose stack is scanned, with the heap lock held
/// so no frame below the caller mutates heap references concurrently.
#[inline(never)]
pub unsafe fn spill_registers_and_scan<F>(mut scan_word: F)
where
    F: FnMut(usize),
{
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    let mut regs = [0usize; 6];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: plain register reads into stack slots.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    std::hint::black_box(&regs);

    #[cfg(any(not(target_arch = "x86_64"), miri))]
    {
        let regs = [0usize; 32];
        std::hint::black_box(&regs);
    }

    let Some(bounds) = get_stack_bounds() else {
        return;
    };

    // A local's address approximates the stack pointer; the stack grows
    // down, so everything from here to the base is live frames.
    let sp = std::ptr::addr_of!(scan_word) as usize;
    let mut current = sp & !(std::mem::align_of::<usize>() - 1);

    while current < bounds.base {
        // SAFETY: current stays inside this thread's mapped stack.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        scan_word(word);
        current += std::mem::size_of::<usize>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_sees_a_stack_local() {
        let needle = 0x5A5A_F00D_4242_0000usize;
        let slot = std::hint::black_box(needle);
        let mut seen = false;
        unsafe {
            spill_registers_and_scan(|w| {
                if w == slot {
                    seen = true;
                }
            });
        }
        if get_stack_bounds().is_some() {
            assert!(seen);
        }
    }
}
