//! Interrupt masking seam.
//!
//! Collection is stop-the-world by masking interrupts for its full
//! duration. The kernel wires the real disable/enable pair in at boot;
//! the default backend models the interrupt flag with an atomic so hosted
//! builds and tests observe the same protocol.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

/// Disable interrupts; returns whether they were enabled before the call.
pub type DisableFn = fn() -> bool;
/// Re-enable interrupts.
pub type EnableFn = fn();

static CONTROLLER: RwLock<Option<(DisableFn, EnableFn)>> = RwLock::new(None);

static HOST_MASKED: AtomicBool = AtomicBool::new(false);

fn host_disable() -> bool {
    !HOST_MASKED.swap(true, Ordering::AcqRel)
}

fn host_enable() {
    HOST_MASKED.store(false, Ordering::Release);
}

/// Install the platform's interrupt controller. Replaces the default
/// host backend.
pub fn set_controller(disable: DisableFn, enable: EnableFn) {
    *CONTROLLER.write() = Some((disable, enable));
}

/// Whether the default host backend currently has interrupts masked.
/// Meaningful only while no platform controller is installed.
#[must_use]
pub fn host_masked() -> bool {
    HOST_MASKED.load(Ordering::Acquire)
}

/// Masks interrupts for its lifetime. Re-enables on drop only when this
/// guard performed the transition, so nesting behaves like the hardware
/// flag.
pub struct IntGuard {
    restore: bool,
    enable: EnableFn,
}

/// Disable interrupts until the returned guard is dropped.
#[must_use]
pub fn disable() -> IntGuard {
    let controller = *CONTROLLER.read();
    let (disable, enable) =
        controller.unwrap_or((host_disable as DisableFn, host_enable as EnableFn));
    IntGuard {
        restore: disable(),
        enable,
    }
}

impl Drop for IntGuard {
    fn drop(&mut self) {
        if self.restore {
            (self.enable)();
        }
    }
}
