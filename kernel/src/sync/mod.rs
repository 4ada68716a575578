//! Kernel synchronization primitives
//!
//! Everything here is a thin layer over atomics: short-lived spin
//! primitives that are never held across a suspension point.

mod once_lock;
mod shared_lock;

pub use once_lock::OnceLock;
pub use shared_lock::SharedLock;

use crate::intrinsics;

/// RAII interrupt gate.
///
/// Disables maskable interrupts for the guard's lifetime and restores the
/// previous state on drop. Wrapped around any lock that is also taken from
/// interrupt context (the process handle table, the timer heap), so a
/// timer callback can never deadlock against the thread it interrupted.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = intrinsics::interrupts_enabled();
        // SAFETY: the matching Drop restores the interrupt flag.
        unsafe { intrinsics::cli() };
        Self { was_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            // SAFETY: interrupts were enabled when the guard was taken, and
            // by the guard's contract no interrupt-context lock is held here.
            unsafe { intrinsics::sti() };
        }
    }
}
