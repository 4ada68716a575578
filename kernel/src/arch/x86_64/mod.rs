//! x86-64 architecture layer
//!
//! LAPIC and HPET register access, the AP boot trampoline, and the
//! syscall MSR setup. Register-touching paths are bare-metal only; the
//! host builds see inert stubs so the portable kernel and its tests
//! compile unchanged.

pub mod hpet;
pub mod lapic;

#[cfg(target_os = "none")]
pub mod mp;

#[cfg(target_os = "none")]
mod syscall_entry;

/// Enable the `syscall`/`sysret` machinery on the calling core.
#[cfg(target_os = "none")]
pub fn init_syscalls() {
    syscall_entry::init();
}
