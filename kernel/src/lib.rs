//! Rose Kernel Library
//!
//! Core of the Rose capability-based microkernel: physical and virtual
//! memory management, the per-core scheduler, the handle/token layer with
//! mailbox IPC, and the time subsystem. This library also exports the
//! pieces needed for host-side unit testing.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// On bare-metal targets use the kernel heap allocator; on the host target
// (for unit tests and coverage) delegate to the system allocator so test
// code using Vec/String/alloc compiles and runs normally.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global allocator
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod intrinsics;

pub mod arch;
pub mod boot_protocol;
pub mod bootstrap;
pub mod cap;
pub mod error;
pub mod ipc;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod smp;
pub mod sync;
pub mod syscall;
pub mod time;

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support;

// Re-export the address types and frame layer for tests and collaborators.
pub use mm::{PhysAddr, VirtAddr, PAGE_SIZES, PAGE_SIZE_COUNT};

/// Heap allocation error handler.
///
/// Heap allocation failure in a no_std kernel is unrecoverable; the
/// alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
