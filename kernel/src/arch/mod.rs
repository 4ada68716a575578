//! Architecture glue
//!
//! The saved CPU context, address-space switching, and the x86-64 device
//! layer (LAPIC, HPET, the AP trampoline). Only the pieces the portable
//! kernel needs are exposed here; everything register-level stays inside
//! [`x86_64`].

pub mod context;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

pub use context::Context;

use crate::mm::PhysAddr;

/// Switch the active address space by installing a new page-table root.
///
/// # Safety
/// `asid` must be a live page-table root whose upper half aliases the
/// kernel's, and the caller must be about to resume a thread that expects
/// exactly this address space.
pub unsafe fn set_asid(asid: PhysAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: writing CR3 with a valid root is the architectural address
    // space switch; the caller vouches for the root.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) asid.value(), options(nostack));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = asid;
    }
}

/// Page-table root of the currently active address space.
pub fn current_asid() -> PhysAddr {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
        }
        PhysAddr::new(cr3)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        crate::mm::kernel_root()
    }
}

/// Reload the current page-table root, flushing the local TLB.
pub fn flush_local_tlb() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: rewriting CR3 with its current value only drops cached
    // translations.
    unsafe {
        core::arch::asm!(
            "mov rax, cr3",
            "mov cr3, rax",
            out("rax") _,
            options(nostack)
        );
    }
}
