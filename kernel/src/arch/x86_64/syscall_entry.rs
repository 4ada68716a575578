//! syscall/sysret plumbing
//!
//! Programs the syscall MSRs on the calling core and provides the
//! assembly stub that captures the register file into a
//! [`crate::syscall::SyscallFrame`], calls the dispatcher, and resumes
//! whichever thread is current afterwards.

use crate::arch::context::{KERNEL_CS, USER_CS};
use crate::intrinsics;
use crate::mm::{self, page_table, pmm, PAGE_SIZES};

const IA32_EFER: u32 = 0xc000_0080;
const IA32_STAR: u32 = 0xc000_0081;
const IA32_LSTAR: u32 = 0xc000_0082;
const IA32_SFMASK: u32 = 0xc000_0084;

core::arch::global_asm!(
    r#"
    .global syscall_handler_stub
syscall_handler_stub:
    // Per the frame layout: push the register file, hand the dispatcher
    // a pointer to it, then unwind whatever thread is now current.
    push rax
    push rbx
    push rcx          // user rip
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11          // user rflags
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call syscall_dispatch_entry
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    sysretq
"#
);

extern "C" {
    fn syscall_handler_stub();
}

/// Map a kernel syscall stack (with a guard page at the bottom) and
/// program EFER/STAR/LSTAR on this core.
pub fn init() {
    let stack_pages = 32;
    let stack = mm::allocate_address_range(stack_pages * PAGE_SIZES[0]);
    for page in 1..stack_pages {
        page_table::map_physical(
            mm::kernel_root(),
            stack.offset((page * PAGE_SIZES[0]) as u64),
            stack.offset(((page + 1) * PAGE_SIZES[0]) as u64),
            pmm::pop(0),
            page_table::MapFlags::empty(),
        );
    }

    // SAFETY: standard syscall MSR setup; the stub address is live for
    // the kernel's lifetime.
    unsafe {
        intrinsics::wrmsr(IA32_EFER, intrinsics::rdmsr(IA32_EFER) | 1);
        intrinsics::wrmsr(
            IA32_STAR,
            ((KERNEL_CS as u64) << 32) | (((USER_CS as u64 - 16) | 3) << 48),
        );
        intrinsics::wrmsr(IA32_LSTAR, syscall_handler_stub as usize as u64);
        // Mask IF on entry; the dispatcher re-enables once on the
        // kernel stack.
        intrinsics::wrmsr(IA32_SFMASK, 0x200);
    }
}
