//! Saved CPU context
//!
//! Every thread owns one of these; the syscall and interrupt glue saves
//! the live register file into it on suspension and reloads it on
//! dispatch. `can_sysret` records whether the thread last entered the
//! kernel through `syscall` (resume via `sysret`) or through an
//! interrupt gate (resume via `iretq`).

/// User code segment selector (ring 3).
pub const USER_CS: u16 = 0x1b;
/// User data/stack segment selector (ring 3).
pub const USER_SS: u16 = 0x23;
/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_SS: u16 = 0x10;

/// RFLAGS with the interrupt-enable bit set and reserved bit 1 high.
const RFLAGS_DEFAULT: u64 = 0x202;

/// General registers plus control state, in the layout the assembly glue
/// expects.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cs: u16,
    pub ss: u16,
    /// Whether the thread may be resumed with `sysret` (true) or needs a
    /// full `iretq` frame (false).
    pub can_sysret: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            rsp: 0,
            rflags: RFLAGS_DEFAULT,
            cs: KERNEL_CS,
            ss: KERNEL_SS,
            can_sysret: false,
        }
    }
}

impl Context {
    /// Context for a fresh user thread: entry point, stack top, and one
    /// argument register, running in ring 3.
    pub fn user_entry(entry: u64, stack_top: u64, argument: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            rdi: argument,
            cs: USER_CS,
            ss: USER_SS,
            rflags: RFLAGS_DEFAULT,
            can_sysret: true,
            ..Self::default()
        }
    }

    /// Context for a kernel-mode thread (the per-core idle threads).
    pub fn kernel_entry(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            ..Self::default()
        }
    }
}
