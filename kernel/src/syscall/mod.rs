//! Syscall dispatch
//!
//! The architecture stub hands over the saved register file; dispatch
//! resolves the syscall number, marshals arguments (plain values, handle
//! tokens, validated pointers), invokes the typed handler, and stores
//! the result code in the return register. If the handler switched the
//! current thread, the frame is reloaded from the incoming thread's
//! context before returning to the stub.
//!
//! Register convention: the syscall number rides in `rax`, arguments in
//! `rdi`, `rsi`, `r8`, `r9`, `r10`, `r12` in declared order, and the
//! result code returns in `rax`. `rcx` and `r11` are the return address
//! and flags, `rdx` carries the user stack pointer.

pub mod abi;
pub mod handlers;
mod userptr;

pub use abi::{SysResult, SyscallNumber};

use alloc::sync::Arc;

use crate::arch::context::{Context, USER_CS, USER_SS};
use crate::process::Process;
use crate::sched;

/// The register file as the syscall stub saves it (reverse push order).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallFrame {
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
}

impl SyscallFrame {
    /// Save this frame into a suspended thread's context. The thread
    /// entered via `syscall`, so `rcx`/`rdx`/`r11` hold its return rip,
    /// stack, and flags.
    pub fn save_to(&self, context: &mut Context) {
        context.r15 = self.r15;
        context.r14 = self.r14;
        context.r13 = self.r13;
        context.r12 = self.r12;
        context.r11 = self.r11;
        context.r10 = self.r10;
        context.r9 = self.r9;
        context.r8 = self.r8;
        context.rbp = self.rbp;
        context.rdi = self.rdi;
        context.rsi = self.rsi;
        context.rdx = self.rdx;
        context.rcx = self.rcx;
        context.rbx = self.rbx;
        context.rax = self.rax;

        context.rip = self.rcx;
        context.rsp = self.rdx;
        context.rflags = self.r11;
        context.cs = USER_CS;
        context.ss = USER_SS;
        context.can_sysret = true;
    }

    /// Load a thread's context into this frame for the stub to resume.
    pub fn load_from(&mut self, context: &Context) {
        self.r15 = context.r15;
        self.r14 = context.r14;
        self.r13 = context.r13;
        self.r12 = context.r12;
        self.r10 = context.r10;
        self.r9 = context.r9;
        self.r8 = context.r8;
        self.rbp = context.rbp;
        self.rdi = context.rdi;
        self.rsi = context.rsi;
        self.rbx = context.rbx;
        self.rax = context.rax;

        self.rcx = if context.can_sysret {
            context.rip
        } else {
            context.rcx
        };
        self.rdx = if context.can_sysret {
            context.rsp
        } else {
            context.rdx
        };
        self.r11 = if context.can_sysret {
            context.rflags
        } else {
            context.r11
        };
    }
}

/// C entry point called by the assembly stub.
///
/// # Safety
/// `frame` must point at the register file the stub just pushed, and
/// stays valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn syscall_dispatch_entry(frame: *mut SyscallFrame) {
    // SAFETY: per this function's contract.
    dispatch(unsafe { &mut *frame });
}

/// Full dispatch against the calling thread's process, including the
/// thread-switch tail.
pub fn dispatch(frame: &mut SyscallFrame) {
    let previous = sched::try_current_thread();

    let result = match &previous {
        Some(thread) => dispatch_for(thread.process(), frame),
        None => SysResult::InvalidSyscall,
    };
    frame.rax = result as u64;

    // A handler may have parked the calling thread; resume whoever is
    // current now.
    let current = sched::try_current_thread();
    if let (Some(previous), Some(current)) = (previous, current) {
        if !Arc::ptr_eq(&previous, &current) {
            frame.save_to(&mut previous.context().lock());
            frame.load_from(&current.context().lock());
        }
    }
}

/// Route one syscall frame against an explicit process. The marshalling
/// half of dispatch, separated so it can be exercised directly.
pub fn dispatch_for(process: &Arc<Process>, frame: &mut SyscallFrame) -> SysResult {
    let Ok(number) = SyscallNumber::try_from(frame.rax) else {
        return SysResult::InvalidSyscall;
    };

    match number {
        SyscallNumber::VasCreate => handlers::rose_vas_create(process, frame.rdi, frame.rsi),
        SyscallNumber::MappingCreate => handlers::rose_mapping_create(
            process, frame.rdi, frame.rsi, frame.r8, frame.r9, frame.r10,
        ),
        SyscallNumber::MappingDestroy => handlers::rose_mapping_destroy(process, frame.rdi),
        SyscallNumber::VmoCreate => handlers::rose_vmo_create(process, frame.rdi, frame.rsi),
        SyscallNumber::ProcessCreate => {
            handlers::rose_process_create(process, frame.rdi, frame.rsi)
        }
        SyscallNumber::ProcessStart => handlers::rose_process_start(
            process, frame.rdi, frame.rsi, frame.r8, frame.r9,
        ),
        SyscallNumber::MailboxCreate => handlers::rose_mailbox_create(process, frame.rdi),
        SyscallNumber::MailboxWrite => {
            handlers::rose_mailbox_write(process, frame.rdi, frame.rsi)
        }
        SyscallNumber::MailboxRead => {
            handlers::rose_mailbox_read(process, frame.rdi, frame.rsi, frame.r8)
        }
        SyscallNumber::TokenRelease => handlers::rose_token_release(process, frame.rdi),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::page_table::MapFlags;
    use crate::mm::vas::Vas;
    use crate::mm::vmo::Vmo;
    use crate::mm::{VirtAddr, PAGE_SIZES};
    use crate::test_support;

    /// A process with one identity-mapped arena page for user pointers.
    fn syscall_process() -> (Arc<Process>, u64) {
        test_support::ensure_global_frames();
        let _pmm = test_support::lock_pmm();

        let page = test_support::alloc_arena(PAGE_SIZES[0], PAGE_SIZES[0]);
        let vas = Vas::create(false);
        vas.map_vmo(
            Vmo::create_physical(page, PAGE_SIZES[0], 0),
            VirtAddr::new(page.value()),
            MapFlags::USER,
        );
        let process = Process::create(vas).expect("fresh VAS should be claimable");
        (process, page.value())
    }

    fn read_u64(addr: u64) -> u64 {
        // SAFETY: test addresses point into the identity arena page.
        unsafe { (addr as *const u64).read_volatile() }
    }

    #[test]
    fn unknown_syscall_numbers_are_rejected() {
        let (process, _) = syscall_process();

        let mut frame = SyscallFrame {
            rax: 999,
            ..Default::default()
        };
        assert_eq!(
            dispatch_for(&process, &mut frame),
            SysResult::InvalidSyscall
        );
    }

    #[test]
    fn vas_create_returns_a_token_and_vdso_info() {
        let (process, page) = syscall_process();

        let token_out = page;
        let info_out = page + 8;
        let mut frame = SyscallFrame {
            rax: SyscallNumber::VasCreate as u64,
            rdi: token_out,
            rsi: info_out,
            ..Default::default()
        };

        let _pmm = test_support::lock_pmm();
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);

        let token = read_u64(token_out);
        assert_ne!(token, 0);

        let handle = process
            .get_handle(token)
            .expect("issued token should resolve");
        let vas = handle.as_vas().expect("token should name a VAS");

        let reported_base = read_u64(info_out);
        assert_eq!(vas.vdso_base().map(|b| b.value()), Some(reported_base));
        assert_eq!(reported_base % 8, 0);
        assert!(reported_base > 0x4000_0000_0000);
    }

    #[test]
    fn tokens_are_type_and_permission_checked() {
        let (process, page) = syscall_process();

        // A mailbox token used where a VAS is expected.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MailboxCreate as u64,
            rdi: page,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        let mailbox_token = read_u64(page);

        let mut frame = SyscallFrame {
            rax: SyscallNumber::MappingCreate as u64,
            rdi: mailbox_token,
            rsi: mailbox_token,
            r8: 0x4000_0000,
            r9: 0,
            r10: page,
            ..Default::default()
        };
        assert_eq!(
            dispatch_for(&process, &mut frame),
            SysResult::WrongHandleType
        );

        // An unknown token.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MappingDestroy as u64,
            rdi: 0x1234_5678,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::InvalidToken);
    }

    #[test]
    fn token_release_drops_exactly_one_registration() {
        let (process, page) = syscall_process();

        let mut frame = SyscallFrame {
            rax: SyscallNumber::MailboxCreate as u64,
            rdi: page,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        let token = read_u64(page);

        // Token 0 is always accepted and a no-op.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::TokenRelease as u64,
            rdi: 0,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);

        let mut frame = SyscallFrame {
            rax: SyscallNumber::TokenRelease as u64,
            rdi: token,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);

        // Releasing again: the token is gone.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::TokenRelease as u64,
            rdi: token,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::InvalidToken);
    }

    #[test]
    fn bad_out_pointers_fail_before_side_effects() {
        let (process, _page) = syscall_process();

        let mut frame = SyscallFrame {
            rax: SyscallNumber::VmoCreate as u64,
            rdi: PAGE_SIZES[0] as u64,
            rsi: 0x40, // not mapped
            ..Default::default()
        };
        assert_eq!(
            dispatch_for(&process, &mut frame),
            SysResult::InvalidPointers
        );
    }

    #[test]
    fn frame_context_round_trip_follows_the_sysret_convention() {
        let mut frame = SyscallFrame {
            rcx: 0x4000_1000, // user rip
            rdx: 0x7fff_0000, // user rsp
            r11: 0x202,       // user rflags
            rbx: 7,
            ..Default::default()
        };

        let mut context = Context::default();
        frame.save_to(&mut context);
        assert_eq!(context.rip, 0x4000_1000);
        assert_eq!(context.rsp, 0x7fff_0000);
        assert_eq!(context.rflags, 0x202);
        assert_eq!(context.cs, USER_CS);
        assert!(context.can_sysret);

        let mut reloaded = SyscallFrame::default();
        reloaded.load_from(&context);
        assert_eq!(reloaded.rcx, 0x4000_1000);
        assert_eq!(reloaded.rdx, 0x7fff_0000);
        assert_eq!(reloaded.r11, 0x202);
        assert_eq!(reloaded.rbx, 7);
    }

    #[test]
    fn mapping_create_installs_translations() {
        let (process, page) = syscall_process();
        let _pmm = test_support::lock_pmm();

        // A fresh VAS to map into.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::VasCreate as u64,
            rdi: page,
            rsi: 0,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        let vas_token = read_u64(page);

        // An 8-page sparse VMO.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::VmoCreate as u64,
            rdi: (8 * PAGE_SIZES[0]) as u64,
            rsi: page,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        let vmo_token = read_u64(page);

        // Map it and translate through the target VAS.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MappingCreate as u64,
            rdi: vas_token,
            rsi: vmo_token,
            r8: 0x4000_0000,
            r9: 0,
            r10: page,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        let mapping_token = read_u64(page);

        let vas_handle = process.get_handle(vas_token).unwrap();
        let vas = vas_handle.as_vas().unwrap();
        let vmo_handle = process.get_handle(vmo_token).unwrap();
        let vmo = vmo_handle.as_vmo().unwrap();

        let expected = vmo
            .frame_at(3 * PAGE_SIZES[0])
            .expect("mapping_create commits the VMO");
        assert_eq!(
            crate::mm::page_table::translate(vas.asid(), VirtAddr::new(0x4000_3000)),
            expected
        );

        // Destroy through the mapping token; the record invalidates.
        let mapping_handle = process.get_handle(mapping_token).unwrap();
        let mapping = mapping_handle.as_mapping().unwrap().clone();
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MappingDestroy as u64,
            rdi: mapping_token,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        assert!(mapping.is_invalid());
    }

    #[test]
    fn mailbox_write_and_read_round_trip_through_the_wire_format() {
        use super::abi::{MailboxWireMessage, MESSAGE_KIND_USER};

        let (process, page) = syscall_process();

        let mut frame = SyscallFrame {
            rax: SyscallNumber::MailboxCreate as u64,
            rdi: page,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);
        let mailbox_token = read_u64(page);

        // Write user{1, 2}.
        let message_addr = page + 0x100;
        // SAFETY: message_addr points into the identity arena page.
        unsafe {
            (message_addr as *mut MailboxWireMessage).write_volatile(MailboxWireMessage {
                kind: MESSAGE_KIND_USER,
                data0: 1,
                data1: 2,
            });
        }
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MailboxWrite as u64,
            rdi: mailbox_token,
            rsi: message_addr,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);

        // Read it back into a different shadow location.
        let out_addr = page + 0x200;
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MailboxRead as u64,
            rdi: mailbox_token,
            rsi: 0,
            r8: out_addr,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::Ok);

        // SAFETY: out_addr points into the identity arena page.
        let received = unsafe { (out_addr as *const MailboxWireMessage).read_volatile() };
        assert_eq!(received.kind, MESSAGE_KIND_USER);
        assert_eq!(received.data0, 1);
        assert_eq!(received.data1, 2);

        // The queue is now empty.
        let mut frame = SyscallFrame {
            rax: SyscallNumber::MailboxRead as u64,
            rdi: mailbox_token,
            rsi: 0,
            r8: out_addr,
            ..Default::default()
        };
        assert_eq!(dispatch_for(&process, &mut frame), SysResult::NotReady);
    }
}
