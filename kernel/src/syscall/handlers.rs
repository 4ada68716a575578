//! Syscall handlers
//!
//! The typed back half of the syscall boundary: token resolution and
//! permission checks happen here, pointer arguments arrive pre-declared
//! and are validated through [`super::userptr`]. Every handler returns a
//! wire-level [`SysResult`]; user state is only modified on `Ok`.

use alloc::sync::Arc;

use crate::arch::Context;
use crate::cap::{create_handle, Handle, KernelObject, ObjectKind, Permissions};
use crate::ipc::{Mailbox, Message};
use crate::mm::page_table::MapFlags;
use crate::mm::vas::Vas;
use crate::mm::vdso;
use crate::mm::vmo::Vmo;
use crate::mm::VirtAddr;
use crate::process::Process;
use crate::sched;

use super::abi::{
    MailboxWireMessage, SysResult, VdsoMappingInfo, MESSAGE_KIND_HANDLE_TOKEN, MESSAGE_KIND_USER,
};
use super::userptr;

/// Resolve a token against the calling process: it must name a handle of
/// `kind` carrying every bit of `required`.
fn resolve(
    process: &Process,
    token: u64,
    kind: ObjectKind,
    required: Permissions,
) -> Result<Arc<Handle>, SysResult> {
    let handle = process.get_handle(token).ok_or(SysResult::InvalidToken)?;
    if !handle.is_a(kind) {
        return Err(SysResult::WrongHandleType);
    }
    if !handle.has_permissions(required) {
        return Err(SysResult::NotAllowed);
    }
    Ok(handle)
}

fn complete(outcome: Result<(), SysResult>) -> SysResult {
    match outcome {
        Ok(()) => SysResult::Ok,
        Err(code) => code,
    }
}

/// `rose_vas_create(out token, out vdso_info?)`
///
/// Creates a fresh address space. A non-null `vdso_info` requests the
/// vDSO mapping; its base and length are reported back.
pub fn rose_vas_create(process: &Arc<Process>, token_out: u64, vdso_info_out: u64) -> SysResult {
    complete((|| {
        let token_ptr = userptr::validate::<u64>(process, token_out, true)?;

        let map_vdso = vdso_info_out != 0;
        let vdso_info_ptr = if map_vdso {
            Some(userptr::validate::<VdsoMappingInfo>(
                process,
                vdso_info_out,
                true,
            )?)
        } else {
            None
        };

        let vas = Vas::create(map_vdso);

        if let Some(ptr) = vdso_info_ptr {
            let base = vas
                .vdso_base()
                .expect("VAS created with a vDSO mapping reports no vDSO base");
            ptr.write(VdsoMappingInfo {
                base: base.value(),
                length: vdso::get().length() as u64,
            });
        }

        let handle = create_handle(KernelObject::Vas(vas), Permissions::vas_default());
        token_ptr.write(process.register_for_token(handle));

        Ok(())
    })())
}

/// `rose_mapping_create(vas, vmo, address, flags, out token)`
///
/// Commits the VMO and maps it into the target VAS at `address`.
pub fn rose_mapping_create(
    process: &Arc<Process>,
    vas_token: u64,
    vmo_token: u64,
    address: u64,
    flags: u64,
    token_out: u64,
) -> SysResult {
    complete((|| {
        let vas_handle = resolve(
            process,
            vas_token,
            ObjectKind::Vas,
            Permissions::CREATE_MAPPING,
        )?;
        let vmo_handle = resolve(process, vmo_token, ObjectKind::Vmo, Permissions::MAP)?;
        let token_ptr = userptr::validate::<u64>(process, token_out, true)?;

        if flags != 0 {
            return Err(SysResult::InvalidArgument);
        }

        let vas = vas_handle.as_vas().expect("type-checked above");
        let vmo = vmo_handle.as_vmo().expect("type-checked above");

        if address % vmo.page_size() as u64 != 0 {
            return Err(SysResult::InvalidArgument);
        }

        // On-demand faulting is an extension point; back the whole
        // object before it becomes visible.
        vmo.commit_all();

        let mapping = vas.map_vmo(vmo.clone(), VirtAddr::new(address), MapFlags::USER);
        let handle = create_handle(KernelObject::Mapping(mapping), Permissions::mapping_default());
        token_ptr.write(process.register_for_token(handle));

        Ok(())
    })())
}

/// `rose_mapping_destroy(mapping)`
pub fn rose_mapping_destroy(process: &Arc<Process>, mapping_token: u64) -> SysResult {
    complete((|| {
        let handle = resolve(
            process,
            mapping_token,
            ObjectKind::Mapping,
            Permissions::DESTROY,
        )?;
        let mapping = handle.as_mapping().expect("type-checked above");

        let Some(vas) = mapping.vas() else {
            // Already torn down.
            return Err(SysResult::InvalidArgument);
        };
        vas.unmap(mapping);

        Ok(())
    })())
}

/// `rose_vmo_create(length, out token)`
///
/// Creates a sparse VMO of `length` bytes (page-granular).
pub fn rose_vmo_create(process: &Arc<Process>, length: u64, token_out: u64) -> SysResult {
    complete((|| {
        let token_ptr = userptr::validate::<u64>(process, token_out, true)?;

        if length == 0 {
            return Err(SysResult::InvalidArgument);
        }

        let vmo = Vmo::create_sparse(length as usize, 0);
        let handle = create_handle(KernelObject::Vmo(vmo), Permissions::vmo_default());
        token_ptr.write(process.register_for_token(handle));

        Ok(())
    })())
}

/// `rose_process_create(vas, out token)`
///
/// Creates a process over the given address space, claiming it.
pub fn rose_process_create(process: &Arc<Process>, vas_token: u64, token_out: u64) -> SysResult {
    complete((|| {
        let vas_handle = resolve(process, vas_token, ObjectKind::Vas, Permissions::WRITE)?;
        let token_ptr = userptr::validate::<u64>(process, token_out, true)?;

        let vas = vas_handle.as_vas().expect("type-checked above");
        let Some(new_process) = sched::create_process(vas.clone()) else {
            // The VAS was already claimed by another process.
            return Err(SysResult::InvalidArgument);
        };

        let handle = create_handle(
            KernelObject::Process(new_process),
            Permissions::process_default(),
        );
        token_ptr.write(process.register_for_token(handle));

        Ok(())
    })())
}

/// `rose_process_start(process, entry, stack_top, mailbox?)`
///
/// Creates the target's first thread at `entry`. A non-zero mailbox
/// token (which must carry `transfer`) is re-registered in the target
/// process; the fresh token arrives in the thread's argument register.
pub fn rose_process_start(
    process: &Arc<Process>,
    process_token: u64,
    entry: u64,
    stack_top: u64,
    mailbox_token: u64,
) -> SysResult {
    complete((|| {
        let process_handle = resolve(
            process,
            process_token,
            ObjectKind::Process,
            Permissions::CREATE_THREAD,
        )?;
        let target = process_handle.as_process().expect("type-checked above");

        let argument = if mailbox_token != 0 {
            let mailbox_handle = resolve(
                process,
                mailbox_token,
                ObjectKind::Mailbox,
                Permissions::TRANSFER,
            )?;
            target.register_for_token(mailbox_handle)
        } else {
            0
        };

        let thread = target.create_thread();
        thread.set_context(Context::user_entry(entry, stack_top, argument));
        sched::schedule(thread);

        Ok(())
    })())
}

/// `rose_mailbox_create(out token)`
pub fn rose_mailbox_create(process: &Arc<Process>, token_out: u64) -> SysResult {
    complete((|| {
        let token_ptr = userptr::validate::<u64>(process, token_out, true)?;

        let mailbox = Mailbox::create();
        let handle = create_handle(
            KernelObject::Mailbox(mailbox),
            Permissions::mailbox_default(),
        );
        token_ptr.write(process.register_for_token(handle));

        Ok(())
    })())
}

/// `rose_mailbox_write(mailbox, in message)`
///
/// A handle-token message resolves the carried token in the sender and
/// requires `transfer` on it; the sender's own token stays valid.
pub fn rose_mailbox_write(process: &Arc<Process>, mailbox_token: u64, message_in: u64) -> SysResult {
    complete((|| {
        let mailbox_handle = resolve(process, mailbox_token, ObjectKind::Mailbox, Permissions::WRITE)?;
        let message_ptr = userptr::validate::<MailboxWireMessage>(process, message_in, false)?;
        let shadow = message_ptr.read();

        let mailbox = mailbox_handle.as_mailbox().expect("type-checked above");

        match shadow.kind {
            MESSAGE_KIND_HANDLE_TOKEN => {
                let carried = process
                    .get_handle(shadow.data0)
                    .ok_or(SysResult::InvalidToken)?;
                if !carried.has_permissions(Permissions::TRANSFER) {
                    return Err(SysResult::NotAllowed);
                }
                mailbox.send(Message::Handle(carried));
            }
            MESSAGE_KIND_USER => {
                mailbox.send(Message::User {
                    data0: shadow.data0,
                    data1: shadow.data1,
                });
            }
            _ => return Err(SysResult::InvalidArgument),
        }

        Ok(())
    })())
}

/// `rose_mailbox_read(mailbox, timeout, out message)`
///
/// Zero timeout polls; otherwise the caller is parked until a message or
/// the deadline wakes it, and retries on `not_ready`.
pub fn rose_mailbox_read(
    process: &Arc<Process>,
    mailbox_token: u64,
    timeout: u64,
    message_out: u64,
) -> SysResult {
    complete((|| {
        let mailbox_handle = resolve(process, mailbox_token, ObjectKind::Mailbox, Permissions::READ)?;
        let message_ptr = userptr::validate::<MailboxWireMessage>(process, message_out, true)?;

        let mailbox = mailbox_handle.as_mailbox().expect("type-checked above");

        let shadow = match mailbox.read(timeout) {
            Ok(Message::Handle(handle)) => MailboxWireMessage {
                kind: MESSAGE_KIND_HANDLE_TOKEN,
                data0: process.register_for_token(handle),
                data1: 0,
            },
            Ok(Message::User { data0, data1 }) => MailboxWireMessage {
                kind: MESSAGE_KIND_USER,
                data0,
                data1,
            },
            Err(_) => return Err(SysResult::NotReady),
        };

        message_ptr.write(shadow);

        Ok(())
    })())
}

/// `rose_token_release(token)`
///
/// Token 0 is a no-op. Dropping the last handle releases the object.
pub fn rose_token_release(process: &Arc<Process>, token: u64) -> SysResult {
    if token == 0 {
        return SysResult::Ok;
    }

    match process.remove_token(token) {
        Some(_) => SysResult::Ok,
        None => SysResult::InvalidToken,
    }
}
