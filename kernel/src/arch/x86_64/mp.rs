//! AP bring-up
//!
//! Places a real-mode trampoline in the sub-1 MiB region withheld by the
//! frame manager, then walks the INIT-SIPI-SIPI sequence in batches
//! sized by that region: 10 ms after INIT, 500 µs after each SIPI, one
//! SIPI resend for stragglers. Cores whose boot flag never reaches 2 are
//! compacted out; survivors get dense logical ids from the caller.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use crate::intrinsics;
use crate::mm::{self, page_table, pmm, PhysAddr, VirtAddr, PAGE_SIZES};
use crate::smp::CoreDescriptor;
use crate::time;

use super::lapic;

// Trampoline slot layout, shared with the assembly below.
const SLOT_ASID: u64 = 0xf80;
const SLOT_STACK: u64 = 0xf88;
const SLOT_FLAG: u64 = 0xf90;

core::arch::global_asm!(
    r#"
    .section .text.ap_trampoline, "ax"
    .global ap_trampoline_start
    .global ap_trampoline_end
    .code16
ap_trampoline_start:
    cli
    cld
    // Mark "started".
    lea ebx, [rip + ap_trampoline_start]
    mov byte ptr [ebx + 0xf90], 1

    // Enable PAE and load the kernel page-table root from its slot.
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax
    mov eax, dword ptr [ebx + 0xf80]
    mov cr3, eax

    // Long mode via EFER.LME, then paging + protection.
    mov ecx, 0xc0000080
    rdmsr
    or eax, 1 << 8
    wrmsr
    mov eax, cr0
    or eax, (1 << 31) | 1
    mov cr0, eax

    .code64
    // Assigned stack and boot-flag pointer, then into Rust.
    mov rsp, qword ptr [rbx + 0xf88]
    lea rdi, [rbx + 0xf90]
    mov rax, offset ap_entry
    jmp rax

    // Per-AP slots at fixed offsets: page-table root, stack top, flag.
    .skip 0xf80 - (. - ap_trampoline_start)
    .quad 0
    .quad 0
    .quad 0
ap_trampoline_end:
"#
);

extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
}

/// 64-bit entry for a woken AP: local interrupt controller up, syscall
/// MSRs programmed, then report "booted" and idle until the scheduler
/// claims the core.
#[no_mangle]
extern "C" fn ap_entry(boot_flag: *mut u8) -> ! {
    lapic::initialize_local();
    super::init_syscalls();

    // SAFETY: the flag points into this AP's trampoline page, which
    // stays mapped for the whole bring-up.
    unsafe { boot_flag.write_volatile(2) };

    loop {
        intrinsics::halt();
    }
}

/// Sleep using the high-precision timer, halting between interrupts.
fn delay_ns(ns: u64) {
    fn mark(context: usize) {
        // SAFETY: the context is the address of the flag below, alive
        // until this function observes it.
        let flag = unsafe { &*(context as *const AtomicBool) };
        flag.store(true, Ordering::Release);
    }

    let triggered = AtomicBool::new(false);
    let _token = time::high_precision_timer()
        .one_shot(ns, mark, &triggered as *const _ as usize)
        .expect("timer ids exhausted during AP bring-up");

    // SAFETY: bring-up runs on the BSP with a live IDT; interrupts are
    // wanted here so the timer can fire.
    unsafe { intrinsics::sti() };
    while !triggered.load(Ordering::Acquire) {
        intrinsics::halt();
    }
    // SAFETY: restore the interrupts-off state the boot path runs with.
    unsafe { intrinsics::cli() };
}

/// Wake every AP in `descriptors`; returns the survivors in boot order
/// (the BSP stays first).
pub fn boot_aps(descriptors: Vec<CoreDescriptor>) -> Vec<CoreDescriptor> {
    log::info!("[CPU] Booting APs...");

    let bsp_apic = lapic::current_apic_id();

    // SAFETY: the linker-provided trampoline symbols delimit one blob.
    let blob_size = unsafe {
        (&ap_trampoline_end as *const u8 as usize) - (&ap_trampoline_start as *const u8 as usize)
    };
    let trampoline_size = (blob_size + PAGE_SIZES[0] - 1) & !(PAGE_SIZES[0] - 1);

    for descriptor in &descriptors {
        if descriptor.apic_id != bsp_apic {
            log::info!(" > Sending INIT IPI to APIC id {}...", descriptor.apic_id);
            lapic::send_init_ipi(descriptor.apic_id);
        }
    }

    delay_ns(10_000_000);

    let (bottom, top) = pmm::sub_1m_range();
    let bottom = if bottom == 0 { 0x1000 } else { bottom };
    log::info!(" > Using trampoline range {:#010x}..{:#010x}", bottom, top);

    page_table::map_physical(
        mm::kernel_root(),
        VirtAddr::new(bottom),
        VirtAddr::new(top),
        PhysAddr::new(bottom),
        page_table::MapFlags::empty(),
    );

    let slots = ((top - bottom) as usize / trampoline_size).max(1);
    let mut survivors = Vec::with_capacity(descriptors.len());
    let mut pending: Vec<(CoreDescriptor, PhysAddr)> = Vec::new();

    for batch in descriptors.chunks(slots) {
        pending.clear();

        for (slot, descriptor) in batch.iter().enumerate() {
            if descriptor.apic_id == bsp_apic {
                survivors.push(*descriptor);
                continue;
            }

            let target = PhysAddr::new(bottom + (slot * trampoline_size) as u64);
            // SAFETY: the target page was withheld from the allocator at
            // init and mapped just above; the blob fits by construction.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    &ap_trampoline_start as *const u8,
                    mm::phys_to_ptr(target),
                    blob_size,
                );
                (mm::phys_to_ptr(target.offset(SLOT_ASID)) as *mut u64)
                    .write_volatile(mm::kernel_root().value());
                (mm::phys_to_ptr(target.offset(SLOT_FLAG)) as *mut u64).write_volatile(0);

                let stack = mm::allocate_address_range(2 * PAGE_SIZES[0]);
                page_table::map_physical(
                    mm::kernel_root(),
                    stack.offset(PAGE_SIZES[0] as u64),
                    stack.offset(2 * PAGE_SIZES[0] as u64),
                    pmm::pop(0),
                    page_table::MapFlags::empty(),
                );
                (mm::phys_to_ptr(target.offset(SLOT_STACK)) as *mut u64)
                    .write_volatile(stack.offset(2 * PAGE_SIZES[0] as u64).value());
            }

            pending.push((*descriptor, target));
        }

        for (descriptor, target) in &pending {
            log::info!(" > Sending startup IPI to APIC id {}...", descriptor.apic_id);
            lapic::send_startup_ipi(descriptor.apic_id, (target.value() >> 12) as u32);
        }

        delay_ns(500_000);

        // One resend for cores that have not marked "started".
        for (descriptor, target) in &pending {
            // SAFETY: flag slot of this AP's trampoline copy.
            let started =
                unsafe { (mm::phys_to_ptr(target.offset(SLOT_FLAG)) as *const u8).read_volatile() };
            if started == 0 {
                log::info!(
                    " > Sending secondary startup IPI to APIC id {}...",
                    descriptor.apic_id
                );
                lapic::send_startup_ipi(descriptor.apic_id, (target.value() >> 12) as u32);
            }
        }

        delay_ns(500_000);

        for (descriptor, target) in &pending {
            let flag_ptr = unsafe { mm::phys_to_ptr(target.offset(SLOT_FLAG)) as *const u8 };
            // SAFETY: flag slot of this AP's trampoline copy.
            if unsafe { flag_ptr.read_volatile() } == 0 {
                log::warn!(" > APIC id {} failed to boot", descriptor.apic_id);
                continue;
            }

            // Started: wait for the full "booted" handshake.
            // SAFETY: as above; the AP flips this to 2 from ap_entry.
            while unsafe { flag_ptr.read_volatile() } != 2 {
                intrinsics::pause();
            }
            log::info!(" > APIC id {} booted successfully", descriptor.apic_id);
            survivors.push(*descriptor);
        }
    }

    survivors
}
