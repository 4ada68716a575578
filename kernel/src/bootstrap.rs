//! BSP boot sequence
//!
//! Brings the system up in dependency order: frame manager from the
//! loader's memory map, kernel address space adoption, heap, time
//! subsystem, AP bring-up, cross-core runtime, schedulers, and finally
//! the first user process hand-off. Bare-metal only; the host target
//! links the subsystems directly from tests.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use imp::bsp_main;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use alloc::vec::Vec;

    use crate::arch::x86_64::{hpet, lapic};
    use crate::boot_protocol::BootInfo;
    use crate::intrinsics;
    use crate::mm::{self, pmm, vdso, vmo::Vmo, PhysAddr, PAGE_SIZES};
    use crate::smp::{self, CoreDescriptor};
    use crate::{arch, sched, serial, time};

    /// Standard HPET MMIO base; the ACPI glue may override this with the
    /// address from the HPET table.
    const HPET_DEFAULT_BASE: u64 = 0xfed0_0000;

    /// Offset of the loader's physical direct map.
    const PHYS_WINDOW_BASE: u64 = 0xffff_8000_0000_0000;

    /// CPUs to run on, as discovered by the platform-table collaborator.
    /// Until the MADT decoder is wired through the boot protocol this
    /// reports the BSP alone.
    fn enumerate_cores() -> Vec<CoreDescriptor> {
        let mut cores = Vec::new();
        cores.push(CoreDescriptor {
            apic_id: lapic::current_apic_id(),
            acpi_uid: 0,
        });
        cores
    }

    /// Full bring-up on the bootstrap processor.
    pub fn bsp_main(boot_info: &BootInfo) -> ! {
        serial::init_logging();
        log::info!("[BOOT] Rose kernel starting");

        mm::set_phys_window_offset(PHYS_WINDOW_BASE);
        mm::set_kernel_root(arch::current_asid());

        // SAFETY: the loader guarantees the memory-map array it handed
        // over is mapped and sized as reported.
        let memmap = unsafe {
            core::slice::from_raw_parts(boot_info.memory_map, boot_info.memory_map_size)
        };
        pmm::initialize(memmap);
        mm::heap::init();
        pmm::report();

        time::initialize();
        lapic::initialize_local();
        hpet::initialize(PhysAddr::new(HPET_DEFAULT_BASE));

        arch::x86_64::init_syscalls();

        // The vDSO image: one page of syscall trampolines emitted by the
        // stub generator and packed by the build; registered as a shared
        // physical VMO.
        let vdso_frame = pmm::pop(0);
        vdso::register(Vmo::create_physical(vdso_frame, PAGE_SIZES[0], 0));

        smp::boot(enumerate_cores());
        time::initialize_multicore();
        smp::mp::initialize_parallel();
        sched::initialize();

        mm::page_table::unmap_lower_half();

        // First user process: the initrd loader (an external collaborator)
        // takes over from here with rose_process_create/start against the
        // boot mailbox.
        log::info!("[BOOT] Bring-up complete; entering the idle loop");

        // SAFETY: bring-up is done and every interrupt vector in use has
        // a registered handler.
        unsafe { intrinsics::sti() };
        loop {
            intrinsics::halt();
        }
    }
}
