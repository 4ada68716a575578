//! Rose kernel binary entry
//!
//! The loader hands control here with the boot information structure;
//! the entry adapter rebuilds the §6-shaped memory map from the
//! bootloader's regions on the boot stack (no heap yet) and jumps into
//! the BSP bring-up sequence.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod entry {
    use bootloader_api::info::MemoryRegionKind;
    use bootloader_api::{entry_point, BootInfo as LoaderInfo};

    use rose_kernel::boot_protocol::{BootInfo, MemoryMapEntry, MemoryType};
    use rose_kernel::bootstrap;

    const MAX_MEMMAP_ENTRIES: usize = 128;

    entry_point!(kernel_main);

    fn kernel_main(loader_info: &'static mut LoaderInfo) -> ! {
        let mut entries = [MemoryMapEntry {
            physical_start: 0,
            length: 0,
            kind: MemoryType::Unusable,
            attributes: 0,
        }; MAX_MEMMAP_ENTRIES];
        let mut count = 0;

        for region in loader_info.memory_regions.iter() {
            if count == MAX_MEMMAP_ENTRIES {
                break;
            }
            entries[count] = MemoryMapEntry {
                physical_start: region.start,
                length: region.end - region.start,
                kind: match region.kind {
                    MemoryRegionKind::Usable => MemoryType::Free,
                    MemoryRegionKind::Bootloader => MemoryType::Loader,
                    _ => MemoryType::Unusable,
                },
                attributes: 0,
            };
            count += 1;
        }

        let boot_info = BootInfo {
            memory_map: entries.as_ptr(),
            memory_map_size: count,
            video_mode: core::ptr::null(),
            acpi_revision: 0,
            acpi_root: loader_info
                .rsdp_addr
                .into_option()
                .unwrap_or(0),
        };

        bootstrap::bsp_main(&boot_info)
    }

    /// Invariant violations halt the offending core; taking the others
    /// down over NMI is an extension point.
    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        rose_kernel::println!("KERNEL PANIC: {}", info);
        loop {
            rose_kernel::intrinsics::halt();
        }
    }
}

/// Host builds of the binary exist only so `cargo build` succeeds on
/// the development machine; the kernel proper is the library.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {}
