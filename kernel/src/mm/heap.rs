//! Kernel heap
//!
//! A fixed-size region of the kernel's dynamic virtual space backed by
//! 4 KiB frames and handed to the linked-list allocator. On the host the
//! system allocator is used instead and this module is inert.

/// Kernel heap size: 16 MiB.
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Map the heap region and initialize the global allocator.
///
/// Called once during boot, after the frame manager and the kernel
/// address space are up.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    use super::page_table::{self, MapFlags};
    use super::{pmm, PAGE_SIZES};

    let base = super::allocate_address_range(HEAP_SIZE);

    let mut offset = 0;
    while offset < HEAP_SIZE {
        let frame = pmm::pop(0);
        page_table::map_physical(
            super::kernel_root(),
            base.offset(offset as u64),
            base.offset((offset + PAGE_SIZES[0]) as u64),
            frame,
            MapFlags::empty(),
        );
        offset += PAGE_SIZES[0];
    }

    // SAFETY: the range was just mapped with fresh frames and is not
    // used by anything else.
    unsafe {
        crate::get_allocator()
            .lock()
            .init(base.value() as *mut u8, HEAP_SIZE);
    }

    log::info!("[MM] Kernel heap initialized: {} KiB", HEAP_SIZE / 1024);
}

/// Host builds allocate from the system allocator; nothing to set up.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() {}
