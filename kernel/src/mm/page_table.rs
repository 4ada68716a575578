//! Four-level page-table engine
//!
//! Installs and removes virtual-to-physical translations in 512-entry
//! tables reached through the physmem window. Concurrency is per-entry: a
//! single otherwise-ignored bit of each entry doubles as a spin lock,
//! taken in path order from the root down, so concurrent operations on
//! disjoint ranges only contend on the entries their paths share.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::intrinsics;

use super::{kernel_root, phys_to_ptr, pmm, PhysAddr, VirtAddr, PAGE_SIZES};

/// Entries per table level.
pub const ENTRY_COUNT: usize = 512;

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const HUGE: u64 = 1 << 7;
const LOCK: u64 = 1 << 62;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// Mapping attributes carried by a VMO mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const USER = 1 << 0;
        const READ_ONLY = 1 << 1;
    }
}

/// One page-table entry. Bit 62 is the embedded lock.
#[repr(transparent)]
struct PtEntry(AtomicU64);

impl PtEntry {
    fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn store(&self, value: u64) {
        // Preserve the lock bit: the caller holds it and the matching
        // release clears it.
        let lock = self.0.load(Ordering::Relaxed) & LOCK;
        self.0.store(value | lock, Ordering::Release);
    }

    fn is_present(&self) -> bool {
        self.load() & PRESENT != 0
    }

    fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.load() & ADDR_MASK)
    }
}

/// Guard for the single-bit entry lock; test-and-set with a pause spin.
struct EntryLock<'a> {
    entry: &'a PtEntry,
}

impl<'a> EntryLock<'a> {
    fn acquire(entry: &'a PtEntry) -> Self {
        while entry.0.fetch_or(LOCK, Ordering::AcqRel) & LOCK != 0 {
            intrinsics::pause();
        }
        Self { entry }
    }
}

impl Drop for EntryLock<'_> {
    fn drop(&mut self) {
        self.entry.0.fetch_and(!LOCK, Ordering::Release);
    }
}

/// One 4 KiB table of 512 entries.
#[repr(C, align(4096))]
struct PageTable {
    entries: [PtEntry; ENTRY_COUNT],
}

/// View a frame as a page table through the physmem window.
///
/// # Safety
/// `phys` must be a live page-table frame owned by this engine.
unsafe fn table_at<'a>(phys: PhysAddr) -> &'a PageTable {
    // SAFETY: per this function's contract; entries are atomics, so shared
    // access from multiple cores is sound.
    unsafe { &*(phys_to_ptr(phys) as *const PageTable) }
}

/// Allocate and zero a fresh table frame.
fn alloc_table() -> PhysAddr {
    let frame = pmm::pop(0);
    // SAFETY: the frame was just popped, so nothing else references it.
    unsafe {
        core::ptr::write_bytes(phys_to_ptr(frame), 0, PAGE_SIZES[0]);
    }
    frame
}

/// Bit width covered by one entry at `level` (level 1 entries span 4 KiB).
fn entry_span(level: usize) -> u64 {
    1u64 << (level * 9 + 3)
}

fn entry_index(virt: u64, level: usize) -> usize {
    ((virt >> (level * 9 + 3)) & 511) as usize
}

/// End of the current entry's coverage, clamped to `virt_end`; guards
/// against wrap-around at the top of the address space.
fn clamped_entry_end(virt_start: u64, virt_end: u64, level: usize) -> u64 {
    let span = entry_span(level);
    let boundary = virt_start.wrapping_add(span) & !(span - 1);
    if boundary != 0 && boundary <= virt_end {
        boundary
    } else {
        virt_end
    }
}

fn walk_map(
    table_phys: PhysAddr,
    level: usize,
    mut virt_start: u64,
    virt_end: u64,
    mut phys: u64,
    flags: MapFlags,
) {
    let mut index = entry_index(virt_start, level);

    while virt_start < virt_end {
        // SAFETY: `table_phys` is a live table frame on this walk's path.
        let table = unsafe { table_at(table_phys) };
        let entry = &table.entries[index];
        let _lock = EntryLock::acquire(entry);

        let entry_end = clamped_entry_end(virt_start, virt_end, level);

        if level == 1 {
            if entry.is_present() {
                panic!(
                    "tried to re-map page {:#018x}, existing mapping: {}",
                    virt_start,
                    entry.addr()
                );
            }

            let mut bits = (phys & ADDR_MASK) | PRESENT;
            if !flags.contains(MapFlags::READ_ONLY) {
                bits |= WRITABLE;
            }
            if flags.contains(MapFlags::USER) {
                bits |= USER;
            }
            entry.store(bits);
        } else {
            if !entry.is_present() {
                let child = alloc_table();
                entry.store((child.value() & ADDR_MASK) | PRESENT | WRITABLE);
            }
            if flags.contains(MapFlags::USER) {
                entry.store(entry.load() & !LOCK | USER);
            }

            walk_map(entry.addr(), level - 1, virt_start, entry_end, phys, flags);
        }

        phys += entry_end - virt_start;
        virt_start = entry_end;
        index += 1;
    }
}

fn walk_unmap(
    table_phys: PhysAddr,
    level: usize,
    mut virt_start: u64,
    virt_end: u64,
    free_backing: bool,
) {
    let mut index = entry_index(virt_start, level);

    while virt_start < virt_end {
        // SAFETY: `table_phys` is a live table frame on this walk's path.
        let table = unsafe { table_at(table_phys) };
        let entry = &table.entries[index];
        let _lock = EntryLock::acquire(entry);

        let entry_end = clamped_entry_end(virt_start, virt_end, level);

        if !entry.is_present() {
            panic!("tried to unmap an unmapped address {:#018x}", virt_start);
        }

        if level == 1 {
            if free_backing {
                pmm::push(0, entry.addr());
            }
            entry.store(0);
        } else {
            if entry.load() & HUGE != 0 {
                panic!(
                    "tried to unmap a large-page mapping at {:#018x}",
                    virt_start
                );
            }
            walk_unmap(entry.addr(), level - 1, virt_start, entry_end, free_backing);
        }

        virt_start = entry_end;
        index += 1;
    }
}

fn walk_translate(table_phys: PhysAddr, level: usize, virt: u64) -> PhysAddr {
    // SAFETY: `table_phys` is a live table frame on this walk's path.
    let table = unsafe { table_at(table_phys) };
    let entry = &table.entries[entry_index(virt, level)];

    if !entry.is_present() {
        panic!("tried to probe an unmapped address {:#018x}", virt);
    }

    if level == 1 || entry.load() & HUGE != 0 {
        return entry.addr();
    }

    walk_translate(entry.addr(), level - 1, virt)
}

/// Install a contiguous mapping of `[start, end)` onto `phys`.
///
/// The range is split into 4 KiB leaves; intermediate tables are
/// allocated on demand. Overwriting a present leaf is fatal -- mapping
/// policy above this engine keeps ranges disjoint.
pub fn map_physical(root: PhysAddr, start: VirtAddr, end: VirtAddr, phys: PhysAddr, flags: MapFlags) {
    if end.value() == start.value() {
        return;
    }

    let page_mask = !(PAGE_SIZES[0] as u64 - 1);
    let virt_start = start.value() & page_mask;
    let virt_end = (end.value() + PAGE_SIZES[0] as u64 - 1) & page_mask;

    walk_map(root, 4, virt_start, virt_end, phys.value() & page_mask, flags);
}

/// Remove the mapping of `[start, end)`, optionally releasing the backing
/// frames to the frame manager. Unmapping an unmapped address is fatal.
pub fn unmap(root: PhysAddr, start: VirtAddr, end: VirtAddr, free_backing: bool) {
    if end.value() == start.value() {
        return;
    }

    let page_mask = !(PAGE_SIZES[0] as u64 - 1);
    let virt_start = start.value() & page_mask;
    let virt_end = (end.value() + PAGE_SIZES[0] as u64 - 1) & page_mask;

    walk_unmap(root, 4, virt_start, virt_end, free_backing);
}

/// Resolve a virtual address to the base of its backing physical page.
/// Probing an unmapped address is fatal.
pub fn translate(root: PhysAddr, virt: VirtAddr) -> PhysAddr {
    walk_translate(root, 4, virt.value())
}

/// Allocate a new page-table root whose upper half aliases the kernel's.
///
/// Missing upper-half tables are created in the kernel root first, so
/// every address space ever cloned observes later kernel-heap growth.
pub fn clone_upper_half() -> PhysAddr {
    let new_root = alloc_table();
    let kernel = kernel_root();

    // SAFETY: both frames are live table roots.
    let kernel_table = unsafe { table_at(kernel) };
    let new_table = unsafe { table_at(new_root) };

    for i in ENTRY_COUNT / 2..ENTRY_COUNT {
        let entry = &kernel_table.entries[i];
        let _lock = EntryLock::acquire(entry);

        if !entry.is_present() {
            let child = alloc_table();
            entry.store((child.value() & ADDR_MASK) | PRESENT | WRITABLE);
        }

        new_table.entries[i]
            .0
            .store(entry.load() & !LOCK, Ordering::Release);
    }

    new_root
}

fn free_table_tree(table_phys: PhysAddr, level: usize, first: usize, last: usize) {
    if level == 1 {
        return;
    }

    // SAFETY: `table_phys` is a live table frame being torn down under the
    // one-shot guard of `unmap_lower_half`.
    let table = unsafe { table_at(table_phys) };

    for index in first..=last {
        let entry = &table.entries[index];
        let bits = entry.load();

        if bits & LOCK != 0 {
            panic!("page table entry lock set while unmapping the lower half");
        }

        if bits & PRESENT != 0 {
            if bits & HUGE == 0 {
                free_table_tree(entry.addr(), level - 1, 0, ENTRY_COUNT - 1);
            }
            entry.store(0);
            pmm::push(0, PhysAddr::new(bits & ADDR_MASK));
        }
    }
}

/// Free a cloned root's private lower-half tables and the root frame
/// itself. The upper-half child tables are shared with the kernel and
/// stay untouched.
pub(crate) fn destroy_root(root: PhysAddr) {
    free_table_tree(root, 4, 0, ENTRY_COUNT / 2 - 1);
    pmm::push(0, root);
}

static UNMAP_LOWER_HALF_CALLED: AtomicBool = AtomicBool::new(false);

/// Drop the loader's identity mappings from the kernel address space.
///
/// One-shot: calling it twice is fatal. Finishes with a system-wide TLB
/// flush so no core keeps stale lower-half translations.
pub fn unmap_lower_half() {
    if UNMAP_LOWER_HALF_CALLED.swap(true, Ordering::AcqRel) {
        panic!("unmap_lower_half called more than once");
    }

    free_table_tree(kernel_root(), 4, 0, ENTRY_COUNT / 2 - 1);

    crate::smp::mp::tlb_flush_broadcast();
}
