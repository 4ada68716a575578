//! Physical memory manager
//!
//! Owns every free frame of physical RAM. Each supported page size has an
//! intrusive LIFO free stack whose link word lives in the first eight
//! bytes of the free frame itself, reached through the physmem window.
//! When a size class runs dry, one frame of the next class up is split
//! into its children; exhausting the largest class is fatal (cross-manager
//! rebalancing is a documented extension point).

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::boot_protocol::{MemoryMapEntry, MemoryType};

use super::{phys_to_ptr, PhysAddr, PAGE_SIZES, PAGE_SIZE_COUNT};

/// One intrusive free stack.
struct Stack {
    head: Option<PhysAddr>,
    count: usize,
}

impl Stack {
    const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }
}

/// Free/used byte totals, as reported by [`FrameStacks::report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub free_frames: [u64; PAGE_SIZE_COUNT],
    pub used_frames: [u64; PAGE_SIZE_COUNT],
}

/// A set of per-size-class frame stacks with free/used accounting.
pub struct FrameStacks {
    stacks: [Mutex<Stack>; PAGE_SIZE_COUNT],
    free_frames: [AtomicU64; PAGE_SIZE_COUNT],
    used_frames: [AtomicU64; PAGE_SIZE_COUNT],
    sub_1m_bottom: AtomicU64,
    sub_1m_top: AtomicU64,
}

impl FrameStacks {
    pub const fn new() -> Self {
        Self {
            stacks: [const { Mutex::new(Stack::new()) }; PAGE_SIZE_COUNT],
            free_frames: [const { AtomicU64::new(0) }; PAGE_SIZE_COUNT],
            used_frames: [const { AtomicU64::new(0) }; PAGE_SIZE_COUNT],
            sub_1m_bottom: AtomicU64::new(0),
            sub_1m_top: AtomicU64::new(0),
        }
    }

    /// Push a frame without touching the free/used counters. Used while
    /// seeding the stacks and while splitting a larger frame.
    fn push_raw(&self, layer: usize, frame: PhysAddr) {
        let mut stack = self.stacks[layer].lock();

        assert!(
            stack.head != Some(frame),
            "frame {} pushed onto size class {} twice",
            frame,
            layer
        );

        let link = match stack.head {
            Some(head) => head.value(),
            None => u64::MAX,
        };
        // SAFETY: the frame is free, so the manager owns its contents; the
        // stack lock serializes access to the link word.
        unsafe {
            (phys_to_ptr(frame) as *mut u64).write_volatile(link);
        }

        stack.head = Some(frame);
        stack.count += 1;
    }

    /// Pop a frame without touching the counters, splitting from the next
    /// class up when this one is empty.
    fn pop_raw(&self, layer: usize) -> PhysAddr {
        loop {
            let mut stack = self.stacks[layer].lock();

            if stack.count == 0 {
                if layer == PAGE_SIZE_COUNT - 1 {
                    panic!("out of physical memory: largest frame class exhausted");
                }

                drop(stack);

                let parent = self.pop_raw(layer + 1);
                self.free_frames[layer + 1].fetch_sub(1, Ordering::Relaxed);

                let children = PAGE_SIZES[layer + 1] / PAGE_SIZES[layer];
                for i in 0..children {
                    self.push_raw(layer, parent.offset((i * PAGE_SIZES[layer]) as u64));
                }
                self.free_frames[layer].fetch_add(children as u64, Ordering::Relaxed);

                continue;
            }

            let frame = stack.head.expect("non-empty stack with no head");
            // SAFETY: `frame` is on the free stack, so its link word is
            // ours to read under the stack lock.
            let link = unsafe { (phys_to_ptr(frame) as *const u64).read_volatile() };
            stack.head = if link == u64::MAX {
                None
            } else {
                Some(PhysAddr::new(link))
            };
            stack.count -= 1;

            return frame;
        }
    }

    /// Hand out one frame of the given size class.
    pub fn pop(&self, layer: usize) -> PhysAddr {
        if layer >= PAGE_SIZE_COUNT {
            panic!("tried to pop a frame beyond supported frame sizes: {}", layer);
        }

        let frame = self.pop_raw(layer);
        self.free_frames[layer].fetch_sub(1, Ordering::Relaxed);
        self.used_frames[layer].fetch_add(1, Ordering::Relaxed);
        frame
    }

    /// Return a frame to the given size class.
    pub fn push(&self, layer: usize, frame: PhysAddr) {
        if layer >= PAGE_SIZE_COUNT {
            panic!(
                "tried to push a frame beyond supported frame sizes: {}",
                layer
            );
        }

        self.push_raw(layer, frame);
        self.used_frames[layer].fetch_sub(1, Ordering::Relaxed);
        self.free_frames[layer].fetch_add(1, Ordering::Relaxed);
    }

    /// Seed the stacks from the loader's memory map.
    ///
    /// Free ranges are emitted largest-aligned-first so big frames survive
    /// wherever alignment allows. The first free range below 1 MiB is
    /// withheld for the AP boot trampoline. Kernel-owned ranges (kernel
    /// image, initrd, paging structures, ...) are counted as used 4 KiB
    /// frames so the report reflects the whole machine.
    pub fn initialize(&self, memmap: &[MemoryMapEntry]) {
        log::info!("[PMM] Initializing physical memory manager...");
        log::info!(" > Memory map: {} entries", memmap.len());

        let mut i = 0;
        while i < memmap.len() {
            let mut start = PhysAddr::new(memmap[i].physical_start);
            let mut size = memmap[i].length;

            // Coalesce adjacent entries of identical type and attributes.
            while i + 1 < memmap.len()
                && memmap[i].kind == memmap[i + 1].kind
                && memmap[i].attributes == memmap[i + 1].attributes
                && start.value() + size == memmap[i + 1].physical_start
            {
                size += memmap[i + 1].length;
                i += 1;
            }

            log::info!(
                " > {:#018x} | {:16} | {}",
                start.value(),
                size,
                memmap[i].kind.description()
            );

            // Withhold the first sub-1 MiB region for AP bring-up.
            if start.value() < 1024 * 1024 && self.sub_1m_top.load(Ordering::Relaxed) == 0 {
                self.sub_1m_bottom.store(start.value(), Ordering::Relaxed);

                if start.value() + size <= 1024 * 1024 {
                    self.sub_1m_top
                        .store(start.value() + size, Ordering::Relaxed);
                    i += 1;
                    continue;
                }

                self.sub_1m_top.store(1024 * 1024, Ordering::Relaxed);
                size -= 1024 * 1024 - start.value();
                start = PhysAddr::new(1024 * 1024);
            }

            if memmap[i].kind == MemoryType::Free {
                let mut remaining = size;

                let emit = |layer: usize, at: &mut PhysAddr, remaining: &mut u64| {
                    self.push_raw(layer, *at);
                    *at = at.offset(PAGE_SIZES[layer] as u64);
                    *remaining -= PAGE_SIZES[layer] as u64;
                    self.free_frames[layer].fetch_add(1, Ordering::Relaxed);
                };

                // Small frames until the next class's alignment is reached.
                for layer in 0..PAGE_SIZE_COUNT - 1 {
                    while start.value() % PAGE_SIZES[layer + 1] as u64 != 0
                        && remaining >= PAGE_SIZES[layer] as u64
                    {
                        emit(layer, &mut start, &mut remaining);
                    }
                }

                // Then the largest frames that still fit.
                for layer in (0..PAGE_SIZE_COUNT).rev() {
                    while remaining >= PAGE_SIZES[layer] as u64 {
                        emit(layer, &mut start, &mut remaining);
                    }
                }
            } else if memmap[i].kind.is_kernel_owned() {
                self.used_frames[0].fetch_add(size / PAGE_SIZES[0] as u64, Ordering::Relaxed);
            }

            i += 1;
        }
    }

    /// Current free/used totals; also logged per size class.
    pub fn report(&self) -> MemoryReport {
        let mut report = MemoryReport {
            free_bytes: 0,
            used_bytes: 0,
            free_frames: [0; PAGE_SIZE_COUNT],
            used_frames: [0; PAGE_SIZE_COUNT],
        };

        for layer in 0..PAGE_SIZE_COUNT {
            let free = self.free_frames[layer].load(Ordering::Relaxed);
            let used = self.used_frames[layer].load(Ordering::Relaxed);
            report.free_frames[layer] = free;
            report.used_frames[layer] = used;
            report.free_bytes += free * PAGE_SIZES[layer] as u64;
            report.used_bytes += used * PAGE_SIZES[layer] as u64;
        }

        log::info!("[PMM] Physical memory manager status:");
        for layer in 0..PAGE_SIZE_COUNT {
            log::info!(
                " > {:>10}: {} free, {} used",
                PAGE_SIZES[layer],
                report.free_frames[layer],
                report.used_frames[layer]
            );
        }
        log::info!(
            " > Total free: {} KiB, used: {} KiB",
            report.free_bytes / 1024,
            report.used_bytes / 1024
        );

        report
    }

    /// Bottom of the withheld sub-1 MiB region.
    pub fn sub_1m_bottom(&self) -> u64 {
        self.sub_1m_bottom.load(Ordering::Relaxed)
    }

    /// Top of the withheld sub-1 MiB region.
    pub fn sub_1m_top(&self) -> u64 {
        self.sub_1m_top.load(Ordering::Relaxed)
    }
}

impl Default for FrameStacks {
    fn default() -> Self {
        Self::new()
    }
}

/// The global frame manager.
static GLOBAL: FrameStacks = FrameStacks::new();

/// Seed the global manager from the loader memory map. Boot-time only.
pub fn initialize(memmap: &[MemoryMapEntry]) {
    GLOBAL.initialize(memmap);
}

/// Pop a frame of the given size class from the global manager.
pub fn pop(layer: usize) -> PhysAddr {
    GLOBAL.pop(layer)
}

/// Return a frame of the given size class to the global manager.
pub fn push(layer: usize, frame: PhysAddr) {
    GLOBAL.push(layer, frame)
}

/// Free/used totals of the global manager.
pub fn report() -> MemoryReport {
    GLOBAL.report()
}

/// Sub-1 MiB region withheld for the AP trampoline.
pub fn sub_1m_range() -> (u64, u64) {
    (GLOBAL.sub_1m_bottom(), GLOBAL.sub_1m_top())
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn global_for_tests() -> &'static FrameStacks {
    &GLOBAL
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn pop_push_conserves_frames() {
        let stacks = FrameStacks::new();
        let arena = test_support::alloc_arena(PAGE_SIZES[0] * 8, PAGE_SIZES[0]);

        for i in 0..8 {
            stacks.push_raw(0, arena.offset((i * PAGE_SIZES[0]) as u64));
        }
        stacks.free_frames[0].store(8, Ordering::Relaxed);

        let mut popped = alloc::vec::Vec::new();
        for _ in 0..8 {
            popped.push(stacks.pop(0));
        }

        // Every frame is distinct and within the seeded arena.
        for (i, frame) in popped.iter().enumerate() {
            assert!(frame.value() >= arena.value());
            assert!(frame.value() < arena.value() + (8 * PAGE_SIZES[0]) as u64);
            for other in &popped[i + 1..] {
                assert_ne!(frame, other);
            }
        }

        for frame in popped {
            stacks.push(0, frame);
        }

        let report = stacks.report();
        assert_eq!(report.free_frames[0], 8);
        assert_eq!(report.used_frames[0], 0);
    }

    #[test]
    fn splitting_refills_an_empty_class() {
        let stacks = FrameStacks::new();
        let arena = test_support::alloc_arena(PAGE_SIZES[1], PAGE_SIZES[1]);

        stacks.push_raw(1, arena);
        stacks.free_frames[1].store(1, Ordering::Relaxed);

        let frame = stacks.pop(0);
        assert!(frame.value() >= arena.value());
        assert!(frame.value() < arena.value() + PAGE_SIZES[1] as u64);

        let report = stacks.report();
        let children = (PAGE_SIZES[1] / PAGE_SIZES[0]) as u64;
        assert_eq!(report.free_frames[0], children - 1);
        assert_eq!(report.free_frames[1], 0);
        assert_eq!(report.used_frames[0], 1);
        // Byte totals balance: one child in use, the rest still free.
        assert_eq!(
            report.free_bytes + report.used_bytes,
            PAGE_SIZES[1] as u64
        );
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn double_push_of_the_same_frame_panics() {
        let stacks = FrameStacks::new();
        let arena = test_support::alloc_arena(PAGE_SIZES[0], PAGE_SIZES[0]);

        stacks.push_raw(0, arena);
        stacks.push_raw(0, arena);
    }

    #[test]
    fn initialize_accounts_for_the_whole_map() {
        let stacks = FrameStacks::new();
        // 8 MiB of "RAM", plus kernel-owned entries the report must count.
        let arena = test_support::alloc_arena(8 * 1024 * 1024, PAGE_SIZES[1]);

        let memmap = [
            MemoryMapEntry {
                physical_start: arena.value(),
                length: 6 * 1024 * 1024,
                kind: MemoryType::Free,
                attributes: 0,
            },
            MemoryMapEntry {
                physical_start: arena.value() + 6 * 1024 * 1024,
                length: 2 * 1024 * 1024,
                kind: MemoryType::Kernel,
                attributes: 0,
            },
        ];

        stacks.initialize(&memmap);

        let report = stacks.report();
        assert_eq!(report.free_bytes, 6 * 1024 * 1024);
        assert_eq!(report.used_bytes, 2 * 1024 * 1024);
        // The arena is 2 MiB aligned, so the free range seeds whole large
        // frames.
        assert_eq!(report.free_frames[1], 3);
        assert_eq!(report.free_frames[0], 0);
    }

    #[test]
    fn initialize_withholds_the_sub_1m_region() {
        let stacks = FrameStacks::new();

        // A synthetic map whose first free range sits below 1 MiB. No
        // frames are pushed for it, so no physmem access happens.
        let memmap = [MemoryMapEntry {
            physical_start: 0x1000,
            length: 0x9f000,
            kind: MemoryType::Free,
            attributes: 0,
        }];

        stacks.initialize(&memmap);

        assert_eq!(stacks.sub_1m_bottom(), 0x1000);
        assert_eq!(stacks.sub_1m_top(), 0xa0000);
        assert_eq!(stacks.report().free_bytes, 0);
    }
}
