//! Host-test scaffolding
//!
//! Unit tests run on the host, where "physical memory" is a leaked,
//! page-aligned heap arena and the physmem window stays at the identity
//! offset. Tests that touch the global frame manager serialize through
//! [`lock_pmm`] so free/used accounting assertions stay deterministic.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::boot_protocol::{MemoryMapEntry, MemoryType};
use crate::mm::{self, pmm, vdso, vmo::Vmo, PhysAddr, PAGE_SIZES};
use crate::sync::OnceLock;
use crate::time::{self, Timer, TimerBackend};

static PMM_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that pop/push global frames or assert on the report.
pub fn lock_pmm() -> spin::MutexGuard<'static, ()> {
    PMM_TEST_LOCK.lock()
}

/// Leak a zeroed, aligned arena and hand back its "physical" base.
pub fn alloc_arena(size: usize, align: usize) -> PhysAddr {
    let layout = std::alloc::Layout::from_size_align(size, align)
        .expect("arena layout should be valid");
    // SAFETY: layout has non-zero size; the allocation is intentionally
    // leaked so frame addresses stay valid for the whole test run.
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "test arena allocation failed");
    PhysAddr::new(ptr as u64)
}

/// Seed the global frame manager, the kernel page-table root, and the
/// vDSO object exactly once per test process.
pub fn ensure_global_frames() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let len = 64 * 1024 * 1024;
        let arena = alloc_arena(len, PAGE_SIZES[1]);

        let memmap = [MemoryMapEntry {
            physical_start: arena.value(),
            length: len as u64,
            kind: MemoryType::Free,
            attributes: 0,
        }];
        pmm::initialize(&memmap);

        let root = pmm::pop(0);
        // SAFETY: the frame was just popped and becomes the test kernel
        // page-table root.
        unsafe {
            core::ptr::write_bytes(mm::phys_to_ptr(root), 0, PAGE_SIZES[0]);
        }
        mm::set_kernel_root_for_tests(root);

        let vdso_frame = pmm::pop(0);
        vdso::register(Vmo::create_physical(vdso_frame, PAGE_SIZES[0], 0));

        // Populate the kernel root's upper-half tables up front so later
        // clone/drop pairs in tests balance the frame counters exactly.
        let warmup = mm::page_table::clone_upper_half();
        pmm::push(0, warmup);
    });
}

/// Deterministic timer backend: a hand-cranked counter at 1 ns per tick.
pub struct ManualBackend {
    ticks: AtomicU64,
}

impl ManualBackend {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.ticks.fetch_add(ns, Ordering::Relaxed);
    }
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBackend for ManualBackend {
    fn counter(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn period_femtoseconds(&self) -> u64 {
        1_000_000
    }

    fn arm_after(&self, _nanoseconds: u64) {}
}

/// Register a manual backend as the global high-precision timer, once
/// per test process, and hand back the crank.
pub fn ensure_test_clock() -> &'static ManualBackend {
    static CLOCK: OnceLock<&'static ManualBackend> = OnceLock::new();
    *CLOCK.get_or_init(|| {
        let backend: &'static ManualBackend = alloc::boxed::Box::leak(alloc::boxed::Box::new(ManualBackend::new()));
        time::register_high_precision_timer(Timer::new(backend));
        backend
    })
}
