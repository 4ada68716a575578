//! End-to-end scenarios against the public kernel API
//!
//! Host-side equivalents of the boot-to-IPC flows: frame accounting from
//! a loader memory map, VMO map/translate/unmap, vDSO placement, handle
//! token round trips, mailbox handoff, and aggregate load balancing.
//! "Physical memory" is a leaked, page-aligned arena with the physmem
//! window left at the identity offset.

use std::sync::Once;

use rose_kernel::boot_protocol::{MemoryMapEntry, MemoryType};
use rose_kernel::cap::{create_handle, KernelObject, Permissions};
use rose_kernel::ipc::{Mailbox, Message};
use rose_kernel::mm::page_table::{self, MapFlags};
use rose_kernel::mm::pmm::{self, FrameStacks};
use rose_kernel::mm::vas::Vas;
use rose_kernel::mm::vdso;
use rose_kernel::mm::vmo::Vmo;
use rose_kernel::mm::{self, PhysAddr, VirtAddr, PAGE_SIZES};
use rose_kernel::process::Process;
use rose_kernel::sched::{Aggregate, Instance};
use rose_kernel::time::{Timer, TimerBackend};

fn alloc_arena(size: usize, align: usize) -> PhysAddr {
    let layout = std::alloc::Layout::from_size_align(size, align).expect("valid arena layout");
    // SAFETY: non-zero size; leaked on purpose so frame addresses stay
    // valid for the whole test binary.
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    PhysAddr::new(ptr as u64)
}

/// Seed the global frame manager, kernel root, and vDSO image once per
/// test process.
fn seed_globals() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let len = 64 * 1024 * 1024;
        let arena = alloc_arena(len, PAGE_SIZES[1]);
        pmm::initialize(&[MemoryMapEntry {
            physical_start: arena.value(),
            length: len as u64,
            kind: MemoryType::Free,
            attributes: 0,
        }]);

        let root = pmm::pop(0);
        // SAFETY: freshly popped frame, becoming the kernel root.
        unsafe { core::ptr::write_bytes(mm::phys_to_ptr(root), 0, PAGE_SIZES[0]) };
        mm::set_kernel_root(root);

        let vdso_frame = pmm::pop(0);
        vdso::register(Vmo::create_physical(vdso_frame, PAGE_SIZES[0], 0));
    });
}

/// S1: frame accounting for a loader memory map whose 64 MiB span is
/// partly occupied by kernel-owned ranges.
#[test]
fn boot_memory_accounting_matches_the_map() {
    let span = 64 * 1024 * 1024u64;
    let kernel_len = 2 * 1024 * 1024u64;
    let initrd_len = 1024 * 1024u64;
    let log_len = 2 * 1024 * 1024u64;
    let memmap_len = 4096u64;

    let arena = alloc_arena(span as usize, PAGE_SIZES[1]);
    let base = arena.value();
    let used_total = kernel_len + initrd_len + log_len + memmap_len;

    let memmap = [
        MemoryMapEntry {
            physical_start: base,
            length: kernel_len,
            kind: MemoryType::Kernel,
            attributes: 0,
        },
        MemoryMapEntry {
            physical_start: base + kernel_len,
            length: initrd_len,
            kind: MemoryType::Initrd,
            attributes: 0,
        },
        MemoryMapEntry {
            physical_start: base + kernel_len + initrd_len,
            length: log_len,
            kind: MemoryType::LogBuffer,
            attributes: 0,
        },
        MemoryMapEntry {
            physical_start: base + kernel_len + initrd_len + log_len,
            length: memmap_len,
            kind: MemoryType::MemoryMap,
            attributes: 0,
        },
        MemoryMapEntry {
            physical_start: base + used_total,
            length: span - used_total,
            kind: MemoryType::Free,
            attributes: 0,
        },
    ];

    let stacks = FrameStacks::new();
    stacks.initialize(&memmap);

    let report = stacks.report();
    assert_eq!(report.free_bytes, span - used_total);
    assert_eq!(report.used_bytes, used_total);
}

/// S2: sparse VMO committed, mapped, translated per page, then torn
/// down.
#[test]
fn sparse_vmo_map_and_unmap() {
    seed_globals();

    let vmo = Vmo::create_sparse(8 * PAGE_SIZES[0], 0);
    vmo.commit_all();

    let vas = Vas::create(false);
    let mapping = vas.map_vmo(vmo.clone(), VirtAddr::new(0x4000_0000), MapFlags::USER);

    let expected = vmo.frame_at(3 * PAGE_SIZES[0]).expect("committed page");
    assert_eq!(
        page_table::translate(vas.asid(), VirtAddr::new(0x4000_3000)),
        expected
    );

    vas.unmap(&mapping);
    assert!(mapping.is_invalid());

    // Probing the unmapped range is fatal; verified in a child panic.
    let asid = vas.asid().value();
    let probe = std::panic::catch_unwind(move || {
        page_table::translate(PhysAddr::new(asid), VirtAddr::new(0x4000_3000))
    });
    assert!(probe.is_err());
}

/// S3: vDSO placement and reporting.
#[test]
fn vdso_is_visible_and_high() {
    seed_globals();

    let vas = Vas::create(true);
    let base = vas.vdso_base().expect("vDSO mapped at creation");

    assert_eq!(base.value() % 8, 0);
    assert!(base.value() > 0x4000_0000_0000);
    assert!(base.value() < 0x8000_0000_0000);
}

/// S4: handle token round trip in a fresh process.
#[test]
fn handle_token_round_trip() {
    seed_globals();

    let process = Process::create(Vas::create(false)).expect("unclaimed VAS");
    let handle = create_handle(
        KernelObject::Mailbox(Mailbox::create()),
        Permissions::mailbox_default(),
    );

    let token = process.register_for_token(handle.clone());
    assert_ne!(token, 0);

    let resolved = process.get_handle(token).expect("token should resolve");
    assert!(std::sync::Arc::ptr_eq(&resolved, &handle));

    process.unregister_token(token);
    assert!(process.get_handle(token).is_none());
}

/// S5: mailbox handoff on a fresh mailbox.
#[test]
fn mailbox_handoff() {
    let mailbox = Mailbox::create();

    mailbox.send(Message::User { data0: 1, data1: 2 });

    match mailbox.read(0) {
        Ok(Message::User { data0, data1 }) => {
            assert_eq!((data0, data1), (1, 2));
        }
        _ => panic!("first read should see the message"),
    }

    assert!(mailbox.read(0).is_err());
}

/// S6: aggregate placement balances two idle cores, then follows the
/// lower running count.
#[test]
fn aggregate_placement_balances_cores() {
    seed_globals();

    struct InertBackend;
    impl TimerBackend for InertBackend {
        fn counter(&self) -> u64 {
            0
        }
        fn period_femtoseconds(&self) -> u64 {
            1_000_000
        }
        fn arm_after(&self, _nanoseconds: u64) {}
    }
    static BACKEND: InertBackend = InertBackend;

    let aggregate = Aggregate::new();
    let first = Instance::new(0, Box::leak(Box::new(Timer::new(&BACKEND))));
    let second = Instance::new(1, Box::leak(Box::new(Timer::new(&BACKEND))));
    first.initialize();
    second.initialize();
    aggregate.add_child(first.clone());
    aggregate.add_child(second.clone());

    let process = rose_kernel::sched::kernel_process();

    aggregate.schedule(process.create_thread());
    aggregate.schedule(process.create_thread());
    assert_eq!(first.average_load(), 100);
    assert_eq!(second.average_load(), 100);

    // Drain one core; the next placement goes to it.
    second.reschedule();
    assert_eq!(second.average_load(), 0);

    aggregate.schedule(process.create_thread());
    assert_eq!(second.average_load(), 100);
    assert_eq!(first.average_load(), 100);
}
