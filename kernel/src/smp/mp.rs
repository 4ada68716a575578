//! Cross-core work execution
//!
//! `parallel_execute` enqueues a work item on the target cores' IPI
//! queues, fires the IPI, and spins on a counter of outstanding replies,
//! draining its own queue while it waits so two cores executing on each
//! other cannot deadlock. TLB shootdowns ride on it: the call returns
//! only after every targeted core has run the item.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::intrinsics;

use super::{broadcast_work_ipi, cores, current_core, current_core_id, send_work_ipi};

/// Which cores a work item targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    All,
    Specific(u32),
}

impl Policy {
    fn matches(self, logical_id: u32) -> bool {
        match self {
            Policy::All => true,
            Policy::Specific(target) => target == logical_id,
        }
    }
}

/// One unit of cross-core work; lives on the initiating core's stack
/// until every target has acknowledged.
struct WorkState {
    func: fn(usize),
    context: usize,
    unfinished: AtomicUsize,
}

/// Per-core queue of pending work items (stored as `WorkState`
/// addresses, valid until acknowledged).
pub struct IpiQueue {
    items: Mutex<VecDeque<usize>>,
}

impl IpiQueue {
    pub const fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, state: *const WorkState) {
        self.items.lock().push_back(state as usize);
    }

    /// Run queued items until the queue is empty. Called from the IPI
    /// handler and from initiators waiting on their own items.
    pub fn drain(&self) {
        loop {
            let item = self.items.lock().pop_front();
            let Some(addr) = item else { return };

            // SAFETY: the address was pushed by parallel_execute, whose
            // stack frame spins until `unfinished` hits zero; the state
            // is alive until this decrement.
            let state = unsafe { &*(addr as *const WorkState) };
            (state.func)(state.context);
            state.unfinished.fetch_sub(1, Ordering::Release);
        }
    }
}

impl Default for IpiQueue {
    fn default() -> Self {
        Self::new()
    }
}

static PARALLEL_READY: AtomicBool = AtomicBool::new(false);

/// Wire the IPI-work vector to queue draining. Called once after all
/// cores are registered.
pub fn initialize_parallel() {
    crate::irq::register_handler(crate::irq::IPI_WORK, |_vector| {
        if let Some(core) = current_core() {
            core.ipi_queue().drain();
        }
    });

    PARALLEL_READY.store(true, Ordering::Release);
    log::info!("[MP] Cross-core execution initialized");
}

pub fn is_parallel_ready() -> bool {
    PARALLEL_READY.load(Ordering::Acquire)
}

/// Run `func(context)` on the cores selected by `policy` and return once
/// every one of them has finished.
///
/// Before the cross-core runtime is up (or without a resolvable current
/// core, as on the host) the call degrades to a direct local invocation.
pub fn parallel_execute(policy: Policy, func: fn(usize), context: usize) {
    let initiator = current_core();

    if !is_parallel_ready() || initiator.is_none() || cores().len() <= 1 {
        func(context);
        return;
    }
    let initiator = initiator.expect("checked above");

    let state = WorkState {
        func,
        context,
        unfinished: AtomicUsize::new(0),
    };

    for core in cores() {
        if policy.matches(core.logical_id()) {
            state.unfinished.fetch_add(1, Ordering::Relaxed);
            core.ipi_queue().push(&state);
        }
    }

    match policy {
        Policy::All => broadcast_work_ipi(),
        Policy::Specific(target) => {
            if Some(target) != current_core_id() {
                send_work_ipi(target);
            }
        }
    }

    while state.unfinished.load(Ordering::Acquire) != 0 {
        initiator.ipi_queue().drain();
        intrinsics::pause();
    }
}

/// System-wide TLB flush, completed before this returns.
pub fn tlb_flush_broadcast() {
    fn flush(_context: usize) {
        crate::arch::flush_local_tlb();
    }

    parallel_execute(Policy::All, flush, 0);
}
