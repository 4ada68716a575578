//! Multi-core scheduler
//!
//! An aggregate node balances newly runnable threads across one
//! [`Instance`] per core by lowest load; instances own per-core run
//! heaps ordered by last-scheduled timestamp and preempt on a 10 ms
//! quantum. Cross-core placement is observed by the target no later than
//! the delivery of its scheduling-trigger IPI.

mod instance;

pub use instance::{Instance, QUANTUM_NS};

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::intrinsics;
use crate::mm;
use crate::mm::vas::Vas;
use crate::process::{Process, Thread};
use crate::smp;
use crate::sync::{InterruptGuard, OnceLock};

/// Root of the scheduler topology: one node whose children are the
/// per-core instances.
pub struct Aggregate {
    children: Mutex<Vec<Arc<Instance>>>,
}

impl Aggregate {
    pub const fn new() -> Self {
        Self {
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn add_child(&self, child: Arc<Instance>) {
        self.children.lock().push(child);
    }

    /// Mean of the children's load figures.
    pub fn average_load(&self) -> usize {
        let children = self.children.lock();
        if children.is_empty() {
            return 0;
        }
        let total: usize = children.iter().map(|child| child.average_load()).sum();
        total / children.len()
    }

    /// Place a thread on the least-loaded child.
    pub fn schedule(&self, thread: Arc<Thread>) {
        let target = {
            let children = self.children.lock();

            let mut lowest: Option<(usize, &Arc<Instance>)> = None;
            for child in children.iter() {
                let load = child.average_load();
                if lowest.map(|(best, _)| load < best).unwrap_or(true) {
                    lowest = Some((load, child));
                }
            }

            match lowest {
                Some((_, child)) => child.clone(),
                None => panic!("didn't find any candidate scheduler instances"),
            }
        };

        target.schedule(thread);
    }
}

static AGGREGATE: Aggregate = Aggregate::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static KERNEL_PROCESS: OnceLock<Arc<Process>> = OnceLock::new();

/// The kernel's implicit process: the adopted boot address space with no
/// claim, owner of every idle thread.
pub fn kernel_process() -> Arc<Process> {
    KERNEL_PROCESS
        .get_or_init(|| Process::with_vas(Vas::adopt_existing_asid(mm::kernel_root())))
        .clone()
}

/// Create a process over an address space, claiming it. `None` when the
/// VAS is already claimed.
pub fn create_process(address_space: Arc<Vas>) -> Option<Arc<Process>> {
    Process::create(address_space)
}

/// Bring up the per-core schedulers once all cores are online.
pub fn initialize() {
    log::info!("[SCHED] Initializing scheduler...");

    for core in smp::cores() {
        let scheduler = core.scheduler();
        scheduler.initialize();
        AGGREGATE.add_child(scheduler.clone());
    }

    crate::irq::register_handler(crate::irq::SCHEDULING_TRIGGER, |_vector| {
        if let Some(core) = smp::current_core() {
            core.scheduler().scheduling_trigger();
        }
    });

    INITIALIZED.store(true, Ordering::Relaxed);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Relaxed)
}

/// The global aggregate scheduler.
pub fn aggregate() -> &'static Aggregate {
    &AGGREGATE
}

/// Make a thread runnable somewhere in the system. Safe from syscall and
/// interrupt context alike; interrupts are gated for the placement.
pub fn schedule(thread: Arc<Thread>) {
    let _interrupts = InterruptGuard::new();
    AGGREGATE.schedule(thread);
}

/// Make a thread runnable from a context with interrupts enabled by
/// bouncing the placement through this core's own IPI queue.
pub fn post_schedule(thread: Arc<Thread>) {
    if !intrinsics::interrupts_enabled() && cfg!(target_os = "none") {
        panic!(
            "scheduler::post_schedule called with interrupts disabled (it is meant \
             for thread context)"
        );
    }

    let context = Arc::into_raw(thread) as usize;
    let target = smp::current_core_id().unwrap_or(0);
    smp::mp::parallel_execute(smp::mp::Policy::Specific(target), schedule_from_ipi, context);
}

fn schedule_from_ipi(context: usize) {
    // SAFETY: the context is the raw Arc<Thread> leaked by post_schedule;
    // the work item runs exactly once and consumes it.
    let thread = unsafe { Arc::from_raw(context as *const Thread) };
    schedule(thread);
}

/// The thread running on the calling core, if the scheduler is up.
pub fn try_current_thread() -> Option<Arc<Thread>> {
    smp::current_core().and_then(|core| core.scheduler().current_thread())
}

/// Park the calling thread: take it off its core and run someone else.
/// The caller has already queued the thread on a wait queue elsewhere.
pub fn block_current() {
    if let Some(core) = smp::current_core() {
        let _interrupts = InterruptGuard::new();
        let _parked = core.scheduler().deschedule();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support::{self, ManualBackend};
    use crate::time::Timer;
    use alloc::boxed::Box;

    fn fresh_instance(core_id: u32) -> Arc<Instance> {
        let backend: &'static ManualBackend = Box::leak(Box::new(ManualBackend::new()));
        let timer: &'static Timer = Box::leak(Box::new(Timer::new(backend)));
        let instance = Instance::new(core_id, timer);
        instance.initialize();
        instance
    }

    #[test]
    fn aggregate_balances_to_the_least_loaded_core() {
        test_support::ensure_global_frames();

        let aggregate = Aggregate::new();
        let first = fresh_instance(10);
        let second = fresh_instance(11);
        aggregate.add_child(first.clone());
        aggregate.add_child(second.clone());

        let t1 = kernel_process().create_thread();
        let t2 = kernel_process().create_thread();
        let t3 = kernel_process().create_thread();

        // Two idle cores: the first two threads land on different cores.
        aggregate.schedule(t1);
        aggregate.schedule(t2);
        assert_eq!(first.average_load(), 100);
        assert_eq!(second.average_load(), 100);
        assert_eq!(aggregate.average_load(), 100);

        // Preempting the first core moves its queued thread into the
        // running slot; the third placement follows the lower count.
        first.reschedule();
        assert_eq!(first.average_load(), 0);

        aggregate.schedule(t3);
        assert_eq!(first.average_load(), 100);
        assert_eq!(second.average_load(), 100);
    }

    #[test]
    #[should_panic(expected = "candidate scheduler instances")]
    fn scheduling_with_no_instances_is_fatal() {
        test_support::ensure_global_frames();

        let aggregate = Aggregate::new();
        let thread = kernel_process().create_thread();
        aggregate.schedule(thread);
    }
}
