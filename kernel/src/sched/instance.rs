//! Per-core scheduler instance
//!
//! Each core owns one instance: a run heap of threads ordered by
//! last-scheduled timestamp (oldest first), the core's dedicated idle
//! thread, and the currently running thread. A preemption timer drives
//! `reschedule` every quantum while runnable threads are queued.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BinaryHeap;
use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::intrinsics;
use crate::process::Thread;
use crate::smp;
use crate::time::{EventToken, Timer};

/// Preemption quantum: 10 ms.
pub const QUANTUM_NS: u64 = 10_000_000;

/// FIFO tie-break for equal timestamps.
static ARRIVAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Heap entry: timestamp snapshot at enqueue time plus arrival order.
struct RunnableRef {
    stamp: u64,
    seq: u64,
    thread: Arc<Thread>,
}

impl PartialEq for RunnableRef {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp && self.seq == other.seq
    }
}

impl Eq for RunnableRef {}

impl PartialOrd for RunnableRef {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunnableRef {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // Max-heap inversion: the oldest stamp (then earliest arrival)
        // is picked first.
        (other.stamp, other.seq).cmp(&(self.stamp, self.seq))
    }
}

struct InstanceInner {
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    run_queue: BinaryHeap<RunnableRef>,
    preemption_token: Option<EventToken>,
}

/// One core's scheduler.
pub struct Instance {
    core_id: u32,
    preemption_timer: &'static Timer,
    self_ref: Weak<Instance>,
    inner: Mutex<InstanceInner>,
}

impl Instance {
    pub fn new(core_id: u32, preemption_timer: &'static Timer) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core_id,
            preemption_timer,
            self_ref: self_ref.clone(),
            inner: Mutex::new(InstanceInner {
                current: None,
                idle: None,
                run_queue: BinaryHeap::new(),
                preemption_token: None,
            }),
        })
    }

    /// Create this core's idle thread (owned by the kernel process) and
    /// make it current. Called once during scheduler bring-up.
    pub fn initialize(&self) {
        let idle = super::kernel_process().create_thread();
        idle.set_owning_core(self.core_id);
        idle.set_context(crate::arch::Context::kernel_entry(idle_main as usize as u64, 0));

        let mut inner = self.inner.lock();
        inner.idle = Some(idle.clone());
        inner.current = Some(idle);
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    /// Thread count scaled to a load figure the aggregate compares.
    pub fn average_load(&self) -> usize {
        self.inner.lock().run_queue.len() * 100
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.inner.lock().current.clone()
    }

    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.inner.lock().idle.clone()
    }

    /// Enqueue a runnable thread on this core.
    ///
    /// Meant for interrupt and syscall contexts: calling it with
    /// interrupts enabled is fatal, as is re-queueing the thread that is
    /// currently running here.
    pub fn schedule(&self, thread: Arc<Thread>) {
        if intrinsics::interrupts_enabled() {
            panic!(
                "scheduler::schedule called with interrupts enabled (it is meant \
                 for interrupt and syscall handlers)"
            );
        }

        let mut inner = self.inner.lock();

        if let Some(current) = &inner.current {
            if Arc::ptr_eq(current, &thread) {
                panic!("rescheduling the currently running thread");
            }
        }

        thread.set_owning_core(self.core_id);
        inner.run_queue.push(RunnableRef {
            stamp: thread.timestamp(),
            seq: ARRIVAL_SEQ.fetch_add(1, Ordering::Relaxed),
            thread,
        });

        self.setup_preemption(&mut inner);
    }

    /// Take the running thread off this core; the caller re-queues it on
    /// a wait queue elsewhere. Picks the next runnable (or idle) thread.
    pub fn deschedule(&self) -> Arc<Thread> {
        let mut inner = self.inner.lock();

        let departing = inner
            .current
            .take()
            .expect("deschedule on a core with no running thread");
        departing.stamp_now();

        self.reschedule_locked(&mut inner);

        departing
    }

    /// IPI entry: another core enqueued work here; refresh preemption.
    pub fn scheduling_trigger(&self) {
        let mut inner = self.inner.lock();
        self.setup_preemption(&mut inner);
    }

    /// Preemption tick: rotate the running thread through the heap.
    pub fn reschedule(&self) {
        let mut inner = self.inner.lock();
        self.reschedule_locked(&mut inner);
    }

    fn reschedule_locked(&self, inner: &mut InstanceInner) {
        let previous = inner.current.take();

        // The departing thread goes back on the heap unless it is the
        // idle thread, which is never queued.
        if let Some(thread) = &previous {
            let is_idle = inner
                .idle
                .as_ref()
                .map(|idle| Arc::ptr_eq(idle, thread))
                .unwrap_or(false);
            if !is_idle {
                thread.stamp_now();
                inner.run_queue.push(RunnableRef {
                    stamp: thread.timestamp(),
                    seq: ARRIVAL_SEQ.fetch_add(1, Ordering::Relaxed),
                    thread: thread.clone(),
                });
            }
        }

        let next = match inner.run_queue.pop() {
            Some(entry) => entry.thread,
            None => inner
                .idle
                .clone()
                .expect("reschedule on an uninitialized scheduler instance"),
        };

        // Swap the address space if the incoming thread lives elsewhere.
        let old_asid = previous.map(|thread| thread.process().vas().asid());
        let new_asid = next.process().vas().asid();
        if old_asid != Some(new_asid) {
            // SAFETY: the incoming thread's VAS is live and shares the
            // kernel upper half; this is the architectural switch point.
            unsafe { crate::arch::set_asid(new_asid) };
        }

        inner.current = Some(next);

        self.setup_preemption(inner);
    }

    fn setup_preemption(&self, inner: &mut InstanceInner) {
        // Work queued from another core: poke the owner so its next
        // reschedule picks it up.
        if smp::current_core_id() != Some(self.core_id) {
            smp::send_scheduling_ipi(self.core_id);
        }

        if !inner.run_queue.is_empty() {
            if let Some(token) = inner.preemption_token.take() {
                token.cancel();
            }

            let context = Weak::into_raw(self.self_ref.clone()) as usize;
            match self
                .preemption_timer
                .one_shot(QUANTUM_NS, preemption_tick, context)
            {
                Ok(token) => inner.preemption_token = Some(token),
                Err(_) => {
                    // SAFETY: the registration failed, so the callback
                    // will never consume this weak reference.
                    drop(unsafe { Weak::from_raw(context as *const Instance) });
                }
            }
        }
    }
}

/// Timer-context preemption entry.
fn preemption_tick(context: usize) {
    // SAFETY: the context is the raw Weak<Instance> leaked when the
    // one-shot was armed; the callback runs at most once and consumes it.
    let instance = unsafe { Weak::from_raw(context as *const Instance) };
    if let Some(instance) = instance.upgrade() {
        instance.reschedule();
    }
}

/// The idle loop every core falls back to.
fn idle_main() -> ! {
    loop {
        intrinsics::halt();
    }
}
