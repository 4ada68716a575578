//! Timer engine
//!
//! A timer is a min-heap of one-shot callback descriptors over a hardware
//! backend. `now()` converts the backend's tick counter to nanoseconds
//! through its femtosecond period with 128-bit intermediate arithmetic;
//! the interrupt path pops every due descriptor, invokes the ones still
//! valid, and re-arms the hardware for the next deadline. Cancellation
//! just clears a flag and is safe from any context.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::BinaryHeap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelResult, TimeError};
use crate::sync::InterruptGuard;

/// Callback invoked when a descriptor fires. Plain function pointers so
/// descriptors stay allocation-light; the context word travels with the
/// registration.
pub type TimerCallback = fn(usize);

/// Hardware behind a [`Timer`]: a tick counter with a fixed period and a
/// programmable one-shot interrupt.
pub trait TimerBackend: Send + Sync {
    /// Current tick count.
    fn counter(&self) -> u64;
    /// Femtoseconds per tick.
    fn period_femtoseconds(&self) -> u64;
    /// Program the next interrupt `nanoseconds` from now.
    fn arm_after(&self, nanoseconds: u64);
}

/// The top bit of a descriptor id distinguishes periodic registrations
/// from one-shots inside the heap. It is internal to the timer; handle
/// tokens never carry it.
const PERIODIC_TAG: u64 = 1 << 63;

struct Descriptor {
    id: u64,
    trigger_ns: u64,
    callback: TimerCallback,
    context: usize,
    valid: AtomicBool,
}

/// Cancellation token for a registered callback.
///
/// `cancel` is wait-free: the descriptor stays in the heap until its
/// deadline passes, but the callback is skipped.
pub struct EventToken {
    descriptor: Arc<Descriptor>,
}

impl EventToken {
    pub fn cancel(&self) {
        self.descriptor.valid.store(false, Ordering::Relaxed);
    }
}

struct HeapEntry(Arc<Descriptor>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.trigger_ns == other.0.trigger_ns && self.0.id == other.0.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        (other.0.trigger_ns, other.0.id).cmp(&(self.0.trigger_ns, self.0.id))
    }
}

struct TimerInner {
    heap: BinaryHeap<HeapEntry>,
    next_id: u64,
}

/// A virtual timer device over one hardware backend.
pub struct Timer {
    backend: &'static dyn TimerBackend,
    inner: Mutex<TimerInner>,
}

impl Timer {
    pub fn new(backend: &'static dyn TimerBackend) -> Self {
        Self {
            backend,
            inner: Mutex::new(TimerInner {
                heap: BinaryHeap::new(),
                next_id: 0,
            }),
        }
    }

    fn counter_to_ns(&self, counter: u64) -> u64 {
        (counter as u128 * self.backend.period_femtoseconds() as u128 / 1_000_000) as u64
    }

    /// Current monotonic time in nanoseconds.
    pub fn now(&self) -> u64 {
        let _interrupts = InterruptGuard::new();
        let _inner = self.inner.lock();
        self.counter_to_ns(self.backend.counter())
    }

    /// Register `callback(context)` to fire `after_ns` from now.
    pub fn one_shot(
        &self,
        after_ns: u64,
        callback: TimerCallback,
        context: usize,
    ) -> KernelResult<EventToken> {
        let descriptor = {
            let _interrupts = InterruptGuard::new();
            let mut inner = self.inner.lock();

            let now = self.counter_to_ns(self.backend.counter());

            inner.next_id += 1;
            if inner.next_id & PERIODIC_TAG != 0 {
                return Err(TimeError::IdExhausted.into());
            }

            let descriptor = Arc::new(Descriptor {
                id: inner.next_id,
                trigger_ns: now.saturating_add(after_ns),
                callback,
                context,
                valid: AtomicBool::new(true),
            });
            inner.heap.push(HeapEntry(descriptor.clone()));
            descriptor
        };

        self.schedule_next();

        Ok(EventToken { descriptor })
    }

    /// Interrupt path: fire everything due, then re-arm for the next
    /// deadline. Callbacks run without the timer lock held, so they may
    /// register new events on this same timer.
    pub fn process_expired(&self) {
        loop {
            let due = {
                let _interrupts = InterruptGuard::new();
                let mut inner = self.inner.lock();
                let now = self.counter_to_ns(self.backend.counter());

                match inner.heap.peek() {
                    Some(top) if top.0.trigger_ns <= now => {
                        inner.heap.pop().map(|entry| entry.0)
                    }
                    _ => None,
                }
            };

            let Some(descriptor) = due else { break };

            if descriptor.id & PERIODIC_TAG != 0 {
                panic!("periodic timer events are not implemented");
            }

            if descriptor.valid.load(Ordering::Relaxed) {
                (descriptor.callback)(descriptor.context);
            }
        }

        self.schedule_next();
    }

    fn schedule_next(&self) {
        let _interrupts = InterruptGuard::new();
        let inner = self.inner.lock();

        if let Some(top) = inner.heap.peek() {
            let now = self.counter_to_ns(self.backend.counter());
            self.backend
                .arm_after(top.0.trigger_ns.saturating_sub(now).max(1));
        }
    }

    /// Number of descriptors still queued (fired or not yet due ones
    /// included until their turn comes).
    pub fn pending(&self) -> usize {
        self.inner.lock().heap.len()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    use crate::test_support::ManualBackend;

    fn manual_timer() -> (&'static ManualBackend, Timer) {
        let backend: &'static ManualBackend = alloc::boxed::Box::leak(alloc::boxed::Box::new(ManualBackend::new()));
        (backend, Timer::new(backend))
    }

    fn bump_callback(context: usize) {
        // SAFETY: tests pass the address of a test-local AtomicU64 that
        // outlives the timer interactions.
        let counter = unsafe { &*(context as *const AtomicU64) };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn now_is_monotonic() {
        let (backend, timer) = manual_timer();

        let a = timer.now();
        let b = timer.now();
        backend.advance(25);
        let c = timer.now();

        assert!(a <= b);
        assert!(b < c);
        assert_eq!(c - a, 25);
    }

    #[test]
    fn one_shot_fires_once_due() {
        let (backend, timer) = manual_timer();
        let fired = AtomicU64::new(0);

        let _token = timer
            .one_shot(100, bump_callback, &fired as *const _ as usize)
            .unwrap();

        timer.process_expired();
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        backend.advance(99);
        timer.process_expired();
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        backend.advance(1);
        timer.process_expired();
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // Fired descriptors leave the heap; no double invocation.
        backend.advance(1000);
        timer.process_expired();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn expiry_runs_in_deadline_order() {
        let (backend, timer) = manual_timer();
        static ORDER: AtomicU64 = AtomicU64::new(0);

        fn first(context: usize) {
            let slot = unsafe { &*(context as *const AtomicU64) };
            slot.store(ORDER.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        }

        let a = AtomicU64::new(u64::MAX);
        let b = AtomicU64::new(u64::MAX);

        // Register out of order; the earlier deadline must fire first.
        let _tb = timer.one_shot(200, first, &b as *const _ as usize).unwrap();
        let _ta = timer.one_shot(50, first, &a as *const _ as usize).unwrap();

        backend.advance(500);
        timer.process_expired();

        assert!(a.load(Ordering::Relaxed) < b.load(Ordering::Relaxed));
    }

    #[test]
    fn cancel_then_fire_skips_the_callback() {
        let (backend, timer) = manual_timer();
        let fired = AtomicU64::new(0);

        let token = timer
            .one_shot(10, bump_callback, &fired as *const _ as usize)
            .unwrap();
        token.cancel();

        backend.advance(100);
        timer.process_expired();

        assert_eq!(fired.load(Ordering::Relaxed), 0);
        assert_eq!(timer.pending(), 0);
    }
}
