//! Time subsystem
//!
//! Two logical timers exist per system: a global high-precision timer
//! (HPET-backed) used for user deadlines and kernel timeouts, and one
//! preemption timer per core (LAPIC local timer) owned by the scheduler.
//! This module holds the engine ([`timer`]) and the registry.

pub mod timer;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sync::OnceLock;

pub use timer::{EventToken, Timer, TimerBackend, TimerCallback};

static HIGH_PRECISION: OnceLock<Timer> = OnceLock::new();
static PER_CORE_HPT_AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Pre-timer monotonic source: strictly increasing, nanosecond-shaped,
/// good enough for token mixing and thread stamps until the hardware
/// clock is up (and on the host, where there is no hardware clock).
static FALLBACK_NOW: AtomicU64 = AtomicU64::new(1);

/// Bring up the time subsystem. The architecture layer discovers and
/// registers the actual hardware timers.
pub fn initialize() {
    log::info!("[TIME] Initializing the time subsystem...");
}

/// Rebalance high-precision comparators across the now-live cores.
/// Called once all APs are up.
pub fn initialize_multicore() {
    log::info!("[TIME] Rebalancing timers across available cores...");
    PER_CORE_HPT_AVAILABLE.store(true, Ordering::Relaxed);
}

/// Register the global high-precision timer. Registering a second one is
/// fatal.
pub fn register_high_precision_timer(timer: Timer) {
    if HIGH_PRECISION.set(timer).is_err() {
        panic!("tried to register a high-precision timer with another already registered");
    }
}

/// The global high-precision timer; fatal when none is registered.
pub fn high_precision_timer() -> &'static Timer {
    HIGH_PRECISION
        .get()
        .expect("high-precision timer requested, but not registered")
}

/// The global high-precision timer, if one has been registered.
pub fn try_high_precision_timer() -> Option<&'static Timer> {
    HIGH_PRECISION.get()
}

/// Monotonic now in nanoseconds.
///
/// Reads the high-precision timer once it exists; before that, a bumped
/// counter keeps the clock strictly increasing.
pub fn now_ns() -> u64 {
    match HIGH_PRECISION.get() {
        Some(timer) => timer.now(),
        None => FALLBACK_NOW.fetch_add(1, Ordering::Relaxed),
    }
}
