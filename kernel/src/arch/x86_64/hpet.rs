//! HPET driver
//!
//! Backs the system's high-precision timer: a free-running main counter
//! with a femtosecond period reported in the capabilities register, and
//! comparator 0 programmed for one-shot deadlines. Failing to bring up a
//! comparator at boot is fatal.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::time::{self, Timer, TimerBackend};

const REG_CAPABILITIES: u64 = 0x00;
const REG_CONFIG: u64 = 0x10;
const REG_MAIN_COUNTER: u64 = 0xf0;
const REG_TIMER0_CONFIG: u64 = 0x100;
const REG_TIMER0_COMPARATOR: u64 = 0x108;

const CONFIG_ENABLE: u64 = 1 << 0;
const TIMER_CONFIG_INT_ENABLE: u64 = 1 << 2;

static HPET_BASE: AtomicU64 = AtomicU64::new(0);
static PERIOD_FS: AtomicU64 = AtomicU64::new(1_000_000);

#[cfg(target_os = "none")]
fn read_reg(offset: u64) -> u64 {
    let base = HPET_BASE.load(Ordering::Relaxed);
    // SAFETY: `initialize` stored a mapped HPET base before any reads.
    unsafe {
        ((crate::mm::phys_to_ptr(crate::mm::PhysAddr::new(base + offset))) as *const u64)
            .read_volatile()
    }
}

#[cfg(target_os = "none")]
fn write_reg(offset: u64, value: u64) {
    let base = HPET_BASE.load(Ordering::Relaxed);
    // SAFETY: `initialize` stored a mapped HPET base; the caller writes
    // architecturally defined values.
    unsafe {
        ((crate::mm::phys_to_ptr(crate::mm::PhysAddr::new(base + offset))) as *mut u64)
            .write_volatile(value);
    }
}

/// The high-precision backend over the HPET main counter.
struct HpetBackend;

impl TimerBackend for HpetBackend {
    fn counter(&self) -> u64 {
        #[cfg(target_os = "none")]
        {
            read_reg(REG_MAIN_COUNTER)
        }
        #[cfg(not(target_os = "none"))]
        {
            0
        }
    }

    fn period_femtoseconds(&self) -> u64 {
        PERIOD_FS.load(Ordering::Relaxed)
    }

    fn arm_after(&self, nanoseconds: u64) {
        #[cfg(target_os = "none")]
        {
            let ticks = (nanoseconds as u128 * 1_000_000 / self.period_femtoseconds() as u128)
                .max(1) as u64;
            write_reg(
                REG_TIMER0_COMPARATOR,
                read_reg(REG_MAIN_COUNTER).wrapping_add(ticks),
            );
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = nanoseconds;
        }
    }
}

static BACKEND: HpetBackend = HpetBackend;

/// Bring up the HPET found at `base` (from the platform tables), start
/// its main counter, enable comparator 0, and register the global
/// high-precision timer over it.
pub fn initialize(base: crate::mm::PhysAddr) {
    HPET_BASE.store(base.value(), Ordering::Relaxed);

    #[cfg(target_os = "none")]
    {
        let capabilities = read_reg(REG_CAPABILITIES);
        let period = capabilities >> 32;
        if period == 0 {
            panic!("HPET reports a zero counter period");
        }
        PERIOD_FS.store(period, Ordering::Relaxed);

        let comparator_count = ((capabilities >> 8) & 0x1f) + 1;
        if comparator_count == 0 {
            panic!("failed to initialize any HPET comparator");
        }

        write_reg(
            REG_TIMER0_CONFIG,
            read_reg(REG_TIMER0_CONFIG) | TIMER_CONFIG_INT_ENABLE,
        );
        write_reg(REG_CONFIG, read_reg(REG_CONFIG) | CONFIG_ENABLE);
    }

    time::register_high_precision_timer(Timer::new(&BACKEND));

    crate::irq::register_handler(crate::irq::HIGH_PRECISION_TIMER, |_vector| {
        time::high_precision_timer().process_expired();
        super::lapic::end_of_interrupt();
    });

    log::info!(
        "[TIME] HPET online, period {} fs",
        PERIOD_FS.load(Ordering::Relaxed)
    );
}
