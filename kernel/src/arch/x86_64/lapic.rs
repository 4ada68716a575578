//! Local APIC access
//!
//! Register I/O for the per-core interrupt controller: identification,
//! IPI delivery (fixed, INIT, SIPI), end-of-interrupt, and the local
//! timer the scheduler uses for preemption. The LAPIC timer counts down,
//! so the preemption backend pairs the TSC (as the monotonic counter)
//! with the LAPIC one-shot for arming.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::time::TimerBackend;

/// LAPIC MMIO base; identity across cores, each sees its own device.
const LAPIC_BASE: u64 = 0xfee0_0000;

const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xb0;
const REG_SPURIOUS: u64 = 0xf0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_DIVIDE: u64 = 0x3e0;

const ICR_INIT: u32 = 0x500;
const ICR_SIPI: u32 = 0x600;
const ICR_ASSERT: u32 = 0x4000;
const ICR_BROADCAST_OTHERS: u32 = 0xc0000;

#[cfg(target_os = "none")]
fn read_reg(offset: u64) -> u32 {
    // SAFETY: the LAPIC page is mapped by the boot path; register reads
    // are side-effect free except EOI, which is write-only anyway.
    unsafe {
        ((crate::mm::phys_to_ptr(crate::mm::PhysAddr::new(LAPIC_BASE + offset))) as *const u32)
            .read_volatile()
    }
}

#[cfg(target_os = "none")]
fn write_reg(offset: u64, value: u32) {
    // SAFETY: the LAPIC page is mapped by the boot path and the caller
    // writes architecturally defined values.
    unsafe {
        ((crate::mm::phys_to_ptr(crate::mm::PhysAddr::new(LAPIC_BASE + offset))) as *mut u32)
            .write_volatile(value);
    }
}

/// APIC id of the calling core.
pub fn current_apic_id() -> u32 {
    #[cfg(target_os = "none")]
    {
        read_reg(REG_ID) >> 24
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Program the spurious vector and the one-shot timer LVT on this core.
pub fn initialize_local() {
    #[cfg(target_os = "none")]
    {
        write_reg(REG_SPURIOUS, 0x1ff);
        write_reg(REG_LVT_TIMER, crate::irq::PREEMPTION_TIMER as u32);
        write_reg(REG_TIMER_DIVIDE, 0b1011); // divide by 1
    }
}

/// Signal end-of-interrupt for the in-service vector.
pub fn end_of_interrupt() {
    #[cfg(target_os = "none")]
    write_reg(REG_EOI, 0);
}

#[cfg(target_os = "none")]
fn send_icr(apic_id: u32, low: u32) {
    write_reg(REG_ICR_HIGH, apic_id << 24);
    write_reg(REG_ICR_LOW, low);
    while read_reg(REG_ICR_LOW) & (1 << 12) != 0 {
        crate::intrinsics::pause();
    }
}

/// Fixed-vector IPI to one core.
pub fn send_ipi(apic_id: u32, vector: u8) {
    #[cfg(target_os = "none")]
    send_icr(apic_id, vector as u32 | ICR_ASSERT);
    #[cfg(not(target_os = "none"))]
    {
        let _ = (apic_id, vector);
    }
}

/// Fixed-vector IPI to every core but this one.
pub fn broadcast_ipi(vector: u8) {
    #[cfg(target_os = "none")]
    send_icr(0, vector as u32 | ICR_ASSERT | ICR_BROADCAST_OTHERS);
    #[cfg(not(target_os = "none"))]
    {
        let _ = vector;
    }
}

/// INIT IPI, the first step of waking an AP.
pub fn send_init_ipi(apic_id: u32) {
    #[cfg(target_os = "none")]
    send_icr(apic_id, ICR_INIT | ICR_ASSERT);
    #[cfg(not(target_os = "none"))]
    {
        let _ = apic_id;
    }
}

/// Startup IPI pointing the AP at `page` (a 4 KiB-aligned sub-1 MiB
/// physical page number).
pub fn send_startup_ipi(apic_id: u32, page: u32) {
    #[cfg(target_os = "none")]
    send_icr(apic_id, ICR_SIPI | ICR_ASSERT | (page & 0xff));
    #[cfg(not(target_os = "none"))]
    {
        let _ = (apic_id, page);
    }
}

/// TSC period in femtoseconds, calibrated once during boot.
static TSC_PERIOD_FS: AtomicU64 = AtomicU64::new(1_000_000);
/// LAPIC timer ticks per nanosecond (scaled by 2^16), calibrated once.
static LAPIC_TICKS_PER_NS_X16: AtomicU64 = AtomicU64::new(1 << 16);

/// Record the boot-time calibration results.
pub fn set_calibration(tsc_period_fs: u64, lapic_ticks_per_ns_x16: u64) {
    TSC_PERIOD_FS.store(tsc_period_fs, Ordering::Relaxed);
    LAPIC_TICKS_PER_NS_X16.store(lapic_ticks_per_ns_x16, Ordering::Relaxed);
}

/// Preemption-timer backend: TSC as the monotonic counter, LAPIC
/// one-shot as the alarm. Each core reads its own device through the
/// same statics.
struct LapicTimerBackend;

impl TimerBackend for LapicTimerBackend {
    fn counter(&self) -> u64 {
        crate::intrinsics::rdtsc()
    }

    fn period_femtoseconds(&self) -> u64 {
        TSC_PERIOD_FS.load(Ordering::Relaxed)
    }

    fn arm_after(&self, nanoseconds: u64) {
        #[cfg(target_os = "none")]
        {
            let ticks =
                (nanoseconds as u128 * LAPIC_TICKS_PER_NS_X16.load(Ordering::Relaxed) as u128)
                    >> 16;
            write_reg(REG_TIMER_INITIAL, (ticks as u64).clamp(1, u32::MAX as u64) as u32);
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = nanoseconds;
        }
    }
}

static TIMER_BACKEND: LapicTimerBackend = LapicTimerBackend;

/// The shared preemption-timer backend.
pub fn timer_backend() -> &'static dyn TimerBackend {
    &TIMER_BACKEND
}
