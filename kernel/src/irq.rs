//! Interrupt vector registry
//!
//! The architecture glue funnels every hardware interrupt into
//! [`dispatch`]; subsystems claim their vectors at initialization.
//! An interrupt with no registered handler is an invariant violation.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Scheduler cross-core poke (C8).
pub const SCHEDULING_TRIGGER: u8 = 0xf1;
/// Cross-core work queue (C9).
pub const IPI_WORK: u8 = 0xf2;
/// Per-core preemption timer (LAPIC local timer).
pub const PREEMPTION_TIMER: u8 = 0xf3;
/// Global high-precision timer (HPET).
pub const HIGH_PRECISION_TIMER: u8 = 0xf4;

/// An interrupt handler; receives the vector it was registered under.
pub type IrqHandler = fn(u8);

static HANDLERS: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

/// Claim a vector. Double registration is fatal.
pub fn register_handler(vector: u8, handler: IrqHandler) {
    let previous = HANDLERS[vector as usize].swap(handler as usize, Ordering::AcqRel);
    if previous != 0 {
        panic!("IRQ vector {:#x} registered twice", vector);
    }
}

/// Route an interrupt to its handler; an unclaimed vector is fatal.
pub fn dispatch(vector: u8) {
    let raw = HANDLERS[vector as usize].load(Ordering::Acquire);
    if raw == 0 {
        panic!("interrupt on unknown vector {:#x}", vector);
    }

    // SAFETY: the slot was written by register_handler with a valid
    // IrqHandler function pointer and never cleared.
    let handler: IrqHandler = unsafe { core::mem::transmute(raw) };
    handler(vector);
}
