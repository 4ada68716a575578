//! Threads
//!
//! A thread exists only inside a process. It carries the saved CPU
//! context, the logical id of the core it last ran on, and the
//! last-scheduled timestamp the per-core run heaps order by.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::sync::Arc;

use spin::Mutex;

use crate::arch::Context;
use crate::time;

use super::Process;

/// Sentinel for "not placed on any core yet".
pub const NO_CORE: u32 = u32::MAX;

/// One schedulable thread.
pub struct Thread {
    process: Arc<Process>,
    context: Mutex<Context>,
    /// Last-scheduled stamp in nanoseconds; older stamps run first.
    timestamp: AtomicU64,
    /// Logical id of the owning core.
    core: AtomicU32,
}

impl Thread {
    /// Create a thread in `process`, stamped with the current time.
    pub fn new(process: Arc<Process>) -> Arc<Self> {
        Arc::new(Self {
            process,
            context: Mutex::new(Context::default()),
            timestamp: AtomicU64::new(time::now_ns()),
            core: AtomicU32::new(NO_CORE),
        })
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// The saved register file. Syscall and interrupt glue swap through
    /// this on thread switches.
    pub fn context(&self) -> &Mutex<Context> {
        &self.context
    }

    pub fn set_context(&self, context: Context) {
        *self.context.lock() = context;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub fn stamp_now(&self) {
        self.timestamp.store(time::now_ns(), Ordering::Relaxed);
    }

    pub fn set_timestamp(&self, ns: u64) {
        self.timestamp.store(ns, Ordering::Relaxed);
    }

    pub fn owning_core(&self) -> u32 {
        self.core.load(Ordering::Relaxed)
    }

    pub fn set_owning_core(&self, core: u32) {
        self.core.store(core, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::vas::Vas;
    use crate::test_support;

    #[test]
    fn threads_carry_their_process_and_stamp() {
        test_support::ensure_global_frames();
        let _pmm = test_support::lock_pmm();

        let process = Process::with_vas(Vas::create(false));
        let thread = process.create_thread();

        assert!(Arc::ptr_eq(thread.process(), &process));
        assert_eq!(thread.owning_core(), NO_CORE);

        let before = thread.timestamp();
        thread.stamp_now();
        assert!(thread.timestamp() >= before);
    }
}
