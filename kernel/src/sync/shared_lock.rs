//! Reader/writer spin lock with manually paired release
//!
//! Mapping records need a reader lock whose guard travels inside another
//! object (the syscall layer's user-region guard owns an `Arc` of the
//! mapping it locked). A borrowing guard cannot do that, so this lock
//! exposes explicit acquire/release halves; the owning types pair them in
//! their own constructors and `Drop` impls.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::intrinsics;

const WRITER: usize = 1 << (usize::BITS - 1);

/// Reader-count + writer-bit spin lock.
pub struct SharedLock {
    state: AtomicUsize,
}

impl SharedLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Acquire a shared (reader) hold. Pair with [`release_shared`].
    ///
    /// [`release_shared`]: SharedLock::release_shared
    pub fn acquire_shared(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            intrinsics::pause();
        }
    }

    /// Release a shared hold acquired with [`acquire_shared`].
    ///
    /// [`acquire_shared`]: SharedLock::acquire_shared
    pub fn release_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & !WRITER > 0, "shared release without a reader held");
    }

    /// Acquire the exclusive (writer) hold. Pair with [`release_exclusive`].
    ///
    /// [`release_exclusive`]: SharedLock::release_exclusive
    pub fn acquire_exclusive(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            intrinsics::pause();
        }
    }

    /// Release the exclusive hold.
    pub fn release_exclusive(&self) {
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITER, "exclusive release without the writer held");
    }
}

impl Default for SharedLock {
    fn default() -> Self {
        Self::new()
    }
}
