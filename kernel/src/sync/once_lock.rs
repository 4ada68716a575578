//! One-shot global initialization
//!
//! A no_std `OnceLock` used for subsystem singletons that are written once
//! during boot (the kernel page-table root, the vDSO object, the timer
//! registry) and read for the rest of the kernel's lifetime.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written to only once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    /// Create a new empty cell
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set()` from
            // `Box::into_raw`, so it points at a live, fully initialized T.
            // The Acquire load synchronizes with the Release store in
            // `set()`, and the allocation is never freed while the cell is
            // reachable, so 'static is sound.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns `Err(value)` if another initialization got there first.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: the CAS failed, so nobody else saw `ptr`; we
                // reclaim the box we just leaked and hand the value back.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get the value, initializing it with `f` if the cell is still empty.
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }

        let _ = self.set(f());
        self.get()
            .expect("OnceLock empty after set()")
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the value is heap-allocated and reached through an AtomicPtr
// with Acquire/Release ordering; ownership questions reduce to T's own
// Send/Sync bounds.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: see above; shared references to the inner value require T: Sync.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: `&mut self` guarantees exclusive access; the pointer
            // came from `Box::into_raw` in `set()`.
            unsafe {
                let _ = Box::from_raw(ptr);
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn set_once() {
        let lock = OnceLock::new();
        assert!(lock.get().is_none());

        assert!(lock.set(42).is_ok());
        assert_eq!(*lock.get().unwrap(), 42);

        assert_eq!(lock.set(100), Err(100));
        assert_eq!(*lock.get().unwrap(), 42);
    }

    #[test]
    fn get_or_init_runs_once() {
        let lock = OnceLock::new();
        assert_eq!(*lock.get_or_init(|| 7), 7);
        assert_eq!(*lock.get_or_init(|| 8), 7);
    }
}
