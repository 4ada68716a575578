//! Processes
//!
//! A process is an address space plus a table of handle tokens. Tokens
//! are opaque 64-bit integers minted by mixing the process address, the
//! handle address, and the current time; they are never reused while
//! live, and the reserved top bit is always zero on issued tokens.

mod thread;

pub use thread::Thread;

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::cap::Handle;
use crate::mm::vas::Vas;
use crate::sync::InterruptGuard;
use crate::time;

/// Issued tokens never carry the top bit.
const TOKEN_RESERVED_BIT: u64 = 1 << 63;

/// Extra entropy for token-collision retries, so a stalled clock cannot
/// pin the loop on one value.
static RETRY_SALT: AtomicU64 = AtomicU64::new(1);

/// A process: one claimed address space and a handle table.
pub struct Process {
    vas: Arc<Vas>,
    self_ref: Weak<Process>,
    handles: Mutex<BTreeMap<u64, Arc<Handle>>>,
}

impl Process {
    /// Wrap an address space without claiming it. Used for the kernel's
    /// implicit process, whose VAS is the adopted boot address space.
    pub fn with_vas(vas: Arc<Vas>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            vas,
            self_ref: self_ref.clone(),
            handles: Mutex::new(BTreeMap::new()),
        })
    }

    /// Create a process over `vas`, claiming it. Fails when the VAS has
    /// already been claimed by another process.
    pub fn create(vas: Arc<Vas>) -> Option<Arc<Self>> {
        if !vas.claim_for_process() {
            return None;
        }
        Some(Self::with_vas(vas))
    }

    pub fn vas(&self) -> &Arc<Vas> {
        &self.vas
    }

    /// Insert a handle and mint the token naming it.
    ///
    /// The token mixes this process's address, the handle's address, and
    /// the monotonic clock; a colliding (or zero) draw retries with fresh
    /// salt. Issued tokens keep the reserved top bit clear.
    pub fn register_for_token(&self, handle: Arc<Handle>) -> u64 {
        let self_bits = self as *const Self as u64;
        let handle_bits = Arc::as_ptr(&handle) as u64;

        let _interrupts = InterruptGuard::new();
        let mut handles = self.handles.lock();

        let mut salt = 0u64;
        loop {
            let token = (self_bits ^ handle_bits ^ time::now_ns() ^ salt) & !TOKEN_RESERVED_BIT;

            if token != 0 && !handles.contains_key(&token) {
                handles.insert(token, handle);
                return token;
            }

            salt = RETRY_SALT
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        }
    }

    /// Look up the handle a token names. Null tokens and unknown tokens
    /// answer `None`.
    pub fn get_handle(&self, token: u64) -> Option<Arc<Handle>> {
        let _interrupts = InterruptGuard::new();
        self.handles.lock().get(&token).cloned()
    }

    /// Remove a token, handing back its handle if it was present.
    pub fn remove_token(&self, token: u64) -> Option<Arc<Handle>> {
        let _interrupts = InterruptGuard::new();
        self.handles.lock().remove(&token)
    }

    /// Remove a token that must be present; absence is fatal.
    pub fn unregister_token(&self, token: u64) {
        if self.remove_token(token).is_none() {
            panic!("tried to unregister a token that does not exist");
        }
    }

    /// Spawn a thread inside this process, stamped with the current time.
    pub fn create_thread(&self) -> Arc<Thread> {
        let process = self
            .self_ref
            .upgrade()
            .expect("create_thread on a process being destroyed");
        Thread::new(process)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::cap::{create_handle, KernelObject, Permissions};
    use crate::mm::vmo::Vmo;
    use crate::mm::PhysAddr;
    use crate::test_support;

    fn process_with_fresh_vas() -> Arc<Process> {
        test_support::ensure_global_frames();
        let _pmm = test_support::lock_pmm();
        Process::create(Vas::create(false)).expect("fresh VAS should be claimable")
    }

    fn some_handle() -> Arc<Handle> {
        let vmo = Vmo::create_physical(PhysAddr::new(0x1000), 4096, 0);
        create_handle(KernelObject::Vmo(vmo), Permissions::vmo_default())
    }

    #[test]
    fn token_round_trip() {
        let process = process_with_fresh_vas();
        let handle = some_handle();

        assert!(process.get_handle(0).is_none());

        let token = process.register_for_token(handle.clone());
        assert_ne!(token, 0);
        assert_eq!(token & (1 << 63), 0);

        let found = process
            .get_handle(token)
            .expect("registered token should resolve");
        assert!(Arc::ptr_eq(&found, &handle));

        process.unregister_token(token);
        assert!(process.get_handle(token).is_none());
    }

    #[test]
    fn tokens_are_collision_free() {
        let process = process_with_fresh_vas();

        let mut seen = alloc::vec::Vec::new();
        for _ in 0..256 {
            let token = process.register_for_token(some_handle());
            assert!(!seen.contains(&token));
            seen.push(token);
        }
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn unregistering_an_unknown_token_panics() {
        let process = process_with_fresh_vas();
        process.unregister_token(0xdead_beef);
    }

    #[test]
    fn claiming_a_vas_twice_fails() {
        test_support::ensure_global_frames();
        let _pmm = test_support::lock_pmm();

        let vas = Vas::create(false);
        let first = Process::create(vas.clone());
        assert!(first.is_some());
        assert!(Process::create(vas).is_none());
    }
}
