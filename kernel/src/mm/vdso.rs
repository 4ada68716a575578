//! vDSO object registry
//!
//! One process-wide physical VMO holds the syscall trampolines. It is
//! registered once during boot, mapped read-only into every user address
//! space created with `map_vdso`, and its base is reported back to the
//! creating process.

use alloc::sync::Arc;

use crate::sync::OnceLock;

use super::vmo::Vmo;

static VDSO: OnceLock<Arc<Vmo>> = OnceLock::new();

/// Register the vDSO image. Called once during boot; a second
/// registration is fatal.
pub fn register(vmo: Arc<Vmo>) {
    if VDSO.set(vmo).is_err() {
        panic!("tried to register a vDSO VMO with another already registered");
    }
}

/// The registered vDSO object; fatal if boot has not registered one.
pub fn get() -> Arc<Vmo> {
    VDSO.get()
        .expect("vDSO VMO requested before registration")
        .clone()
}

/// The registered vDSO object, if any.
pub fn try_get() -> Option<Arc<Vmo>> {
    VDSO.get().cloned()
}
