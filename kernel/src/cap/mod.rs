//! Capability layer
//!
//! Kernel objects cross the syscall boundary only as opaque tokens naming
//! per-process [`Handle`]s. A handle pairs a shared object reference with
//! a permission mask; permissions are per-handle, not per-object, so two
//! tokens for the same object can carry different rights.

mod handle;

pub use handle::{create_handle, Handle, KernelObject, ObjectKind};

use bitflags::bitflags;

bitflags! {
    /// Permission bits carried by a handle. The numeric values are part
    /// of the syscall ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Needed to pass the handle through a mailbox.
        const TRANSFER = 1 << 2;
        const CLONE = 1 << 3;
        const CREATE_MAPPING = 1 << 4;
        const CREATE_THREAD = 1 << 5;
        const MAP = 1 << 6;
        const DESTROY = 1 << 7;
    }
}

impl Permissions {
    /// Canonical rights for a freshly created VAS handle.
    pub fn vas_default() -> Self {
        Self::READ | Self::WRITE | Self::TRANSFER | Self::CLONE | Self::CREATE_MAPPING
    }

    /// Canonical rights for a freshly created VMO handle.
    pub fn vmo_default() -> Self {
        Self::READ | Self::WRITE | Self::TRANSFER | Self::CLONE | Self::MAP
    }

    /// Canonical rights for a freshly created process handle.
    pub fn process_default() -> Self {
        Self::READ | Self::WRITE | Self::CLONE | Self::CREATE_THREAD
    }

    /// Canonical rights for a freshly created mailbox handle.
    pub fn mailbox_default() -> Self {
        Self::READ | Self::WRITE | Self::TRANSFER
    }

    /// Canonical rights for a freshly created mapping handle.
    pub fn mapping_default() -> Self {
        Self::DESTROY
    }
}
