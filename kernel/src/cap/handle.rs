//! Handles over kernel objects

use alloc::sync::Arc;

use crate::ipc::Mailbox;
use crate::mm::vas::{Mapping, Vas};
use crate::mm::vmo::Vmo;
use crate::process::{Process, Thread};

use super::Permissions;

/// A shared reference to any object a handle can name.
#[derive(Clone)]
pub enum KernelObject {
    Vas(Arc<Vas>),
    Vmo(Arc<Vmo>),
    Mapping(Arc<Mapping>),
    Process(Arc<Process>),
    Thread(Arc<Thread>),
    Mailbox(Arc<Mailbox>),
}

/// Discriminant of [`KernelObject`], used for syscall type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Vas,
    Vmo,
    Mapping,
    Process,
    Thread,
    Mailbox,
}

impl KernelObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Vas(_) => ObjectKind::Vas,
            Self::Vmo(_) => ObjectKind::Vmo,
            Self::Mapping(_) => ObjectKind::Mapping,
            Self::Process(_) => ObjectKind::Process,
            Self::Thread(_) => ObjectKind::Thread,
            Self::Mailbox(_) => ObjectKind::Mailbox,
        }
    }
}

/// A permission-scoped reference to a kernel object.
///
/// The handle keeps its object alive: the object is destroyed when the
/// last handle (and kernel-internal reference) drops.
pub struct Handle {
    object: KernelObject,
    permissions: Permissions,
}

/// Wrap an object in a new handle.
pub fn create_handle(object: KernelObject, permissions: Permissions) -> Arc<Handle> {
    Arc::new(Handle {
        object,
        permissions,
    })
}

impl Handle {
    pub fn object(&self) -> &KernelObject {
        &self.object
    }

    pub fn kind(&self) -> ObjectKind {
        self.object.kind()
    }

    pub fn is_a(&self, kind: ObjectKind) -> bool {
        self.kind() == kind
    }

    /// Bitwise-subset permission test.
    pub fn has_permissions(&self, required: Permissions) -> bool {
        self.permissions.contains(required)
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn as_vas(&self) -> Option<&Arc<Vas>> {
        match &self.object {
            KernelObject::Vas(vas) => Some(vas),
            _ => None,
        }
    }

    pub fn as_vmo(&self) -> Option<&Arc<Vmo>> {
        match &self.object {
            KernelObject::Vmo(vmo) => Some(vmo),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Arc<Mapping>> {
        match &self.object {
            KernelObject::Mapping(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&Arc<Process>> {
        match &self.object {
            KernelObject::Process(process) => Some(process),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Arc<Thread>> {
        match &self.object {
            KernelObject::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn as_mailbox(&self) -> Option<&Arc<Mailbox>> {
        match &self.object {
            KernelObject::Mailbox(mailbox) => Some(mailbox),
            _ => None,
        }
    }
}
