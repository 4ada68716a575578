//! Kernel error types
//!
//! Structured error values for every subsystem, with conversions into the
//! top-level [`KernelError`] so fallible paths compose with `?`. Syscall
//! handlers flatten these into the wire-level result codes in
//! [`crate::syscall::abi`].

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    Mem(MemError),
    /// Capability-related errors
    Cap(CapError),
    /// IPC-related errors
    Ipc(IpcError),
    /// Scheduler-related errors
    Sched(SchedError),
    /// System call marshalling errors
    Syscall(SyscallError),
    /// Time subsystem errors
    Time(TimeError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    /// Operation would block
    WouldBlock,
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Memory-management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No frames left in any size class
    OutOfFrames,
    /// Address not aligned to the required page size
    Misaligned { addr: u64, align: usize },
    /// Requested range is not covered by a live mapping
    NoMapping { addr: u64 },
    /// Write access requested against a read-only mapping
    ReadOnlyMapping { addr: u64 },
    /// The mapping has already been torn down
    MappingInvalid,
    /// The address space is already claimed by a process
    AlreadyClaimed,
}

/// Capability/handle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// No handle registered under this token
    UnknownToken { token: u64 },
    /// Handle exists but references a different object type
    WrongType,
    /// Handle lacks one or more of the required permission bits
    InsufficientPermissions { required: u32, actual: u32 },
}

/// IPC errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Mailbox has no queued message
    Empty,
    /// A blocking read ran out its deadline
    TimedOut,
    /// Message carried a malformed tag
    InvalidMessage,
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No scheduler instances registered under the aggregate
    NoInstances,
    /// Thread is already the running thread of its core
    AlreadyRunning,
    /// Core id outside the live core set
    InvalidCore { core: u32 },
}

/// System call marshalling errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Unknown syscall number
    InvalidSyscall { nr: u64 },
    /// A register argument failed validation
    InvalidArgument { arg: usize },
    /// A user pointer failed alignment or containment checks
    InvalidPointer { addr: u64 },
}

/// Time subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    /// No hardware timer registered for this role
    NoTimer,
    /// The descriptor id space has been exhausted
    IdExhausted,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mem(e) => write!(f, "memory error: {:?}", e),
            Self::Cap(e) => write!(f, "capability error: {:?}", e),
            Self::Ipc(e) => write!(f, "IPC error: {:?}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall error: {:?}", e),
            Self::Time(e) => write!(f, "time error: {:?}", e),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::AlreadyExists { resource } => write!(f, "{} already exists", resource),
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<MemError> for KernelError {
    fn from(err: MemError) -> Self {
        Self::Mem(err)
    }
}

impl From<CapError> for KernelError {
    fn from(err: CapError) -> Self {
        Self::Cap(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::Syscall(err)
    }
}

impl From<TimeError> for KernelError {
    fn from(err: TimeError) -> Self {
        Self::Time(err)
    }
}
