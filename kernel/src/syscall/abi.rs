//! Syscall wire ABI
//!
//! Result codes, syscall numbers, and the structures shared with the
//! vDSO stubs. Numbers are assigned stably here; the vDSO is built from
//! this same table, which is all the convention requires.

/// Result code returned in the syscall return register.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysResult {
    Ok = 0,
    NotReady = 1,
    InvalidSyscall = 2,
    InvalidToken = 3,
    WrongHandleType = 4,
    NotAllowed = 5,
    InvalidPointers = 6,
    InvalidArgument = 7,
    WouldBlock = 8,
}

/// Identifiers of the syscall surface.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    VasCreate = 0,
    MappingCreate = 1,
    MappingDestroy = 2,
    VmoCreate = 3,
    ProcessCreate = 4,
    ProcessStart = 5,
    MailboxCreate = 6,
    MailboxWrite = 7,
    MailboxRead = 8,
    TokenRelease = 9,
}

impl TryFrom<u64> for SyscallNumber {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::VasCreate),
            1 => Ok(Self::MappingCreate),
            2 => Ok(Self::MappingDestroy),
            3 => Ok(Self::VmoCreate),
            4 => Ok(Self::ProcessCreate),
            5 => Ok(Self::ProcessStart),
            6 => Ok(Self::MailboxCreate),
            7 => Ok(Self::MailboxWrite),
            8 => Ok(Self::MailboxRead),
            9 => Ok(Self::TokenRelease),
            _ => Err(()),
        }
    }
}

/// Out-parameter of `rose_vas_create`: where the vDSO landed.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VdsoMappingInfo {
    pub base: u64,
    pub length: u64,
}

/// The message carries a handle token minted in the reader's process.
pub const MESSAGE_KIND_HANDLE_TOKEN: u64 = 0;
/// The message carries two uninterpreted words.
pub const MESSAGE_KIND_USER: u64 = 1;

/// Wire form of a mailbox message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxWireMessage {
    pub kind: u64,
    pub data0: u64,
    pub data1: u64,
}
