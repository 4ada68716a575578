//! Inter-process communication
//!
//! The only IPC primitive is the mailbox: a FIFO of tagged messages with
//! a FIFO of waiting threads.

mod mailbox;

pub use mailbox::{Mailbox, Message};
