//! Mailboxes
//!
//! A mailbox is a FIFO of tagged messages. `send` never blocks; `read`
//! with a zero timeout reports `not_ready` on an empty queue, and with a
//! non-zero timeout parks the calling thread on the waiter FIFO. A woken
//! reader completes its syscall with `not_ready` and retries; wake order
//! is FIFO. Messages between one producer and one consumer are delivered
//! in send order; there is no cross-mailbox ordering.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use crate::cap::Handle;
use crate::error::IpcError;
use crate::process::Thread;
use crate::sched;
use crate::time;

/// Block "forever" (until a message arrives).
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// A queued mailbox message.
pub enum Message {
    /// A handle in flight between processes; the reader's process
    /// registers it and receives a fresh token.
    Handle(Arc<Handle>),
    /// Two uninterpreted payload words.
    User { data0: u64, data1: u64 },
}

/// One parked reader. `woken` flips exactly once, whichever of the
/// message path and the timeout path gets there first; the loser leaves
/// the thread alone.
struct Waiter {
    thread: Arc<Thread>,
    woken: AtomicBool,
}

impl Waiter {
    fn wake(&self) -> bool {
        !self.woken.swap(true, Ordering::AcqRel)
    }
}

struct MailboxInner {
    queue: VecDeque<Message>,
    waiters: VecDeque<Arc<Waiter>>,
}

/// A single-producer/single-consumer message queue.
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

impl Mailbox {
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MailboxInner {
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Queue a message and wake the head waiter, if any.
    pub fn send(&self, message: Message) {
        let to_wake = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(message);

            // Skip waiters whose timeout beat us to the flip.
            loop {
                match inner.waiters.pop_front() {
                    Some(waiter) if waiter.wake() => break Some(waiter),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };

        // The scheduler instance lock ranks above the mailbox lock, so
        // the wake happens after the mailbox lock is dropped.
        if let Some(waiter) = to_wake {
            sched::schedule(waiter.thread.clone());
        }
    }

    /// Dequeue the oldest message, if any.
    pub fn try_read(&self) -> Option<Message> {
        self.inner.lock().queue.pop_front()
    }

    /// Read with a timeout in nanoseconds.
    ///
    /// Zero means poll: `Err(Empty)` right away on an empty queue. A
    /// non-zero timeout parks the calling thread until a send or the
    /// deadline wakes it, then reports `Err(Empty)` so the caller
    /// retries; [`TIMEOUT_INFINITE`] parks with no deadline. Without a
    /// schedulable calling thread (early boot), a blocking read degrades
    /// to a poll.
    pub fn read(&self, timeout_ns: u64) -> Result<Message, IpcError> {
        if let Some(message) = self.try_read() {
            return Ok(message);
        }

        if timeout_ns == 0 {
            return Err(IpcError::Empty);
        }

        let Some(current) = sched::try_current_thread() else {
            return Err(IpcError::Empty);
        };

        let waiter = Arc::new(Waiter {
            thread: current,
            woken: AtomicBool::new(false),
        });

        {
            let mut inner = self.inner.lock();
            // A message may have landed since the first check; parking
            // and re-checking under one lock closes the gap.
            if !inner.queue.is_empty() {
                return Err(IpcError::Empty);
            }
            inner.waiters.push_back(waiter.clone());
        }

        if timeout_ns != TIMEOUT_INFINITE {
            if let Some(timer) = time::try_high_precision_timer() {
                let context = Arc::into_raw(waiter.clone()) as usize;
                if timer.one_shot(timeout_ns, wake_waiter, context).is_err() {
                    // SAFETY: the registration failed, so the callback
                    // will never consume this reference.
                    unsafe { Arc::from_raw(context as *const Waiter) };
                }
            }
        }

        sched::block_current();

        // Resumed (or never actually parked): drop our waiter entry if
        // the send path has not already consumed it.
        {
            let mut inner = self.inner.lock();
            inner
                .waiters
                .retain(|entry| !Arc::ptr_eq(entry, &waiter));
        }

        Err(IpcError::Empty)
    }
}

/// Timer-context wake: reschedules the parked thread unless a send beat
/// the deadline.
fn wake_waiter(context: usize) {
    // SAFETY: the context is the raw Arc<Waiter> leaked at registration;
    // the callback runs at most once and consumes it.
    let waiter = unsafe { Arc::from_raw(context as *const Waiter) };
    if waiter.wake() {
        sched::schedule(waiter.thread.clone());
    }
}
