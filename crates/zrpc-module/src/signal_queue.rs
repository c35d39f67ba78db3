//! `SignalQueue` — bounded FIFO with an fd readiness signal.
//!
//! Two lanes that must stay in step: a lock-free `ArrayQueue` carries
//! the entries, and a semaphore-mode eventfd carries one count per
//! entry so "queue non-empty" can be observed by the same readiness
//! multiplexer used for sockets. Every successful `enqueue` adds one
//! to the counter; every successful `dequeue` drains one.
//!
//! A drained count with no entry behind it is benign (logged at warn).
//! The inverse, an entry popped with no count consumed, cannot happen
//! here: the count is always consumed before the pop, so no
//! fatal-in-debug consistency check is needed.

use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::io::RawFd;

use crossbeam_queue::ArrayQueue;
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use zrpc_core::error::{Result, RpcError};
use zrpc_core::zwarn;

pub struct SignalQueue<T> {
    items: ArrayQueue<T>,
    signal: EventFd,
}

impl<T> SignalQueue<T> {
    /// Create a queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        let signal = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_SEMAPHORE,
        )
        .map_err(|e| RpcError::Os(e as i32))?;
        Ok(Self {
            items: ArrayQueue::new(capacity),
            signal,
        })
    }

    /// Append an entry. Returns `false` when the queue is full: the
    /// caller retries with backoff; it must never block on this.
    pub fn enqueue(&self, item: T) -> bool {
        if self.items.push(item).is_err() {
            return false;
        }
        loop {
            match self.signal.write(1) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                // Counter saturated; a wakeup is already pending.
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    zwarn!("queue signal write failed: errno {}", e as i32);
                    break;
                }
            }
        }
        true
    }

    /// Pop the oldest entry, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            match self.signal.read() {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return None,
                Err(e) => {
                    zwarn!("queue signal read failed: errno {}", e as i32);
                    return None;
                }
            }
        }
        match self.items.pop() {
            Some(item) => Some(item),
            None => {
                zwarn!("queue signal with no entry behind it");
                None
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// The fd a multiplexer can watch for read readiness: readable
    /// exactly while the queue holds entries.
    pub fn readiness_fd(&self) -> RawFd {
        self.signal.as_fd().as_raw_fd()
    }
}
