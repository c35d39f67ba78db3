//! The per-connection task record.

use std::any::Any;
use std::os::unix::io::RawFd;

use crate::ops::{Interest, OpId};

/// What kind of fd a task wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// The listening socket. One synthetic task per service.
    Listen,
    /// An accepted connection.
    Io,
    /// Vacant slot / not yet classified.
    Unknown,
}

/// One live connection (or the listening socket).
///
/// Ownership discipline: at any instant a task is owned either by the
/// dispatcher thread or by exactly one worker thread, never both. While
/// queued for or running on a worker it is not registered with the
/// multiplexer, so no readiness event can race the worker's access.
pub struct ConnTask {
    pub fd: RawFd,
    pub kind: TaskKind,
    /// The op that ran last.
    pub op_prev: OpId,
    /// The op that runs next.
    pub op_next: OpId,
    /// Readiness the task is currently registered for, if any.
    pub registered: Option<Interest>,
    /// Bumped every time the slot is released; stale readiness events
    /// carry the old generation and are dropped instead of driving a
    /// recycled connection.
    pub generation: u32,
    /// Opaque numeric user payload. Owned by the protocol.
    pub udata: u64,
    /// Opaque structured user payload. Owned by the protocol; expected
    /// to be released (taken or set to `None`) before the task reaches
    /// CLOSE. A payload still present at teardown is logged as a leak
    /// signal, not treated as fatal.
    pub uptr: Option<Box<dyn Any + Send>>,
}

impl ConnTask {
    /// A vacant slot, as stored in the pool before first use.
    pub fn vacant() -> Self {
        Self {
            fd: -1,
            kind: TaskKind::Unknown,
            op_prev: OpId::Begin,
            op_next: OpId::Begin,
            registered: None,
            generation: 0,
            udata: 0,
            uptr: None,
        }
    }

    /// Re-initialize a slot for a freshly accepted fd. The generation
    /// is left alone; only release advances it.
    pub fn reset(&mut self, fd: RawFd, kind: TaskKind) {
        self.fd = fd;
        self.kind = kind;
        self.op_prev = OpId::Begin;
        self.op_next = OpId::Begin;
        self.registered = None;
        self.udata = 0;
        self.uptr = None;
    }

    /// Borrow the structured payload as `T`.
    pub fn user<T: Any + Send>(&self) -> Option<&T> {
        self.uptr.as_ref()?.downcast_ref::<T>()
    }

    /// Mutably borrow the structured payload as `T`.
    pub fn user_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.uptr.as_mut()?.downcast_mut::<T>()
    }

    /// Take the structured payload out of the task.
    pub fn take_user<T: Any + Send>(&mut self) -> Option<Box<T>> {
        let boxed = self.uptr.take()?;
        match boxed.downcast::<T>() {
            Ok(t) => Some(t),
            Err(other) => {
                self.uptr = Some(other);
                None
            }
        }
    }

    /// True if any user payload is still attached.
    pub fn has_user_data(&self) -> bool {
        self.udata != 0 || self.uptr.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_state_keeps_generation() {
        let mut task = ConnTask::vacant();
        task.generation = 7;
        task.udata = 99;
        task.uptr = Some(Box::new(5u32));
        task.op_next = OpId::Write;

        task.reset(12, TaskKind::Io);

        assert_eq!(task.fd, 12);
        assert_eq!(task.kind, TaskKind::Io);
        assert_eq!(task.op_prev, OpId::Begin);
        assert_eq!(task.op_next, OpId::Begin);
        assert_eq!(task.generation, 7);
        assert!(!task.has_user_data());
    }

    #[test]
    fn typed_payload_access() {
        let mut task = ConnTask::vacant();
        task.uptr = Some(Box::new(vec![1u8, 2, 3]));

        assert_eq!(task.user::<Vec<u8>>().map(|v| v.len()), Some(3));
        assert!(task.user::<String>().is_none());

        task.user_mut::<Vec<u8>>().map(|v| v.push(4));
        assert_eq!(task.user::<Vec<u8>>().map(|v| v.len()), Some(4));

        // Wrong-type take leaves the payload attached.
        assert!(task.take_user::<String>().is_none());
        assert!(task.has_user_data());

        let taken = task.take_user::<Vec<u8>>();
        assert_eq!(taken.map(|v| v.len()), Some(4));
        assert!(!task.has_user_data());
    }
}
