//! Shared service facts and process-level exit flags.

use std::sync::atomic::{AtomicU32, Ordering};

/// Read-only facts an op handler may consult. This replaces a back
/// pointer from the task to the service: handlers get the numbers they
/// need (e.g. the worker-queue count for SCHED) without a handle to
/// the dispatcher's internals.
#[derive(Debug, Clone, Copy)]
pub struct ServiceInfo {
    /// Number of worker threads / queues. SCHED hand-off indices must
    /// be in `[0, worker_queues)`.
    pub worker_queues: u32,
    /// Capacity of each worker queue.
    pub queue_capacity: u32,
    /// Maximum concurrent connections.
    pub max_connections: u32,
}

/// Process-level run state, settable from outside the event loop
/// (signal handler, admin thread). The loop observes these between
/// readiness batches; its wait timeout is bounded so a flag raised
/// during an idle period is still seen promptly.
pub struct ServiceFlags {
    bits: AtomicU32,
}

impl ServiceFlags {
    /// Graceful exit: stop once only the listening task remains.
    pub const EXIT: u32 = 0x0001;
    /// Immediate exit: abort the loop between readiness batches.
    pub const FORCE_EXIT: u32 = 0x0002;

    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    pub fn set(&self, flags: u32) {
        self.bits.fetch_or(flags, Ordering::SeqCst);
    }

    pub fn get(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.set(Self::EXIT);
    }

    pub fn request_force_exit(&self) {
        self.set(Self::FORCE_EXIT);
    }

    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.get() & Self::EXIT != 0
    }

    #[inline]
    pub fn force_exit_requested(&self) -> bool {
        self.get() & Self::FORCE_EXIT != 0
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accumulate() {
        let flags = ServiceFlags::new();
        assert!(!flags.exit_requested());
        assert!(!flags.force_exit_requested());

        flags.request_exit();
        assert!(flags.exit_requested());
        assert!(!flags.force_exit_requested());

        flags.request_force_exit();
        assert!(flags.exit_requested());
        assert!(flags.force_exit_requested());
        assert_eq!(flags.get(), ServiceFlags::EXIT | ServiceFlags::FORCE_EXIT);
    }
}
