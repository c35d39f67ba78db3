//! Service configuration.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use zrpc_module::backoff::{Backoff, FixedBackoff};

/// Everything a `Service` needs besides the op table. Built with
/// `ServiceConfig::new(listen_fd)` and adjusted field by field; the
/// defaults are serviceable for a small deployment.
pub struct ServiceConfig {
    /// A bound, listening, non-blocking socket. The service takes
    /// ownership and closes it on exit.
    pub listen_fd: RawFd,
    /// Maximum concurrent connections; the task pool holds one extra
    /// slot for the listening task.
    pub max_connections: u32,
    /// Worker thread count (one queue per worker). At least 1.
    pub workers: u32,
    /// Capacity of each worker queue.
    pub queue_capacity: u32,

    /// Multiplexer wait timeout. Bounded so exit flags are observed
    /// even with no traffic.
    pub poll_timeout_ms: i32,
    /// Readiness events fetched per wait.
    pub wait_batch: usize,
    /// Connections accepted per listen-readiness notification before
    /// yielding back to other fds.
    pub accept_batch: u32,

    /// Consecutive multiplexer errors tolerated before pausing.
    pub wait_err_trigger: u32,
    /// Pause taken after `wait_err_trigger` multiplexer errors.
    pub wait_backoff: Arc<dyn Backoff>,
    /// Consecutive ERR→ERR transitions tolerated before pausing.
    pub err_repeat_limit: u32,
    /// Pause taken when an op chain bounces ERR→ERR repeatedly.
    pub err_backoff: Arc<dyn Backoff>,

    /// Worker sleep between empty queue polls.
    pub worker_idle_wait: Duration,
    /// Brief retries before a full worker queue fails the connection.
    pub enqueue_retries: u32,
}

impl ServiceConfig {
    pub fn new(listen_fd: RawFd) -> Self {
        Self {
            listen_fd,
            max_connections: 1024,
            workers: 2,
            queue_capacity: 1024,
            poll_timeout_ms: 200,
            wait_batch: 16,
            accept_batch: 64,
            wait_err_trigger: 5,
            wait_backoff: Arc::new(FixedBackoff::secs(3)),
            err_repeat_limit: 2,
            err_backoff: Arc::new(FixedBackoff::secs(3)),
            worker_idle_wait: Duration::from_millis(20),
            enqueue_retries: 8,
        }
    }
}
