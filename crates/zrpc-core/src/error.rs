//! zrpc error types.

use std::fmt;

#[derive(Debug)]
pub enum RpcError {
    /// Slot pool has no free task records.
    PoolExhausted,
    /// A bounded queue rejected an entry.
    QueueFull,
    /// Creating the readiness multiplexer failed.
    MultiplexerCreate(i32),
    /// Registering an fd with the multiplexer failed.
    Register(i32),
    /// Removing an fd from the multiplexer failed.
    Deregister(i32),
    /// Waiting on the multiplexer failed.
    Wait(i32),
    /// SCHED picked a worker queue outside `[0, worker_count)`.
    BadQueueIndex { index: u32, limit: u32 },
    /// The configured listening socket is missing or invalid.
    BadListenSocket(i32),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "task pool exhausted"),
            Self::QueueFull => write!(f, "queue full"),
            Self::MultiplexerCreate(e) => write!(f, "multiplexer create: errno {}", e),
            Self::Register(e) => write!(f, "multiplexer register: errno {}", e),
            Self::Deregister(e) => write!(f, "multiplexer deregister: errno {}", e),
            Self::Wait(e) => write!(f, "multiplexer wait: errno {}", e),
            Self::BadQueueIndex { index, limit } => {
                write!(f, "queue index {} outside [0, {})", index, limit)
            }
            Self::BadListenSocket(fd) => write!(f, "bad listening socket: fd {}", fd),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

pub type Result<T> = std::result::Result<T, RpcError>;
