//! # zrpc-executor — The dispatcher
//!
//! One dedicated I/O thread multiplexes every live connection; a fixed
//! pool of worker threads runs the CPU-bound stretch of each
//! connection's op chain. The dispatcher owns the connection
//! lifecycle:
//!
//! ```text
//! listen readiness → accept → SlotPool::allocate → BEGIN
//!   → op chain (CPU ops run back-to-back)
//!   → READ/WRITE: register readiness, park
//!   → SCHED: deregister, enqueue on a worker queue
//!       worker: CALC ... until the next IO op re-registers
//!   → CLOSE: destroy, slot released
//! ```
//!
//! The protocol supplies the op table; the dispatcher only validates
//! transitions, keeps multiplexer registration in step with the CPU/IO
//! classification, and moves tasks across the I/O–compute boundary.

pub mod config;
pub mod service;

mod dispatch;
mod worker;

pub use config::ServiceConfig;
pub use service::{Service, ServiceControl};
