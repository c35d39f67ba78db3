//! # zrpc-core — Types and contracts for the zrpc serving framework
//!
//! This crate defines the vocabulary every other zrpc crate speaks:
//! the closed set of operation identifiers and their CPU/IO
//! classification, the per-connection task record, the operation table
//! a protocol fills in, the shared service facts and exit flags, and
//! the crate-wide error type.
//!
//! Nothing here touches a socket or a multiplexer. The default building
//! blocks live in `zrpc-module`; the dispatcher that drives them lives
//! in `zrpc-executor`. Protocol implementations depend only on this
//! crate's contracts.

pub mod error;
pub mod ops;
pub mod service;
pub mod table;
pub mod task;
pub mod zlog;
