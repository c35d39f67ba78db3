//! Leveled stderr logging for zrpc.
//!
//! Thread-safe formatted output with a runtime level filter, in the
//! spirit of a kernel `printk`. Lines are written under the stderr lock
//! so concurrent threads never interleave mid-line.
//!
//! # Environment Variables
//!
//! - `ZRPC_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `ZRPC_FLUSH_EPRINT=1` - flush stderr after every line (crash debugging)
//!
//! # Usage
//!
//! ```ignore
//! use zrpc_core::{zerror, zwarn, zinfo, zdebug, ztrace};
//!
//! zinfo!("service: listening [fd: {}]", fd);
//! zwarn!("accept failed: {}", err);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, most severe first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables.
///
/// Runs automatically on the first log call; call it explicitly for
/// deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("ZRPC_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("ZRPC_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Current log level.
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set the log level programmatically (overrides the environment).
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Whether a level would currently be emitted.
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled line writer. Use the macros instead.
#[doc(hidden)]
pub fn _zlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log.
#[macro_export]
macro_rules! zerror {
    ($($arg:tt)*) => {{
        $crate::zlog::_zlog_impl($crate::zlog::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log.
#[macro_export]
macro_rules! zwarn {
    ($($arg:tt)*) => {{
        $crate::zlog::_zlog_impl($crate::zlog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log.
#[macro_export]
macro_rules! zinfo {
    ($($arg:tt)*) => {{
        $crate::zlog::_zlog_impl($crate::zlog::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log.
#[macro_export]
macro_rules! zdebug {
    ($($arg:tt)*) => {{
        $crate::zlog::_zlog_impl($crate::zlog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose).
#[macro_export]
macro_rules! ztrace {
    ($($arg:tt)*) => {{
        $crate::zlog::_zlog_impl($crate::zlog::LogLevel::Trace, format_args!($($arg)*));
    }};
}
