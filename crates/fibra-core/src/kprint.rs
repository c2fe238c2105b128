//! Kernel-style logging macros
//!
//! Lines go to stderr under the stderr lock so concurrent workers never
//! interleave partial lines. Runtime threads register a short tag
//! (`g0.w3`, `g0.timer`, `g1.reactor`) that prefixes every line they emit.
//!
//! # Environment Variables
//!
//! - `FIBRA_LOG_LEVEL=<level>`: off/error/warn/info/debug/trace or 0..5
//! - `FIBRA_FLUSH_EPRINT=1`: flush stderr after each line
//!
//! ```ignore
//! use fibra_core::{kinfo, kwarn};
//!
//! kinfo!("group {} started with {} workers", g, n);
//! kwarn!("timer {:?} lost a tick", id);
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

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

    /// Parse a level name or digit. Unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
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

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INIT: Once = Once::new();

thread_local! {
    static THREAD_TAG: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Read `FIBRA_LOG_LEVEL` / `FIBRA_FLUSH_EPRINT` once.
///
/// Called lazily by the first log line; explicit calls make the moment
/// deterministic.
pub fn init() {
    INIT.call_once(|| {
        if let Ok(val) = std::env::var("FIBRA_FLUSH_EPRINT") {
            let flush = matches!(val.trim(), "1" | "true" | "yes" | "on");
            FLUSH_ENABLED.store(flush, Ordering::Relaxed);
        }
        if let Some(level) = std::env::var("FIBRA_LOG_LEVEL")
            .ok()
            .and_then(|v| LogLevel::parse(&v))
        {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
    });
}

#[inline]
pub fn flush_enabled() -> bool {
    init();
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Override the level. Takes precedence over the environment.
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Tag every line logged from the current OS thread.
pub fn set_thread_tag(tag: impl Into<String>) {
    let tag = tag.into();
    THREAD_TAG.with(|t| *t.borrow_mut() = Some(tag));
}

pub fn clear_thread_tag() {
    THREAD_TAG.with(|t| *t.borrow_mut() = None);
}

fn write_line(handle: &mut impl Write, level: Option<LogLevel>, args: std::fmt::Arguments<'_>) {
    if let Some(level) = level {
        let _ = write!(handle, "{} ", level.prefix());
    }
    THREAD_TAG.with(|t| {
        if let Some(tag) = t.borrow().as_deref() {
            let _ = write!(handle, "[{}] ", tag);
        }
    });
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    write_line(&mut handle, None, args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    write_line(&mut handle, Some(level), args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr without newline.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*));
    }};
}

/// Print a tagged line to stderr regardless of level.
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" 2 "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(42), LogLevel::Trace);
    }

    #[test]
    fn test_tagged_line_format() {
        set_thread_tag("g0.w1");
        let mut out = Vec::new();
        write_line(&mut out, Some(LogLevel::Warn), format_args!("lost {} ticks", 3));
        clear_thread_tag();
        assert_eq!(String::from_utf8(out).unwrap(), "[WARN]  [g0.w1] lost 3 ticks\n");
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        kprint!("");
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
