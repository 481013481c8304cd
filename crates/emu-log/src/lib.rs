//! Host-side logging façade.
//!
//! The emulator core never prints directly; it routes every message through
//! a pair of installable handler functions:
//!
//! - the *message handler* receives leveled log output, and
//! - the *assert handler* receives the text of a fatal assertion just
//!   before the process is terminated.
//!
//! A front end installs its handlers once at startup ([`install_msg_handler`],
//! [`install_assert_handler`]); until then messages fall through to a default
//! that writes `[LEVEL] message` to stderr. Handlers are plain function
//! pointers so they can be swapped without allocation and called from any
//! thread.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Unleveled output.
    None,
    /// Fatal assertion text (also delivered to the assert handler).
    Assert,
    /// An error the emulator can survive.
    Error,
    /// Developer diagnostics.
    Debug,
    /// Informational progress output.
    Info,
}

impl LogLevel {
    /// Display name used by the stock `[LEVEL]` prefix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Assert => "ASSERT",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "Info",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Handler registration
// ---------------------------------------------------------------------------

/// Receives every leveled message.
pub type MsgHandler = fn(LogLevel, &str);

/// Receives the text of a fatal assertion before the process terminates.
pub type AssertHandler = fn(&str);

fn default_msg_handler(level: LogLevel, msg: &str) {
    eprintln!("[{level}] {msg}");
}

fn default_assert_handler(msg: &str) {
    eprintln!("[ASSERT] {msg}");
}

// Handlers are stored as usize so they can live in atomics; 0 means "use the
// default". Function pointers are never null and fit in a word on every
// supported host.
static MSG_HANDLER: AtomicUsize = AtomicUsize::new(0);
static ASSERT_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Installs the process-wide message handler.
pub fn install_msg_handler(handler: MsgHandler) {
    MSG_HANDLER.store(handler as usize, Ordering::Release);
}

/// Installs the process-wide assert handler.
pub fn install_assert_handler(handler: AssertHandler) {
    ASSERT_HANDLER.store(handler as usize, Ordering::Release);
}

fn msg_handler() -> MsgHandler {
    let raw = MSG_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        default_msg_handler
    } else {
        // SAFETY: the slot only ever holds a `MsgHandler` stored by
        // `install_msg_handler` (or 0, handled above).
        unsafe { std::mem::transmute::<usize, MsgHandler>(raw) }
    }
}

fn assert_handler() -> AssertHandler {
    let raw = ASSERT_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        default_assert_handler
    } else {
        // SAFETY: the slot only ever holds an `AssertHandler` stored by
        // `install_assert_handler` (or 0, handled above).
        unsafe { std::mem::transmute::<usize, AssertHandler>(raw) }
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Routes one formatted message to the installed handler.
///
/// Prefer the [`error!`], [`debug!`] and [`info!`] macros.
pub fn message(level: LogLevel, args: fmt::Arguments<'_>) {
    let text = fmt::format(args);
    msg_handler()(level, &text);
}

/// Reports a fatal invariant violation and terminates the emulator.
///
/// Delivers the message to the assert handler (and the message handler at
/// [`LogLevel::Assert`]) and then aborts: a failed translator invariant
/// leaves no state worth unwinding through.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let text = fmt::format(args);
    msg_handler()(LogLevel::Assert, &text);
    assert_handler()(&text);
    std::process::abort();
}

/// Logs an error message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::message($crate::LogLevel::Error, core::format_args!($($arg)*))
    };
}

/// Logs a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::message($crate::LogLevel::Debug, core::format_args!($($arg)*))
    };
}

/// Logs an informational message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::message($crate::LogLevel::Info, core::format_args!($($arg)*))
    };
}

/// Fatal assertion: if the condition is false, report and terminate.
///
/// This is the hard-failure path for translator invariants (duplicate block
/// insertion, malformed tables); it is not for guest-visible errors, which
/// stay in-band.
#[macro_export]
macro_rules! throw_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal(core::format_args!($($arg)*));
        }
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CAPTURED: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());

    fn capture(level: LogLevel, msg: &str) {
        CAPTURED.lock().unwrap().push((level, msg.to_owned()));
    }

    #[test]
    fn level_names_match_wire_format() {
        assert_eq!(LogLevel::None.name(), "NONE");
        assert_eq!(LogLevel::Assert.name(), "ASSERT");
        assert_eq!(LogLevel::Error.name(), "ERROR");
        assert_eq!(LogLevel::Debug.name(), "DEBUG");
        assert_eq!(LogLevel::Info.name(), "Info");
    }

    #[test]
    fn installed_handler_receives_messages() {
        install_msg_handler(capture);
        error!("fault at {:#x}", 0x1000);
        info!("loaded");
        let captured = CAPTURED.lock().unwrap();
        assert!(
            captured
                .iter()
                .any(|(l, m)| *l == LogLevel::Error && m == "fault at 0x1000"),
            "error message not delivered: {captured:?}"
        );
        assert!(
            captured
                .iter()
                .any(|(l, m)| *l == LogLevel::Info && m == "loaded"),
            "info message not delivered: {captured:?}"
        );
    }
}
