//! Logging for the smtpfd daemon, inspired by OpenBSD's `log.c`.
//!
//! The daemon logs to stderr while it runs in the foreground and to
//! syslog once daemonized; the target is switched at runtime because
//! daemonization happens after startup logging has already begun.  The
//! verbosity is runtime-adjustable as well, so a control request can
//! raise or lower it in a running process.

use derive_more::{Display, From};
use libc::openlog;
use slog::{Drain, Level, OwnedKVList, Record, KV};
use slog_scope::GlobalLoggerGuard;
use std::{
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Mutex, Once,
    },
};

/// Re-export the scoped logging macros.
pub use slog_scope::{debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();
static FOREGROUND: AtomicBool = AtomicBool::new(true);
static VERBOSE: AtomicI32 = AtomicI32::new(0);

/// Configuration for the logging crate.
#[derive(Debug, Default)]
pub struct Config {
    /// Log to the foreground or to syslog (default: syslog).
    pub foreground: bool,
    /// Initial verbosity (0 = info, 1 = debug, 2 = trace).
    pub verbose: i32,
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
}

impl std::error::Error for Error {}

/// Install the global logger for this process.
///
/// The returned guard must be kept alive for the lifetime of the
/// process; dropping it resets the global logger.
pub fn init(name: &str, config: Config) -> Result<GlobalLoggerGuard, Error> {
    FOREGROUND.store(config.foreground, Ordering::SeqCst);
    VERBOSE.store(config.verbose, Ordering::SeqCst);

    let drain = Verbosity::new(Switch::new(name)?).fuse();

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain);

    let logger = slog::Logger::root(drain.fuse(), slog::o!()).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        let _ = slog_stdlog::init();
    });

    Ok(guard)
}

/// Change the runtime verbosity (0 = info, 1 = debug, 2 = trace).
pub fn set_verbose(verbose: i32) {
    VERBOSE.store(verbose, Ordering::SeqCst);
}

/// Return the current verbosity.
pub fn verbose() -> i32 {
    VERBOSE.load(Ordering::SeqCst)
}

/// Switch between stderr and syslog logging.
pub fn set_foreground(foreground: bool) {
    FOREGROUND.store(foreground, Ordering::SeqCst);
}

fn threshold() -> Level {
    match VERBOSE.load(Ordering::SeqCst) {
        v if v <= 0 => Level::Info,
        1 => Level::Debug,
        _ => Level::Trace,
    }
}

/// Drain applying the runtime verbosity threshold.
struct Verbosity<D> {
    drain: D,
}

impl<D> Verbosity<D> {
    fn new(drain: D) -> Self {
        Self { drain }
    }
}

impl<D: Drain> Drain for Verbosity<D> {
    type Ok = ();
    type Err = D::Err;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(threshold()) {
            self.drain.log(record, values).map(|_| ())
        } else {
            Ok(())
        }
    }
}

/// Drain selecting stderr or syslog from the runtime foreground flag.
struct Switch {
    stderr: Stderr,
    syslog: Syslog,
}

impl Switch {
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            stderr: Stderr::new(name),
            syslog: Syslog::new(name)?,
        })
    }
}

impl Drain for Switch {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        if FOREGROUND.load(Ordering::SeqCst) {
            self.stderr.log_str(&message)
        } else {
            self.syslog.log_str(record.level(), &message)
        }
    }
}

/// Foreground logger that logs to stderr.
struct Stderr {
    name: String,
}

impl Stderr {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Log the pre-formatted string.
    fn log_str(&self, message: &str) -> Result<(), Error> {
        let message = format!("{}: {}\n", self.name, message);
        io::stderr()
            .write_all(message.as_bytes())
            .map_err(Into::into)
    }
}

/// Background logger to log to syslog.
struct Syslog {
    /// We need to keep a reference to the const char * around.
    _name: Pin<CString>,
}

impl Syslog {
    fn new(name: &str) -> Result<Self, Error> {
        let _name = CString::new(name)?;
        let c_str: &CStr = _name.as_c_str();

        unsafe {
            openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _name: Pin::new(_name),
        })
    }

    /// Convert the log string into a syslog message.
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let c_string: CString = CString::new(message.as_bytes())?;
        let c_message: &CStr = c_string.as_c_str();

        let priority = match level {
            Level::Critical => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        unsafe {
            libc::syslog(
                priority,
                b"%s\0".as_ptr() as *const libc::c_char,
                c_message.as_ptr(),
            );
        }

        Ok(())
    }
}

impl Drop for Syslog {
    /// Close syslog on shutdown.
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.into_string()
}

/// Formatter to create a log message from a record.
struct Formatter {
    buf: String,
}

impl Formatter {
    /// Return a new formatter.
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            // Rust does not support function!()
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }

    fn into_string(self) -> String {
        self.buf
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{debug, info, set_verbose, verbose, Config};

    #[test]
    fn test_log_stderr() {
        let _guard = init();

        for i in 1..=10 {
            info!("Hello, World! {}", i);
            debug!("Hello, World! {}", i);
        }
    }

    #[test]
    fn test_verbosity() {
        let _guard = init();

        set_verbose(2);
        assert_eq!(verbose(), 2);
        set_verbose(0);
        assert_eq!(verbose(), 0);
    }

    fn init() -> slog_scope::GlobalLoggerGuard {
        crate::init(
            "test",
            Config {
                foreground: true,
                verbose: 1,
            },
        )
        .unwrap()
    }
}
