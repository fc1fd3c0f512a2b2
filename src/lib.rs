//! Privilege-separated SMTP filter daemon.
//!
//! smtpfd splits into three long-lived processes that communicate only
//! via a strict internal messaging IPC: a privileged parent that owns
//! process lifecycle and configuration, an unprivileged frontend that
//! terminates the network and the control socket, and an unprivileged
//! engine that runs the filtering policy.  The parent additionally
//! forks one child process per configured filter and hands the filter's
//! socket to the engine.
//!
//! All three roles are reached through the same executable: the parent
//! re-executes itself with `-F` (frontend) or `-E` (engine).

pub mod config;
pub mod engine;
mod error;
pub mod frontend;
pub mod imsg;
pub mod net;
pub mod parent;
pub mod process;

pub use error::Error;

/// Default configuration file.
pub const CONF_FILE: &str = "/etc/smtpfd.conf";

/// Default control socket path.
pub const SMTPFD_SOCKET: &str = "/var/run/smtpfd.sock";

/// Unprivileged user the child processes run as.
pub const SMTPFD_USER: &str = "_smtpfd";
