use derive_more::{Display, From};
use std::io;

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "{}", "_0")]
    LogError(smtpfd_log::Error),
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "need root privileges")]
    #[from(ignore)]
    PermissionDenied,
    #[display(fmt = "unknown user {}", "_0")]
    #[from(ignore)]
    UserNotFound(String),
    #[display(fmt = "failed to drop privileges ({}) - {}", "_0", "_1")]
    #[from(ignore)]
    Privdrop(&'static str, nix::Error),
    #[display(fmt = "{}:{}: {}", "file", "line", "message")]
    #[from(ignore)]
    ParseError {
        file: String,
        line: usize,
        message: String,
    },
    #[display(fmt = "invalid configuration: {}", "_0")]
    #[from(ignore)]
    ConfigError(String),
    #[display(fmt = "{}", "_0")]
    #[from(ignore)]
    Error(&'static str),
}

impl std::error::Error for Error {}
