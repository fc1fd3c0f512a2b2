//! Owned, droppable file descriptors.

use derive_more::From;
use nix::unistd::close;
use std::{
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
///
/// Use `into_raw_fd` to release ownership; a plain conversion back to
/// the raw descriptor would still close it on drop.
#[derive(Debug, From)]
pub struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}
