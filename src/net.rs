//! Networking for `imsg` handling and file descriptor passing.

mod fd;
mod stream;

pub use fd::Fd;
pub use stream::{UnixStream, UnixStreamExt};
