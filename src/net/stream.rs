//! `UnixStream` extensions to support file descriptor passing.

use crate::net::Fd;
use async_trait::async_trait;
use nix::{
    cmsg_space,
    sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
};
use std::{
    io::{self, IoSlice, IoSliceMut, Result},
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        net as std_net,
    },
};
use tokio::{io::Interest, net as tokio_net};

pub use tokio_net::UnixStream;

#[async_trait]
pub trait UnixStreamExt {
    async fn send_with_fd(&self, bufs: &[IoSlice<'_>], fd: Option<&Fd>) -> Result<usize>;

    async fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<Fd>) -> Result<usize>;

    #[allow(clippy::missing_safety_doc)]
    unsafe fn from_raw_fd(fd: RawFd) -> Result<UnixStream>;
}

#[async_trait]
impl UnixStreamExt for UnixStream {
    async fn send_with_fd(&self, bufs: &[IoSlice<'_>], fd: Option<&Fd>) -> Result<usize> {
        let raw_fds = fd.map(|fd| [fd.as_raw_fd()]);

        loop {
            self.writable().await?;

            match self.try_io(Interest::WRITABLE, || {
                let cmsg_array;
                let cmsgs: &[ControlMessage<'_>] = match raw_fds.as_ref() {
                    Some(raw) => {
                        cmsg_array = [ControlMessage::ScmRights(raw)];
                        &cmsg_array
                    }
                    None => &[],
                };
                sendmsg::<()>(self.as_raw_fd(), bufs, cmsgs, MsgFlags::empty(), None)
                    .map_err(nix_to_io)
            }) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                result => break result,
            }
        }
    }

    async fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<Fd>) -> Result<usize> {
        loop {
            self.readable().await?;

            let result = self.try_io(Interest::READABLE, || {
                let mut cmsg_buffer = cmsg_space!([RawFd; 4]);
                let mut iov = [IoSliceMut::new(buf)];

                let message = recvmsg::<()>(
                    self.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(nix_to_io)?;

                let mut received = Vec::new();
                for cmsg in message.cmsgs() {
                    if let ControlMessageOwned::ScmRights(scm_rights) = cmsg {
                        received.extend(scm_rights.into_iter().map(Fd::from));
                    }
                }

                Ok((message.bytes, received))
            });

            match result {
                Ok((count, received)) => {
                    fds.extend(received);
                    break Ok(count);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => break Err(err),
            }
        }
    }

    unsafe fn from_raw_fd(fd: RawFd) -> Result<UnixStream> {
        let stream = std_net::UnixStream::from_raw_fd(fd);
        stream.set_nonblocking(true)?;
        UnixStream::from_std(stream)
    }
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}
