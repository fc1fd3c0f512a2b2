//! Internal message handling between privilege-separated processes.

use crate::net::{Fd, UnixStream, UnixStreamExt};
use bytes::{Bytes, BytesMut};
use nix::{
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
    unistd::getpid,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::VecDeque,
    convert::TryFrom,
    io::{self, IoSlice, Result},
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};
use zerocopy::{AsBytes, FromBytes};

/// Message types exchanged between the smtpfd processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ImsgType {
    /// Hand a child its private channel to the other child.
    SocketIpc = 1,
    /// Control request: reload the configuration.
    CtlReload,
    /// Control request: change the log verbosity.
    CtlLogVerbose,
    /// Control request: show parent process information.
    CtlShowMainInfo,
    /// Marks the end of a control reply.
    CtlEnd,
    /// Start building a new engine configuration.
    ReconfConf,
    /// Declare a filter entry in the new configuration.
    ReconfFilter,
    /// Attach a forked filter process to the new configuration.
    ReconfFilterProc,
    /// Declare a concrete filter reached via chain resolution.
    ReconfFilterNode,
    /// The new configuration is complete; swap it in.
    ReconfEnd,
}

impl ImsgType {
    /// Message types that travel with a passed file descriptor.
    pub fn carries_fd(self) -> bool {
        matches!(self, ImsgType::SocketIpc | ImsgType::ReconfFilterProc)
    }

    /// Message types that carry a payload; the rest are bare markers.
    fn has_payload(self) -> bool {
        matches!(
            self,
            ImsgType::CtlLogVerbose
                | ImsgType::ReconfFilter
                | ImsgType::ReconfFilterProc
                | ImsgType::ReconfFilterNode
        )
    }
}

impl From<ImsgType> for u32 {
    fn from(id: ImsgType) -> Self {
        id as u32
    }
}

impl TryFrom<u32> for ImsgType {
    type Error = u32;

    fn try_from(id: u32) -> std::result::Result<Self, u32> {
        match id {
            id if id == ImsgType::SocketIpc as u32 => Ok(ImsgType::SocketIpc),
            id if id == ImsgType::CtlReload as u32 => Ok(ImsgType::CtlReload),
            id if id == ImsgType::CtlLogVerbose as u32 => Ok(ImsgType::CtlLogVerbose),
            id if id == ImsgType::CtlShowMainInfo as u32 => Ok(ImsgType::CtlShowMainInfo),
            id if id == ImsgType::CtlEnd as u32 => Ok(ImsgType::CtlEnd),
            id if id == ImsgType::ReconfConf as u32 => Ok(ImsgType::ReconfConf),
            id if id == ImsgType::ReconfFilter as u32 => Ok(ImsgType::ReconfFilter),
            id if id == ImsgType::ReconfFilterProc as u32 => Ok(ImsgType::ReconfFilterProc),
            id if id == ImsgType::ReconfFilterNode as u32 => Ok(ImsgType::ReconfFilterNode),
            id if id == ImsgType::ReconfEnd as u32 => Ok(ImsgType::ReconfEnd),
            id => Err(id),
        }
    }
}

/// Internal message header.
#[derive(Debug, AsBytes, FromBytes, Default)]
#[repr(C)]
pub struct Header {
    /// Request type.
    pub id: u32,
    /// Total message length (header + payload).
    pub length: u16,
    /// Optional flags.
    pub flags: u16,
    /// Optional peer ID, used to correlate replies with requests.
    pub peer_id: u32,
    /// Originating PID, or a child PID for process-attach messages.
    pub pid: libc::pid_t,
}

impl Header {
    /// Message header length.
    pub const LENGTH: usize = mem::size_of::<Self>();

    /// Create a new message header of the given type.
    pub fn new(id: ImsgType) -> Self {
        Header {
            id: id.into(),
            length: Self::LENGTH as u16,
            pid: getpid().as_raw(),
            ..Default::default()
        }
    }
}

impl From<ImsgType> for Header {
    fn from(id: ImsgType) -> Self {
        Header::new(id)
    }
}

/// A single received message.
#[derive(Debug)]
pub struct Imsg {
    /// The decoded wire header.
    pub header: Header,
    /// File descriptor passed along with the message, if its type
    /// carries one.
    pub fd: Option<Fd>,
    /// Opaque payload bytes.
    pub data: Bytes,
}

impl Imsg {
    /// The message type, or the raw ID if the peer sent an unknown one.
    pub fn imsg_type(&self) -> std::result::Result<ImsgType, u32> {
        ImsgType::try_from(self.header.id)
    }

    /// Decode the payload; the expected type follows from the message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// `imsg` handler.
#[derive(Debug)]
pub struct Handler {
    /// Async half of a UNIX socketpair.
    socket: UnixStream,
    /// Read buffer for partially received messages.
    read_buffer: Mutex<BytesMut>,
    /// Received file descriptors not yet claimed by a message.
    pending_fds: Mutex<VecDeque<Fd>>,
}

impl From<UnixStream> for Handler {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            read_buffer: Mutex::new(BytesMut::with_capacity(Self::BUFFER_LENGTH)),
            pending_fds: Mutex::new(VecDeque::new()),
        }
    }
}

impl Handler {
    /// Upper bound for a framed message, header included.
    pub const BUFFER_LENGTH: usize = 0xffff;

    const READ_CHUNK: usize = 0x1000;

    /// Create new handler pair.
    pub fn pair() -> Result<(Self, Self)> {
        UnixStream::pair().map(|(a, b)| (a.into(), b.into()))
    }

    /// Create a plain connected socketpair whose ends are meant to be
    /// passed to other processes.
    pub fn socketpair() -> Result<(Fd, Fd)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|err| io::Error::from_raw_os_error(err as i32))?;
        Ok((Fd::from(a), Fd::from(b)))
    }

    /// Create half of a handler pair from a file descriptor.
    pub fn from_raw_fd<T: IntoRawFd>(fd: T) -> Result<Handler> {
        unsafe { <UnixStream as UnixStreamExt>::from_raw_fd(fd.into_raw_fd()).map(Into::into) }
    }

    /// Send a message to the remote end.
    pub async fn send_message<T: Serialize>(
        &self,
        mut header: Header,
        fd: Option<&Fd>,
        data: &T,
    ) -> Result<()> {
        let data = bincode::serialize(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let length = Header::LENGTH + data.len();
        if length > Self::BUFFER_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "imsg payload too large",
            ));
        }
        header.length = length as u16;

        let iovs = [
            IoSlice::new(header.as_bytes()),
            IoSlice::new(&data),
        ];
        let bufs = if data.is_empty() { &iovs[..1] } else { &iovs[..] };

        let count = self.socket.send_with_fd(bufs, fd).await?;
        if count != length {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short imsg write"));
        }

        Ok(())
    }

    /// Receive one message from the remote end.
    ///
    /// Returns `Ok(None)` when the peer has closed the channel.
    pub async fn recv_imsg(&self) -> Result<Option<Imsg>> {
        loop {
            if let Some(imsg) = self.frame()? {
                return Ok(Some(imsg));
            }

            // Read more data.  This is also our yield point in the loop.
            let mut chunk = [0u8; Self::READ_CHUNK];
            let mut fds = Vec::new();
            let count = self.socket.recv_with_fds(&mut chunk, &mut fds).await?;
            if count == 0 {
                return Ok(None);
            }

            self.read_buffer.lock().extend_from_slice(&chunk[..count]);
            if !fds.is_empty() {
                self.pending_fds.lock().extend(fds);
            }
        }
    }

    /// Split one complete message off the read buffer, if available.
    fn frame(&self) -> Result<Option<Imsg>> {
        let mut buffer = self.read_buffer.lock();

        if buffer.len() < Header::LENGTH {
            return Ok(None);
        }

        let mut header = Header::default();
        header
            .as_bytes_mut()
            .copy_from_slice(&buffer[..Header::LENGTH]);
        let length = header.length as usize;

        if length < Header::LENGTH || length > Self::BUFFER_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid imsg length",
            ));
        }
        if let Ok(id) = ImsgType::try_from(header.id) {
            if !id.has_payload() && length > Header::LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected imsg payload",
                ));
            }
        }
        if buffer.len() < length {
            return Ok(None);
        }

        let frame = buffer.split_to(length).freeze();
        drop(buffer);

        // A descriptor belongs to the message it was sent with; fds
        // queue up in arrival order, so the next fd-carrying message
        // claims the front of the queue.
        let fd = if ImsgType::try_from(header.id)
            .map(ImsgType::carries_fd)
            .unwrap_or(false)
        {
            self.pending_fds.lock().pop_front()
        } else {
            None
        };

        Ok(Some(Imsg {
            header,
            fd,
            data: frame.slice(Header::LENGTH..),
        }))
    }
}

impl AsRawFd for Handler {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_data() {
        let data = bincode::serialize(&()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_header_length() {
        // The wire header is fixed-size; a change here breaks the protocol.
        assert_eq!(Header::LENGTH, 16);
    }

    #[test]
    fn test_type_round_trip() {
        for id in [
            ImsgType::SocketIpc,
            ImsgType::CtlReload,
            ImsgType::CtlLogVerbose,
            ImsgType::CtlShowMainInfo,
            ImsgType::CtlEnd,
            ImsgType::ReconfConf,
            ImsgType::ReconfFilter,
            ImsgType::ReconfFilterProc,
            ImsgType::ReconfFilterNode,
            ImsgType::ReconfEnd,
        ] {
            assert_eq!(ImsgType::try_from(u32::from(id)), Ok(id));
        }
        assert!(ImsgType::try_from(0).is_err());
        assert!(ImsgType::try_from(4711).is_err());
    }
}
