//! Framed messages over a connected unix socket.
//!
//! A message is a byte payload plus up to [`MAX_HANDLES`] file descriptors passed as `SCM_RIGHTS`. On a
//! `SOCK_SEQPACKET` socket a message is exactly one record. On a `SOCK_STREAM` socket it is a big endian `u32`
//! length followed by the payload, and the descriptors ride on the first write of the message only (a zero-size
//! write cannot carry a descriptor, so they go with the length).

use std::{
    io::{IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag},
    poll::{poll, PollFd, PollFlags},
    sys::socket::{
        getsockopt, recvmsg, sendmsg, shutdown, socketpair, sockopt, AddressFamily, ControlMessage,
        ControlMessageOwned, MsgFlags, Shutdown, SockFlag, SockType,
    },
};
use thiserror::Error;

/// The most descriptors a single message may carry.
pub const MAX_HANDLES: usize = 8;

type FrameLength = u32;
const LENGTH_SIZE: usize = std::mem::size_of::<FrameLength>();

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[derive(Debug, Error)]
pub enum TransportError {
    /// An i/o error occurred on the socket.
    #[error("an i/o error occurred")]
    IO(#[source] std::io::Error),
    /// The descriptor is not a socket type this transport can frame.
    #[error("unsupported socket type {0:?}")]
    UnsupportedSocket(SockType),
    /// The payload does not fit in a frame.
    #[error("the message is too large to send")]
    TooLarge,
    /// The message did not arrive whole.
    #[error("the message was truncated")]
    Truncated,
    /// The remote peer closed the connection.
    #[error("connection closed by peer")]
    Disconnected,
    #[error("failed to mark a received descriptor close-on-exec")]
    CloseOnExec(#[source] Errno),
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::ConnectionReset => Self::Disconnected,
            std::io::ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::IO(value),
        }
    }
}

impl From<Errno> for TransportError {
    fn from(value: Errno) -> Self {
        std::io::Error::from(value).into()
    }
}

/// How a socket delimits messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// `SOCK_SEQPACKET`. Records keep their boundaries, and a single send is accepted whole or not at all.
    ///
    /// A record must fit the socket's send buffer. Larger sends fail with `EMSGSIZE`.
    Datagram,
    /// `SOCK_STREAM`. Boundaries are rebuilt from the length prefix.
    Stream,
}

impl Discipline {
    /// Determines the discipline of a socket from `SO_TYPE`.
    pub fn probe(fd: BorrowedFd<'_>) -> Result<Self, TransportError> {
        match getsockopt(&fd, sockopt::SockType)? {
            SockType::SeqPacket => Ok(Self::Datagram),
            SockType::Stream => Ok(Self::Stream),
            other => Err(TransportError::UnsupportedSocket(other)),
        }
    }

    fn sock_type(self) -> SockType {
        match self {
            Self::Datagram => SockType::SeqPacket,
            Self::Stream => SockType::Stream,
        }
    }
}

/// A message taken off a [`Connection`].
#[derive(Debug)]
pub struct Received {
    /// Number of payload bytes written to the front of the buffer.
    pub len: usize,
    /// Descriptors that travelled with the message.
    pub handles: Vec<OwnedFd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    ExpectLength,
    ExpectBody(usize),
    Done(usize),
}

/// One end of a connected unix socket.
///
/// The connection owns its descriptor and closes it exactly once, on drop.
#[derive(Debug)]
pub struct Connection {
    fd: OwnedFd,
    discipline: Discipline,
    #[cfg(test)]
    max_transfer: Option<usize>,
}

impl Connection {
    /// Takes ownership of a connected socket.
    ///
    /// The descriptor is closed if the socket type is not supported.
    pub fn new(fd: OwnedFd) -> Result<Self, TransportError> {
        let discipline = Discipline::probe(fd.as_fd())?;
        Ok(Self {
            fd,
            discipline,
            #[cfg(test)]
            max_transfer: None,
        })
    }

    /// Creates both ends of a new connection.
    pub fn pair(discipline: Discipline) -> Result<(Self, Self), TransportError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            discipline.sock_type(),
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Sends one message.
    #[tracing::instrument(level = "trace", skip_all, fields(len = payload.len(), handles = handles.len()))]
    pub fn send(&self, payload: &[u8], handles: &[BorrowedFd<'_>]) -> Result<(), TransportError> {
        assert!(
            handles.len() <= MAX_HANDLES,
            "{} handles exceed the per-message limit",
            handles.len()
        );
        let fds = handles.iter().map(AsRawFd::as_raw_fd).collect::<Vec<_>>();

        match self.discipline {
            Discipline::Datagram => {
                let len = self.transfer_out(payload, &fds)?;
                if len != payload.len() {
                    return Err(TransportError::Truncated);
                }
            }
            Discipline::Stream => {
                let len =
                    FrameLength::try_from(payload.len()).map_err(|_| TransportError::TooLarge)?;
                let mut fds = fds.as_slice();
                self.write_all(&len.to_be_bytes(), &mut fds)?;
                self.write_all(payload, &mut fds)?;
            }
        }

        Ok(())
    }

    /// Receives one message into `buffer`, accepting at most `max_handles` descriptors.
    ///
    /// A message that does not arrive whole is dropped, along with every descriptor that came with it.
    ///
    /// On a datagram connection an empty record cannot be told apart from end of file, so one that is read
    /// after the peer has hung up reports [`TransportError::Disconnected`].
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn receive(
        &self,
        buffer: &mut [u8],
        max_handles: usize,
    ) -> Result<Received, TransportError> {
        assert!(
            max_handles <= MAX_HANDLES,
            "{max_handles} handles exceed the per-message limit"
        );

        let mut handles = Vec::new();
        let result = match self.discipline {
            Discipline::Datagram => self.receive_record(buffer, max_handles, &mut handles),
            Discipline::Stream => self.receive_frame(buffer, max_handles, &mut handles),
        };

        match result {
            Ok(len) => Ok(Received { len, handles }),
            Err(error) => {
                if !handles.is_empty() {
                    tracing::debug!(count = handles.len(), "closing handles of a failed message");
                }
                Err(error)
            }
        }
    }

    /// Checks, without blocking, whether the peer still holds its end open.
    pub fn is_connected(&self) -> bool {
        let mut fds = [PollFd::new(&self.fd, PollFlags::empty())];
        match poll(&mut fds, 0) {
            Ok(_) => !fds[0]
                .revents()
                .is_some_and(|v| v.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)),
            Err(_) => false,
        }
    }

    /// Shuts down both directions, waking any thread blocked on this connection.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        match shutdown(self.fd.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn receive_record(
        &self,
        buffer: &mut [u8],
        max_handles: usize,
        handles: &mut Vec<OwnedFd>,
    ) -> Result<usize, TransportError> {
        let len = self.transfer_in(buffer, max_handles, handles, true)?;

        // An empty record and a hang-up read the same; only the latter leaves the socket hung up.
        if len == 0 && handles.is_empty() && !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(len)
    }

    fn receive_frame(
        &self,
        buffer: &mut [u8],
        max_handles: usize,
        handles: &mut Vec<OwnedFd>,
    ) -> Result<usize, TransportError> {
        let mut prefix = [0u8; LENGTH_SIZE];
        let mut state = ReceiveState::ExpectLength;
        let mut filled = 0;
        let mut first = true;

        loop {
            let target = match state {
                ReceiveState::ExpectLength => &mut prefix[filled..],
                ReceiveState::ExpectBody(len) => &mut buffer[filled..len],
                ReceiveState::Done(len) => return Ok(len),
            };

            let remaining = target.len();
            if remaining > 0 {
                let len = self.transfer_in(target, max_handles, handles, first)?;
                first = false;

                if len == 0 {
                    return Err(match (state, filled) {
                        (ReceiveState::ExpectLength, 0) => TransportError::Disconnected,
                        _ => TransportError::Truncated,
                    });
                }

                filled += len;
                if len < remaining {
                    continue;
                }
            }

            state = match state {
                ReceiveState::ExpectLength => {
                    let len = FrameLength::from_be_bytes(prefix) as usize;
                    if len > buffer.len() {
                        tracing::debug!(len, capacity = buffer.len(), "frame exceeds buffer");
                        return Err(TransportError::Truncated);
                    }
                    ReceiveState::ExpectBody(len)
                }
                ReceiveState::ExpectBody(len) => ReceiveState::Done(len),
                done => done,
            };
            filled = 0;
        }
    }

    fn write_all(&self, mut bytes: &[u8], fds: &mut &[RawFd]) -> Result<(), TransportError> {
        while !bytes.is_empty() {
            let len = self.transfer_out(bytes, fds)?;
            *fds = &[];
            bytes = &bytes[len..];
        }
        Ok(())
    }

    fn transfer_out(&self, bytes: &[u8], fds: &[RawFd]) -> Result<usize, TransportError> {
        let iov = [IoSlice::new(&bytes[..self.transfer_len(bytes.len())])];
        let rights = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

        loop {
            match sendmsg::<()>(self.fd.as_raw_fd(), &iov, cmsgs, SEND_FLAGS, None) {
                Ok(len) => return Ok(len),
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn transfer_in(
        &self,
        bytes: &mut [u8],
        max_handles: usize,
        handles: &mut Vec<OwnedFd>,
        first: bool,
    ) -> Result<usize, TransportError> {
        let len = self.transfer_len(bytes.len());
        let mut iov = [IoSliceMut::new(&mut bytes[..len])];
        let mut cmsg_buffer = cmsg_buffer(max_handles);

        let (len, flags, received) = loop {
            match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                cmsg_buffer.as_mut(),
                RECV_FLAGS,
            ) {
                Ok(msg) => {
                    let mut received = Vec::new();
                    for message in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(fds) = message {
                            // SAFETY: the kernel just installed these descriptors in this process and nothing else
                            // refers to them.
                            received.extend(
                                fds.into_iter()
                                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                            );
                        }
                    }
                    break (msg.bytes, msg.flags, received);
                }
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(error) => return Err(error.into()),
            }
        };

        assert!(
            first || received.is_empty(),
            "handles arrived after the first transfer of a message"
        );
        handles.extend(received);

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        mark_cloexec(handles)?;

        if flags.intersects(MsgFlags::MSG_CTRUNC | MsgFlags::MSG_TRUNC) || handles.len() > max_handles
        {
            tracing::debug!(?flags, handles = handles.len(), max_handles, "message truncated");
            return Err(TransportError::Truncated);
        }

        Ok(len)
    }

    #[inline]
    fn transfer_len(&self, len: usize) -> usize {
        #[cfg(test)]
        let len = match (self.discipline, self.max_transfer) {
            (Discipline::Stream, Some(max)) => len.min(max),
            _ => len,
        };
        len
    }

    #[cfg(test)]
    fn limit_transfers(mut self, max: usize) -> Self {
        self.max_transfer = Some(max);
        self
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<Connection> for OwnedFd {
    fn from(value: Connection) -> Self {
        value.fd
    }
}

fn cmsg_buffer(max_handles: usize) -> Option<Vec<u8>> {
    if max_handles == 0 {
        return None;
    }

    let len = (max_handles * std::mem::size_of::<RawFd>()) as libc::c_uint;
    // SAFETY: CMSG_SPACE is plain arithmetic on its argument.
    let space = unsafe { libc::CMSG_SPACE(len) } as usize;
    Some(vec![0u8; space])
}

/// Marks every handle close-on-exec, for platforms where `recvmsg` cannot do it atomically.
///
/// On failure the caller still owns (and closes) all of the handles.
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
fn mark_cloexec(handles: &[OwnedFd]) -> Result<(), TransportError> {
    for handle in handles {
        fcntl(handle.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(TransportError::CloseOnExec)?;
    }
    Ok(())
}
