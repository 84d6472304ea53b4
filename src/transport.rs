//! Unix-domain socket transport.
//!
//! SOCK_SEQPACKET keeps one protocol message per packet, so framing is the
//! kernel's problem. Every send uses MSG_NOSIGNAL so a vanished peer surfaces
//! as EPIPE instead of killing the process, and at most one file descriptor
//! rides along per message as SCM_RIGHTS ancillary data.

#![allow(unsafe_code)]

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept, bind, connect, listen, recvmsg, sendmsg, socket, AddressFamily, Backlog,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use thiserror::Error;

/// Upper bound on a whole message, header and payload together.
pub const MAX_MESSAGE_BYTES: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind socket at {path}: {source}")]
    Bind { path: PathBuf, source: Errno },

    /// The peer closed the connection or vanished.
    #[error("peer disconnected")]
    Disconnected,

    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_BYTES}-byte bound")]
    Oversized(usize),

    #[error("socket operation failed: {0}")]
    Socket(#[from] Errno),

    #[error("descriptor duplication failed: {0}")]
    Dup(#[from] std::io::Error),
}

/// Creates a listening SOCK_SEQPACKET socket at `path`.
///
/// The caller is responsible for removing any stale socket file first; bind
/// fails if the path already exists.
///
/// # Errors
///
/// Returns [`TransportError::Bind`] when the address is unusable and
/// [`TransportError::Socket`] for other socket failures.
pub fn bind_and_listen(path: &Path) -> Result<OwnedFd, TransportError> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    bind(fd.as_raw_fd(), &addr).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    listen(&fd, Backlog::new(1)?)?;
    Ok(fd)
}

/// Accepts one connection, retrying on EINTR.
///
/// # Errors
///
/// Returns [`TransportError::Socket`] when accept fails.
pub fn accept_retry(listener: BorrowedFd<'_>) -> Result<OwnedFd, TransportError> {
    loop {
        match accept(listener.as_raw_fd()) {
            Ok(fd) => return Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Connects to the supervisor socket at `path`.
///
/// # Errors
///
/// Returns [`TransportError::Socket`] when the socket cannot be created or
/// the connection is refused.
pub fn connect_to(path: &Path) -> Result<OwnedFd, TransportError> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    loop {
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => return Ok(fd),
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Wraps a raw descriptor inherited from a parent process.
#[must_use]
pub fn adopt_raw(fd: RawFd) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn send_on(fd: BorrowedFd<'_>, buf: &[u8], fds: &[RawFd]) -> Result<(), TransportError> {
    if buf.len() > MAX_MESSAGE_BYTES {
        return Err(TransportError::Oversized(buf.len()));
    }
    let iov = [IoSlice::new(buf)];
    let rights;
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() {
        &[]
    } else {
        rights = [ControlMessage::ScmRights(fds)];
        &rights
    };
    loop {
        match sendmsg::<UnixAddr>(fd.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => {}
            Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(TransportError::Disconnected),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Sends one message with no ancillary data.
///
/// # Errors
///
/// Returns [`TransportError::Disconnected`] when the peer has gone away.
pub fn send(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<(), TransportError> {
    send_on(fd, buf, &[])
}

/// Sends one message carrying a duplicated copy of `payload_fd`.
///
/// # Errors
///
/// Returns [`TransportError::Disconnected`] when the peer has gone away.
pub fn send_with_fd(
    fd: BorrowedFd<'_>,
    buf: &[u8],
    payload_fd: BorrowedFd<'_>,
) -> Result<(), TransportError> {
    send_on(fd, buf, &[payload_fd.as_raw_fd()])
}

/// Receives one message and any ancillary file descriptor it carried.
///
/// # Errors
///
/// Returns [`TransportError::Disconnected`] on peer EOF.
pub fn receive(fd: BorrowedFd<'_>) -> Result<(Vec<u8>, Option<OwnedFd>), TransportError> {
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
    let (len, payload_fd) = loop {
        let mut iov = [IoSliceMut::new(&mut buf)];
        match recvmsg::<UnixAddr>(
            fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut payload_fd = None;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        payload_fd = fds
                            .first()
                            .map(|&raw| unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
                break (msg.bytes, payload_fd);
            }
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    };
    // A zero-byte read with no fd is taken as peer EOF. An empty
    // SEQPACKET datagram would look the same, but every protocol message
    // starts with a kind field and so encodes to at least one byte.
    if len == 0 && payload_fd.is_none() {
        return Err(TransportError::Disconnected);
    }
    buf.truncate(len);
    Ok((buf, payload_fd))
}

/// Blocks until at least one of `fds` is readable, returning a readiness
/// flag per descriptor in the same order.
///
/// # Errors
///
/// Returns [`TransportError::Socket`] when poll itself fails.
pub fn wait_readable<const N: usize>(
    fds: [BorrowedFd<'_>; N],
) -> Result<[bool; N], TransportError> {
    let mut poll_fds: Vec<PollFd> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    loop {
        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
    let mut ready = [false; N];
    for (slot, poll_fd) in ready.iter_mut().zip(&poll_fds) {
        let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
        *slot = revents
            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
    }
    Ok(ready)
}

/// Empties a non-blocking pipe's read end.
pub fn drain_pipe(fd: BorrowedFd<'_>) {
    let mut sink = [0u8; 64];
    loop {
        match nix::unistd::read(fd.as_raw_fd(), &mut sink) {
            Ok(0) => return,
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(_) => return,
        }
    }
}

/// A bidirectional message channel to the peer.
///
/// The read and write halves are usually the same accepted socket, but a
/// bootstrapping parent may hand over a pre-split pair.
#[derive(Debug)]
pub struct Connection {
    read: OwnedFd,
    write: OwnedFd,
}

impl Connection {
    /// Uses one socket for both directions.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Dup`] when the descriptor cannot be
    /// duplicated for the second role.
    pub fn from_socket(socket: OwnedFd) -> Result<Self, TransportError> {
        let write = socket.try_clone()?;
        Ok(Self {
            read: socket,
            write,
        })
    }

    #[must_use]
    pub fn from_split(read: OwnedFd, write: OwnedFd) -> Self {
        Self { read, write }
    }

    #[must_use]
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// # Errors
    ///
    /// See [`send`].
    pub fn send(&self, buf: &[u8]) -> Result<(), TransportError> {
        send(self.write.as_fd(), buf)
    }

    /// # Errors
    ///
    /// See [`send_with_fd`].
    pub fn send_with_fd(
        &self,
        buf: &[u8],
        payload_fd: BorrowedFd<'_>,
    ) -> Result<(), TransportError> {
        send_with_fd(self.write.as_fd(), buf, payload_fd)
    }

    /// # Errors
    ///
    /// See [`receive`].
    pub fn receive(&self) -> Result<(Vec<u8>, Option<OwnedFd>), TransportError> {
        receive(self.read.as_fd())
    }
}
