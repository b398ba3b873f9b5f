//! Error kinds reported by sockets, the reactor and the resolver.

use std::io;

use thiserror::Error;

/// Failure conditions of socket operations.
///
/// Operations a backend does not implement report [`Error::NotSupported`];
/// wrong arguments (including arguments invalid for the socket's current
/// state) report [`Error::InvalidArgument`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range input.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Mutation attempted on a shared packet.
    #[error("permission denied: packet is shared")]
    PermissionDenied,
    /// Packet already linked into a list.
    #[error("packet is already linked into a list")]
    Busy,
    /// Operation not implemented by the socket's backend.
    #[error("operation not supported by this socket")]
    NotSupported,
    /// Non-blocking operation not ready; retry on the next readiness event.
    #[error("operation would block")]
    WouldBlock,
    /// Orderly close by the peer.
    #[error("connection closed by peer")]
    Closed,
    /// Abrupt termination by the peer.
    #[error("connection reset by peer")]
    Reset,
    #[error("out of memory")]
    OutOfMemory,
    /// Any other platform error, carrying the OS error code.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl Error {
    /// Negative errno equivalent, for callers bridging to C-style status codes.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::PermissionDenied => -libc::EPERM,
            Error::Busy => -libc::EBUSY,
            Error::NotSupported => -libc::ENOSYS,
            Error::WouldBlock => -libc::EAGAIN,
            Error::Closed => -libc::EPIPE,
            Error::Reset => -libc::ECONNRESET,
            Error::OutOfMemory => -libc::ENOMEM,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Error::Reset,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::Closed,
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ if e.raw_os_error() == Some(libc::ENOMEM) => Error::OutOfMemory,
            _ => Error::Io(e),
        }
    }
}

impl From<transit_packet::Error> for Error {
    fn from(e: transit_packet::Error) -> Self {
        match e {
            transit_packet::Error::InvalidArgument(msg) => Error::InvalidArgument(msg),
            transit_packet::Error::PermissionDenied => Error::PermissionDenied,
            transit_packet::Error::Busy => Error::Busy,
            transit_packet::Error::NotFound => Error::InvalidArgument("packet is not in this list"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
