//! Error type shared by packet and packet-list operations.

use thiserror::Error;

/// Failure conditions reported by [`crate::Packet`], [`crate::Buffer`] and
/// [`crate::PacketList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or out-of-range input.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Mutation attempted on a packet or buffer that is not exclusively owned.
    #[error("permission denied: object is shared")]
    PermissionDenied,
    /// The packet is already linked into a list.
    #[error("packet is already linked into a list")]
    Busy,
    /// The packet is not linked into the list addressed by the operation.
    #[error("packet is not in this list")]
    NotFound,
}

impl Error {
    /// Negative errno equivalent, for callers bridging to C-style status codes.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -22, // EINVAL
            Error::PermissionDenied => -1,    // EPERM
            Error::Busy => -16,               // EBUSY
            Error::NotFound => -2,            // ENOENT
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
