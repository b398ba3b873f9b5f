//! # Socket Options and QoS
//!
//! Options are read and written through one index ([`SocketOption`]) so a
//! new option does not change the backend interface.
//!
//! The class selector is an RFC 2474 codepoint expressed as the IP TOS byte
//! written to the socket: class `n` is `n << 5`, the same values as the
//! `IPTOS_PREC_*` constants.

/// Option index for [`crate::Socket::option`] / [`crate::Socket::set_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// Kernel receive buffer size in bytes.
    RxBufSize,
    /// Kernel send buffer size in bytes.
    TxBufSize,
    /// Class selector (TOS byte) of outgoing packets.
    ClassSelector,
    /// TCP no-delay (0/1). Stream sockets only.
    NoDelay,
    /// Pending socket error, cleared on read. Read-only.
    Error,
    /// Send a reset instead of an orderly close on destroy (0/1). Stream
    /// sockets only.
    Reset,
}

/// RFC 2474 class selector codepoint, stored as a TOS byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassSelector(u8);

impl ClassSelector {
    pub const CS0: ClassSelector = ClassSelector(0);
    pub const CS1: ClassSelector = ClassSelector(1 << 5);
    pub const CS2: ClassSelector = ClassSelector(2 << 5);
    pub const CS3: ClassSelector = ClassSelector(3 << 5);
    pub const CS4: ClassSelector = ClassSelector(4 << 5);
    pub const CS5: ClassSelector = ClassSelector(5 << 5);
    pub const CS6: ClassSelector = ClassSelector(6 << 5);
    pub const CS7: ClassSelector = ClassSelector(7 << 5);

    /// Wrap a raw TOS byte.
    pub const fn from_tos(tos: u8) -> Self {
        ClassSelector(tos)
    }

    /// Raw TOS byte.
    pub const fn tos(self) -> u8 {
        self.0
    }

    /// Class selector for a packet priority in `0..=7`.
    pub fn from_priority(priority: u8) -> Option<Self> {
        (priority <= transit_packet::PRIORITY_MAX).then_some(ClassSelector(priority << 5))
    }

    /// Precedence class (0..=7).
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_maps_to_class() {
        assert_eq!(ClassSelector::from_priority(0), Some(ClassSelector::CS0));
        assert_eq!(ClassSelector::from_priority(5), Some(ClassSelector::CS5));
        assert_eq!(ClassSelector::from_priority(8), None);
        assert_eq!(ClassSelector::CS6.tos(), 0xC0);
        assert_eq!(ClassSelector::CS6.class(), 6);
    }
}
