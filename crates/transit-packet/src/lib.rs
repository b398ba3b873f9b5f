//! # transit-packet
//!
//! Packet buffers for the transit socket layer.
//!
//! A [`Packet`] is a reference-counted, fixed-capacity byte buffer carrying
//! send/receive metadata. A [`PacketList`] batches packets in order, with
//! each packet linked into at most one list at a time.
//!
//! ## Crate structure
//!
//! - [`buffer`] — Shared, reference-counted backing buffer
//! - [`packet`] — Packet handle, storage variants, metadata, user data
//! - [`list`] — Slab-backed doubly-linked packet list
//! - [`clock`] — Monotonic microsecond clock used for timestamps
//! - [`error`] — Error kinds shared by the above

pub mod buffer;
pub mod clock;
pub mod error;
pub mod list;
pub mod packet;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use list::PacketList;
pub use packet::{Packet, DEFAULT_IMPORTANCE, PRIORITY_MAX};
