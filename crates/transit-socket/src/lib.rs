//! # transit-socket
//!
//! Non-blocking IPv4 sockets exchanging bytes, scatter-gather vectors and
//! [`transit_packet`] packets, driven by a single-threaded reactor, plus a
//! cancellable asynchronous hostname resolver.
//!
//! A [`Socket`] dispatches every operation to a backend chosen at
//! construction (UDP or TCP); operations a backend lacks report
//! [`Error::NotSupported`]. Readiness callbacks and resolver completions run
//! on the [`Reactor`]'s thread.
//!
//! ## Crate structure
//!
//! - [`socket`] — Socket front end, receive pool wiring, typed options
//! - [`backend`] — Backend operation table and generic packet I/O
//! - [`udp`] / [`tcp`] — Transport backends
//! - [`pool`] — Per-socket receive packet pool
//! - [`option`] — Option index and RFC 2474 class selectors
//! - [`reactor`] — mio-based readiness loop and cross-thread handle
//! - [`resolver`] — Asynchronous, cancellable `getaddrinfo`
//! - [`addr`] — Textual endpoint parsing
//! - [`config`] — TOML configuration
//! - [`error`] — Error kinds

pub mod addr;
pub mod backend;
pub mod config;
pub mod error;
pub mod option;
pub mod pool;
pub mod reactor;
pub mod resolver;
pub mod socket;
pub mod tcp;
pub mod udp;

mod sys;

pub use addr::UdpEndpoint;
pub use backend::{Recv, RecvMsg, SendMsg, SocketBackend, SocketKind};
pub use config::{EchoConfig, SocketConfig};
pub use error::{Error, Result};
pub use option::{ClassSelector, SocketOption};
pub use pool::{RxPool, RXPKT_MAX_SIZE_DEFAULT};
pub use reactor::{Reactor, ReactorHandle, Readiness};
pub use resolver::{RequestId, ResolveError, ResolveResult, Resolver, ResolverBackend};
pub use socket::Socket;
