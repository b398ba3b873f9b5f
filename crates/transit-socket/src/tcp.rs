//! # TCP Backend
//!
//! One backend serves the client, listener and accepted roles; the role is
//! fixed by the first of `connect` / `listen`, or by `accept` for the
//! sockets it yields. Connects are non-blocking: completion (or failure)
//! is observed through `OUT`/`ERR` readiness and the pending-error option.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use transit_packet::Packet;

use crate::backend::{
    abort_on_close, common_option, set_common_option, EventSlot, Recv, SocketBackend,
    SocketKind,
};
use crate::error::{Error, Result};
use crate::option::SocketOption;
use crate::reactor::{EventCallback, Reactor, Readiness};
use crate::sys;

/// Pending-connection queue length for listeners.
pub const LISTEN_BACKLOG: i32 = 16;

/// Role and progress of a stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Idle,
    Connecting,
    Connected,
    Listening,
}

pub struct TcpBackend {
    // Declared first: deregisters from the reactor before the fd closes.
    events: EventSlot,
    socket: Socket,
    state: TcpState,
    remote: Option<SocketAddrV4>,
    reset_on_close: bool,
    /// Packet whose head is already on the wire, and how many bytes of it.
    tx_partial: Option<(Packet, usize)>,
}

impl TcpBackend {
    pub fn new(reactor: &Reactor) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(TcpBackend {
            events: EventSlot::new(reactor.clone()),
            socket,
            state: TcpState::Idle,
            remote: None,
            reset_on_close: false,
            tx_partial: None,
        })
    }

    fn accepted(reactor: &Reactor, socket: Socket, remote: SocketAddrV4) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(TcpBackend {
            events: EventSlot::new(reactor.clone()),
            socket,
            state: TcpState::Connected,
            remote: Some(remote),
            reset_on_close: false,
            tx_partial: None,
        })
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    fn require_stream(&self) -> Result<()> {
        match self.state {
            TcpState::Connected | TcpState::Connecting => Ok(()),
            TcpState::Idle | TcpState::Listening => {
                Err(Error::InvalidArgument("socket is not connected"))
            }
        }
    }

    fn require_idle(&self) -> Result<()> {
        if self.state != TcpState::Idle {
            return Err(Error::InvalidArgument("socket already connected or listening"));
        }
        Ok(())
    }

    /// Successful I/O on a connecting socket means the handshake is done.
    fn mark_connected(&mut self) {
        if self.state == TcpState::Connecting {
            self.state = TcpState::Connected;
            debug!(fd = self.fd(), "tcp connection established");
        }
    }

    fn bind_local(&self, local: SocketAddrV4) -> Result<()> {
        self.socket.set_reuse_address(true)?;
        self.socket.bind(&local.into())?;
        Ok(())
    }
}

impl SocketBackend for TcpBackend {
    fn kind(&self) -> SocketKind {
        SocketKind::Tcp
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn local_addr(&self) -> Result<SocketAddrV4> {
        self.socket
            .local_addr()?
            .as_socket_ipv4()
            .ok_or(Error::InvalidArgument("socket is not IPv4"))
    }

    fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    fn option(&self, opt: SocketOption) -> Result<i32> {
        match opt {
            SocketOption::NoDelay => Ok(i32::from(self.socket.nodelay()?)),
            SocketOption::Reset => Ok(i32::from(self.reset_on_close)),
            _ => common_option(&self.socket, opt),
        }
    }

    fn set_option(&mut self, opt: SocketOption, value: i32) -> Result<()> {
        match opt {
            SocketOption::NoDelay => Ok(self.socket.set_nodelay(value != 0)?),
            SocketOption::Reset => {
                self.reset_on_close = value != 0;
                Ok(())
            }
            _ => set_common_option(&self.socket, opt, value),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Recv> {
        self.readv(&mut [IoSliceMut::new(buf)])
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writev(&[IoSlice::new(buf)])
    }

    fn readv(&mut self, iov: &mut [IoSliceMut<'_>]) -> Result<Recv> {
        self.require_stream()?;
        let wanted: usize = iov.iter().map(|s| s.len()).sum();
        let (len, _) = sys::recv_msg(self.fd(), iov)?;
        if len == 0 && wanted > 0 {
            debug!(fd = self.fd(), "tcp peer closed");
            return Err(Error::Closed);
        }
        self.mark_connected();
        Ok(Recv {
            len,
            ts_us: transit_packet::clock::now_us(),
        })
    }

    fn writev(&mut self, iov: &[IoSlice<'_>]) -> Result<usize> {
        self.require_stream()?;
        let n = sys::send_msg(self.fd(), iov, None, None)?;
        self.mark_connected();
        Ok(n)
    }

    /// Streams have no message boundary: a short write leaves the sent head
    /// on the wire. The backend remembers how far it got and reports
    /// `WouldBlock`; writing the same packet again resumes at that offset.
    /// Another packet is refused until the partial one is finished.
    fn write_pkt(&mut self, pkt: &Packet) -> Result<()> {
        self.require_stream()?;
        let mut sent = match &self.tx_partial {
            Some((partial, sent)) if partial.ptr_eq(pkt) => *sent,
            Some(_) => return Err(Error::InvalidArgument("another packet is partially sent")),
            None => 0,
        };
        while sent < pkt.len() {
            let iov = [IoSlice::new(&pkt.data()[sent..])];
            let written = sys::send_msg(self.fd(), &iov, None, None).and_then(|n| match n {
                0 => Err(io::Error::from(io::ErrorKind::WriteZero)),
                n => Ok(n),
            });
            match written {
                Ok(n) => {
                    self.mark_connected();
                    sent += n;
                }
                Err(e) => {
                    let e = Error::from(e);
                    if sent > 0 {
                        trace!(fd = self.fd(), sent, len = pkt.len(), "tcp packet partially sent");
                        self.tx_partial = Some((pkt.clone(), sent));
                    }
                    return Err(e);
                }
            }
        }
        self.tx_partial = None;
        Ok(())
    }

    fn set_event_cb(&mut self, events: Readiness, cb: Option<EventCallback>) -> Result<()> {
        let fd = self.fd();
        self.events.set(fd, events, cb)
    }

    fn update_events(&mut self, add: Readiness, remove: Readiness) -> Result<()> {
        self.events.update(add, remove)
    }

    fn connect(&mut self, local: SocketAddrV4, remote: Option<SocketAddrV4>) -> Result<()> {
        self.require_idle()?;
        let remote = remote.ok_or(Error::InvalidArgument("stream connect needs a remote address"))?;
        if !local.ip().is_unspecified() || local.port() != 0 {
            self.bind_local(local)?;
        }
        match self.socket.connect(&remote.into()) {
            Ok(()) => self.state = TcpState::Connected,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                self.state = TcpState::Connecting
            }
            Err(e) => return Err(e.into()),
        }
        self.remote = Some(remote);
        debug!(fd = self.fd(), remote = %remote, state = ?self.state, "tcp connect started");
        Ok(())
    }

    fn listen(&mut self, local: SocketAddrV4) -> Result<()> {
        self.require_idle()?;
        self.bind_local(local)?;
        self.socket.listen(LISTEN_BACKLOG)?;
        self.state = TcpState::Listening;
        debug!(fd = self.fd(), local = %self.local_addr()?, "tcp listening");
        Ok(())
    }

    fn accept(&mut self) -> Result<(Box<dyn SocketBackend>, SocketAddrV4)> {
        if self.state != TcpState::Listening {
            return Err(Error::InvalidArgument("socket is not listening"));
        }
        let (socket, peer) = self.socket.accept()?;
        let peer = peer
            .as_socket_ipv4()
            .ok_or(Error::InvalidArgument("peer is not IPv4"))?;
        let backend = TcpBackend::accepted(self.events.reactor(), socket, peer)?;
        debug!(fd = backend.fd(), peer = %peer, "tcp connection accepted");
        Ok((Box::new(backend), peer))
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        let live = matches!(self.state, TcpState::Connected | TcpState::Connecting);
        if self.reset_on_close && live {
            if let Err(e) = abort_on_close(&self.socket) {
                warn!(fd = self.fd(), error = %e, "failed to arm reset on close");
            }
        }
        debug!(fd = self.fd(), state = ?self.state, "tcp socket closed");
    }
}
