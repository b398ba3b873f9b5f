//! # Socket
//!
//! [`Socket`] is the caller-facing handle: it owns one backend (chosen at
//! construction), the receive-packet pool, and a handle to the reactor the
//! socket's events are dispatched on. Textual endpoints are parsed here;
//! backends only see typed addresses.

use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddrV4;
use std::os::fd::RawFd;

use tracing::{debug, trace};
use transit_packet::{Packet, PacketList};

use crate::addr::{local_endpoint, peer_endpoint, remote_endpoint, UdpEndpoint};
use crate::backend::{Recv, RecvMsg, SendMsg, SocketBackend, SocketKind};
use crate::config::SocketConfig;
use crate::error::{Error, Result};
use crate::option::{ClassSelector, SocketOption};
use crate::pool::{RxPool, RXPKT_MAX_SIZE_DEFAULT};
use crate::reactor::{Reactor, Readiness};
use crate::tcp::TcpBackend;
use crate::udp::UdpBackend;

/// Socket bound to a reactor.
pub struct Socket {
    backend: Box<dyn SocketBackend>,
    pool: RxPool,
    reactor: Reactor,
}

impl Socket {
    /// Datagram socket, bound and ready for unconnected I/O.
    pub fn udp(reactor: &Reactor, endpoint: &UdpEndpoint) -> Result<Socket> {
        let backend = UdpBackend::bind(reactor, endpoint)?;
        Ok(Socket::from_backend(reactor, Box::new(backend)))
    }

    /// Stream socket; becomes a client with [`Socket::connect`] or a
    /// listener with [`Socket::listen`].
    pub fn tcp(reactor: &Reactor) -> Result<Socket> {
        let backend = TcpBackend::new(reactor)?;
        Ok(Socket::from_backend(reactor, Box::new(backend)))
    }

    /// Socket over a caller-supplied backend.
    pub fn from_backend(reactor: &Reactor, backend: Box<dyn SocketBackend>) -> Socket {
        Socket {
            backend,
            pool: RxPool::new(RXPKT_MAX_SIZE_DEFAULT),
            reactor: reactor.clone(),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.backend.kind()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn fd(&self) -> RawFd {
        self.backend.fd()
    }

    // ─── Addressing ──────────────────────────────────────────────────────

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.backend.local_addr()
    }

    /// Bound local port; the allocated one when created with port 0.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.local_addr()?.port())
    }

    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.backend.remote_addr()
    }

    /// Remote port, 0 when unknown.
    pub fn remote_port(&self) -> u16 {
        self.remote_addr().map_or(0, |a| a.port())
    }

    /// Record the default destination of a datagram socket.
    pub fn set_remote(&mut self, addr: Option<&str>, port: u16) -> Result<()> {
        let remote = remote_endpoint(addr, port)?;
        self.backend.set_remote(remote)
    }

    /// Datagram: restrict traffic to the remote peer, or dissolve the
    /// association when `remote_addr` is absent. Stream: start the
    /// non-blocking handshake; completion is signalled by `OUT` readiness.
    pub fn connect(
        &mut self,
        local_addr: Option<&str>,
        local_port: u16,
        remote_addr: Option<&str>,
        remote_port: u16,
    ) -> Result<()> {
        let local = local_endpoint(local_addr, local_port)?;
        let remote = peer_endpoint(remote_addr, remote_port)?;
        self.backend.connect(local, remote)
    }

    /// Bind to the local endpoint and accept connections.
    pub fn listen(&mut self, local_addr: Option<&str>, local_port: u16) -> Result<()> {
        let local = local_endpoint(local_addr, local_port)?;
        self.backend.listen(local)
    }

    /// Take one pending connection as a new socket on the same reactor.
    pub fn accept(&mut self) -> Result<(Socket, SocketAddrV4)> {
        let (backend, peer) = self.backend.accept()?;
        let mut socket = Socket::from_backend(&self.reactor, backend);
        socket.pool.set_max_size(self.pool.max_size());
        Ok((socket, peer))
    }

    // ─── Options ─────────────────────────────────────────────────────────

    pub fn option(&self, opt: SocketOption) -> Result<i32> {
        self.backend.option(opt)
    }

    pub fn set_option(&mut self, opt: SocketOption, value: i32) -> Result<()> {
        self.backend.set_option(opt, value)
    }

    pub fn rx_buffer_size(&self) -> Result<usize> {
        Ok(self.option(SocketOption::RxBufSize)?.max(0) as usize)
    }

    pub fn set_rx_buffer_size(&mut self, size: usize) -> Result<()> {
        self.set_option(SocketOption::RxBufSize, clamp_i32(size))
    }

    pub fn tx_buffer_size(&self) -> Result<usize> {
        Ok(self.option(SocketOption::TxBufSize)?.max(0) as usize)
    }

    pub fn set_tx_buffer_size(&mut self, size: usize) -> Result<()> {
        self.set_option(SocketOption::TxBufSize, clamp_i32(size))
    }

    pub fn class_selector(&self) -> Result<ClassSelector> {
        let tos = self.option(SocketOption::ClassSelector)?;
        Ok(ClassSelector::from_tos(tos.clamp(0, 255) as u8))
    }

    pub fn set_class_selector(&mut self, cs: ClassSelector) -> Result<()> {
        self.set_option(SocketOption::ClassSelector, i32::from(cs.tos()))
    }

    pub fn nodelay(&self) -> Result<bool> {
        Ok(self.option(SocketOption::NoDelay)? != 0)
    }

    pub fn set_nodelay(&mut self, on: bool) -> Result<()> {
        self.set_option(SocketOption::NoDelay, i32::from(on))
    }

    pub fn reset_on_close(&self) -> Result<bool> {
        Ok(self.option(SocketOption::Reset)? != 0)
    }

    pub fn set_reset_on_close(&mut self, on: bool) -> Result<()> {
        self.set_option(SocketOption::Reset, i32::from(on))
    }

    /// Pending socket error code, 0 if none. Reading clears it.
    pub fn take_error(&self) -> Result<i32> {
        self.option(SocketOption::Error)
    }

    /// Capacity of packets produced by the packet-receiving operations.
    pub fn rxpkt_max_size(&self) -> usize {
        self.pool.max_size()
    }

    /// Change the receive packet capacity. Pooled packets are released.
    pub fn set_rxpkt_max_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("receive packet size must be non-zero"));
        }
        self.pool.set_max_size(size);
        Ok(())
    }

    /// Apply every configured option. Options the backend does not support
    /// are skipped.
    pub fn apply_config(&mut self, config: &SocketConfig) -> Result<()> {
        self.set_rxpkt_max_size(config.rxpkt_max_size)?;
        let settings = [
            (SocketOption::RxBufSize, config.rx_buffer_size.map(clamp_i32)),
            (SocketOption::TxBufSize, config.tx_buffer_size.map(clamp_i32)),
            (
                SocketOption::ClassSelector,
                config.class_selector.map(|cs| i32::from(cs.tos())),
            ),
            (SocketOption::NoDelay, config.nodelay.map(i32::from)),
            (SocketOption::Reset, config.reset_on_close.map(i32::from)),
        ];
        for (opt, value) in settings {
            let Some(value) = value else { continue };
            match self.set_option(opt, value) {
                Ok(()) => {}
                Err(Error::NotSupported) => {
                    trace!(?opt, kind = ?self.kind(), "option not supported, skipped")
                }
                Err(e) => return Err(e),
            }
        }
        debug!(fd = self.fd(), ?config, "socket configured");
        Ok(())
    }

    // ─── Byte I/O ────────────────────────────────────────────────────────

    pub fn read(&mut self, buf: &mut [u8]) -> Result<Recv> {
        self.backend.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.backend.write(buf)
    }

    pub fn readv(&mut self, iov: &mut [IoSliceMut<'_>]) -> Result<Recv> {
        self.backend.readv(iov)
    }

    pub fn writev(&mut self, iov: &[IoSlice<'_>]) -> Result<usize> {
        self.backend.writev(iov)
    }

    pub fn write_cs(&mut self, buf: &[u8], cs: Option<ClassSelector>) -> Result<usize> {
        self.backend.write_cs(buf, cs)
    }

    pub fn writev_cs(&mut self, iov: &[IoSlice<'_>], cs: Option<ClassSelector>) -> Result<usize> {
        self.backend.writev_cs(iov, cs)
    }

    pub fn read_mmsg(&mut self, msgs: &mut [RecvMsg<'_, '_>]) -> Result<usize> {
        self.backend.read_mmsg(msgs)
    }

    pub fn write_mmsg(&mut self, msgs: &mut [SendMsg<'_, '_>]) -> Result<usize> {
        self.backend.write_mmsg(msgs)
    }

    // ─── Packet I/O ──────────────────────────────────────────────────────

    /// Receive into a caller packet, which must not be shared.
    pub fn read_pkt(&mut self, pkt: &mut Packet) -> Result<()> {
        self.backend.read_pkt(pkt)
    }

    /// Receive into a packet taken from the socket's pool.
    pub fn read_pkt_alloc(&mut self) -> Result<Packet> {
        self.backend.read_pkt_alloc(&mut self.pool)
    }

    /// Send the packet's data to its address (datagram sockets), without
    /// modifying it.
    pub fn write_pkt(&mut self, pkt: &Packet) -> Result<()> {
        self.backend.write_pkt(pkt)
    }

    /// Receive up to `max` packets onto the end of `list`.
    pub fn read_pkt_list(&mut self, list: &mut PacketList, max: usize) -> Result<usize> {
        self.backend.read_pkt_list(&mut self.pool, list, max)
    }

    /// Send and release packets from the front of `list` until one fails.
    pub fn write_pkt_list(&mut self, list: &mut PacketList) -> Result<usize> {
        self.backend.write_pkt_list(list)
    }

    /// Give a consumed packet back to the receive pool.
    pub fn recycle_pkt(&mut self, pkt: Packet) {
        self.pool.recycle(pkt);
    }

    /// Hand every packet of `list` back to the receive pool.
    pub fn recycle_pkt_list(&mut self, list: &mut PacketList) {
        while let Some(pkt) = list.pop_first() {
            self.pool.recycle(pkt);
        }
    }

    // ─── Events ──────────────────────────────────────────────────────────

    /// Call `cb` on the reactor thread whenever one of `events` (or an
    /// error/hang-up) is ready. Replaces any previous callback.
    pub fn set_event_cb(
        &mut self,
        events: Readiness,
        cb: impl FnMut(Readiness) + 'static,
    ) -> Result<()> {
        self.backend.set_event_cb(events, Some(Box::new(cb)))
    }

    /// Stop event notification.
    pub fn clear_event_cb(&mut self) -> Result<()> {
        self.backend.set_event_cb(Readiness::EMPTY, None)
    }

    /// Add and remove bits of the monitored set, keeping the callback.
    pub fn update_events(&mut self, add: Readiness, remove: Readiness) -> Result<()> {
        self.backend.update_events(add, remove)
    }
}

fn clamp_i32(v: usize) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind())
            .field("fd", &self.fd())
            .field("local", &self.local_addr().ok())
            .field("remote", &self.remote_addr())
            .field("pool", &self.pool)
            .finish()
    }
}
