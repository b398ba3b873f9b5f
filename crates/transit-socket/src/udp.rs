//! # UDP Backend
//!
//! Datagram sockets are bound at creation and immediately usable for
//! unconnected send/receive. `connect` restricts traffic to one peer;
//! connecting to no peer dissolves the association.

use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};
use transit_packet::{clock, Packet, PacketList};

use crate::addr::{known_v4, UdpEndpoint};
use crate::backend::{
    common_option, set_common_option, EventSlot, Recv, RecvMsg, SendMsg, SocketBackend,
    SocketKind,
};
use crate::error::{Error, Result};
use crate::option::{ClassSelector, SocketOption};
use crate::pool::RxPool;
use crate::reactor::{EventCallback, Reactor, Readiness};
use crate::sys;

/// Datagrams received per `recvmmsg` call.
pub const MMSG_BATCH_MAX: usize = 64;

pub struct UdpBackend {
    // Declared first: deregisters from the reactor before the fd closes.
    events: EventSlot,
    socket: Socket,
    remote: Option<SocketAddrV4>,
    connected: bool,
}

impl UdpBackend {
    /// One `recvmmsg` of at most `want` datagrams, appended to `list`.
    fn recv_batch(
        &mut self,
        pool: &mut RxPool,
        list: &mut PacketList,
        want: usize,
    ) -> Result<usize> {
        let fd = self.fd();
        let mut pkts: Vec<Packet> = (0..want).map(|_| pool.alloc()).collect();
        let received = {
            let mut iovs = pkts
                .iter_mut()
                .map(Packet::io_slices_mut)
                .collect::<transit_packet::Result<Vec<_>>>()?;
            let mut msgs: Vec<RecvMsg<'_, '_>> =
                iovs.iter_mut().map(|iov| RecvMsg::new(iov)).collect();
            sys::recv_mmsg(fd, &mut msgs).map(|n| {
                msgs[..n]
                    .iter()
                    .map(|m| (m.len, m.addr, m.ts_us))
                    .collect::<Vec<_>>()
            })
        };
        let received = match received {
            Ok(received) => received,
            Err(e) => {
                for pkt in pkts {
                    pool.recycle(pkt);
                }
                return Err(e.into());
            }
        };

        let count = received.len();
        let mut pkts = pkts.into_iter();
        for ((len, from, ts), mut pkt) in received.into_iter().zip(pkts.by_ref()) {
            pkt.set_len(len)?;
            pkt.set_timestamp_us(ts)?;
            if let Some(from) = from {
                pkt.set_addr(from.into())?;
            }
            list.add_last(&pkt)?;
        }
        for pkt in pkts {
            pool.recycle(pkt);
        }
        Ok(count)
    }

    pub fn bind(reactor: &Reactor, endpoint: &UdpEndpoint) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;

        match endpoint.multicast {
            Some(group) => {
                socket.set_reuse_address(true)?;
                let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, endpoint.local.port());
                socket.bind(&any.into())?;
                socket.join_multicast_v4(&group, endpoint.local.ip())?;
            }
            None => socket.bind(&endpoint.local.into())?,
        }

        if let Some(remote) = endpoint.remote {
            if remote.ip().is_multicast() && !endpoint.local.ip().is_unspecified() {
                socket.set_multicast_if_v4(endpoint.local.ip())?;
            }
        }

        let backend = UdpBackend {
            events: EventSlot::new(reactor.clone()),
            socket,
            remote: endpoint.remote,
            connected: false,
        };
        debug!(
            fd = backend.fd(),
            local = %backend.local_addr()?,
            remote = ?endpoint.remote,
            multicast = ?endpoint.multicast,
            "udp socket bound"
        );
        Ok(backend)
    }

    /// Destination for an unconnected send: the packet's own address, else
    /// the recorded remote. `None` when the socket is connected.
    fn destination(&self, hint: Option<SocketAddrV4>) -> Result<Option<SocketAddrV4>> {
        if self.connected {
            return Ok(None);
        }
        hint.or(self.remote)
            .map(Some)
            .ok_or(Error::InvalidArgument("no remote address"))
    }

    fn send(&self, iov: &[IoSlice<'_>], dest: Option<SocketAddrV4>, tos: Option<u8>) -> Result<usize> {
        Ok(sys::send_msg(self.fd(), iov, dest.as_ref(), tos)?)
    }
}

impl SocketBackend for UdpBackend {
    fn kind(&self) -> SocketKind {
        SocketKind::Udp
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

    fn set_remote(&mut self, remote: Option<SocketAddrV4>) -> Result<()> {
        if self.connected {
            return self.connect(self.local_addr()?, remote);
        }
        self.remote = remote;
        Ok(())
    }

    fn option(&self, opt: SocketOption) -> Result<i32> {
        common_option(&self.socket, opt)
    }

    fn set_option(&mut self, opt: SocketOption, value: i32) -> Result<()> {
        set_common_option(&self.socket, opt, value)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Recv> {
        self.readv(&mut [IoSliceMut::new(buf)])
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writev(&[IoSlice::new(buf)])
    }

    fn readv(&mut self, iov: &mut [IoSliceMut<'_>]) -> Result<Recv> {
        let (len, _) = sys::recv_msg(self.fd(), iov)?;
        Ok(Recv {
            len,
            ts_us: clock::now_us(),
        })
    }

    fn writev(&mut self, iov: &[IoSlice<'_>]) -> Result<usize> {
        self.writev_cs(iov, None)
    }

    fn write_cs(&mut self, buf: &[u8], cs: Option<ClassSelector>) -> Result<usize> {
        self.writev_cs(&[IoSlice::new(buf)], cs)
    }

    fn writev_cs(&mut self, iov: &[IoSlice<'_>], cs: Option<ClassSelector>) -> Result<usize> {
        let dest = self.destination(None)?;
        self.send(iov, dest, cs.map(ClassSelector::tos))
    }

    fn read_mmsg(&mut self, msgs: &mut [RecvMsg<'_, '_>]) -> Result<usize> {
        Ok(sys::recv_mmsg(self.fd(), msgs)?)
    }

    fn write_mmsg(&mut self, msgs: &mut [SendMsg<'_, '_>]) -> Result<usize> {
        let dest = self.destination(None)?;
        Ok(sys::send_mmsg(self.fd(), msgs, dest.as_ref())?)
    }

    fn read_pkt(&mut self, pkt: &mut Packet) -> Result<()> {
        let (len, from) = sys::recv_msg(self.fd(), &mut pkt.io_slices_mut()?)?;
        let ts = clock::now_us();
        pkt.set_len(len)?;
        pkt.set_timestamp_us(ts)?;
        if let Some(from) = from {
            pkt.set_addr(from.into())?;
        }
        trace!(len, from = ?from, "udp packet received");
        Ok(())
    }

    fn write_pkt(&mut self, pkt: &Packet) -> Result<()> {
        let dest = self.destination(known_v4(pkt.addr()))?;
        let n = self.send(&pkt.io_slices(), dest, None)?;
        if n != pkt.len() {
            return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::WriteZero)));
        }
        trace!(len = n, to = ?dest, "udp packet sent");
        Ok(())
    }

    fn read_pkt_list(
        &mut self,
        pool: &mut RxPool,
        list: &mut PacketList,
        max: usize,
    ) -> Result<usize> {
        let mut total = 0;
        while total < max {
            let want = (max - total).min(MMSG_BATCH_MAX);
            match self.recv_batch(pool, list, want) {
                Ok(n) => {
                    total += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if total == 0 => return Err(e),
                Err(e) => {
                    if !e.is_would_block() {
                        warn!(error = %e, total, "udp batch receive stopped early");
                    }
                    break;
                }
            }
        }
        trace!(count = total, "udp batch received");
        Ok(total)
    }

    fn set_event_cb(&mut self, events: Readiness, cb: Option<EventCallback>) -> Result<()> {
        let fd = self.fd();
        self.events.set(fd, events, cb)
    }

    fn update_events(&mut self, add: Readiness, remove: Readiness) -> Result<()> {
        self.events.update(add, remove)
    }

    /// Local endpoints are fixed at creation; `_local` is ignored.
    fn connect(&mut self, _local: SocketAddrV4, remote: Option<SocketAddrV4>) -> Result<()> {
        match remote {
            Some(remote) => {
                self.socket.connect(&remote.into())?;
                self.connected = true;
                self.remote = Some(remote);
                debug!(fd = self.fd(), remote = %remote, "udp socket connected");
            }
            None => {
                if self.connected {
                    sys::disconnect(self.fd())?;
                }
                self.connected = false;
                self.remote = None;
                debug!(fd = self.fd(), "udp socket disconnected");
            }
        }
        Ok(())
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        debug!(fd = self.fd(), "udp socket closed");
    }
}
