//! # Socket Backend Interface
//!
//! [`SocketBackend`] is the operation table behind [`crate::Socket`]. Each
//! transport implements the operations it supports; every other operation
//! keeps its default body, which reports [`Error::NotSupported`]. The
//! packet-oriented operations have generic defaults built on the byte-level
//! ones, so a backend only overrides them for a faster path.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{trace, warn};
use transit_packet::{Packet, PacketList};

use crate::error::{Error, Result};
use crate::option::{ClassSelector, SocketOption};
use crate::pool::RxPool;
use crate::reactor::{EventCallback, Reactor, Readiness, Registration};

/// Transport behind a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Udp,
    Tcp,
    /// A backend supplied through [`crate::Socket::from_backend`].
    Custom,
}

/// Result of a byte-level read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recv {
    pub len: usize,
    /// Monotonic receive time in µs.
    pub ts_us: u64,
}

/// One message slot of a batched receive.
#[derive(Debug)]
pub struct RecvMsg<'a, 'b> {
    pub iov: &'a mut [IoSliceMut<'b>],
    /// Bytes received, set on return.
    pub len: usize,
    /// Sender, set on return.
    pub addr: Option<SocketAddrV4>,
    /// Receive time in µs, set on return.
    pub ts_us: u64,
}

impl<'a, 'b> RecvMsg<'a, 'b> {
    pub fn new(iov: &'a mut [IoSliceMut<'b>]) -> Self {
        RecvMsg {
            iov,
            len: 0,
            addr: None,
            ts_us: 0,
        }
    }
}

/// One message of a batched send.
#[derive(Debug)]
pub struct SendMsg<'a, 'b> {
    pub iov: &'a [IoSlice<'b>],
    /// Bytes sent, set on return.
    pub len: usize,
}

impl<'a, 'b> SendMsg<'a, 'b> {
    pub fn new(iov: &'a [IoSlice<'b>]) -> Self {
        SendMsg { iov, len: 0 }
    }
}

/// Operations of one socket transport.
///
/// Unimplemented operations report [`Error::NotSupported`].
pub trait SocketBackend {
    fn kind(&self) -> SocketKind;

    /// Underlying descriptor, or -1 if there is none.
    fn fd(&self) -> RawFd;

    fn local_addr(&self) -> Result<SocketAddrV4> {
        Err(Error::NotSupported)
    }

    fn remote_addr(&self) -> Option<SocketAddrV4> {
        None
    }

    /// Record the default destination without connecting.
    fn set_remote(&mut self, _remote: Option<SocketAddrV4>) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn option(&self, _opt: SocketOption) -> Result<i32> {
        Err(Error::NotSupported)
    }

    fn set_option(&mut self, _opt: SocketOption, _value: i32) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<Recv> {
        Err(Error::NotSupported)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn readv(&mut self, _iov: &mut [IoSliceMut<'_>]) -> Result<Recv> {
        Err(Error::NotSupported)
    }

    fn writev(&mut self, _iov: &[IoSlice<'_>]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Write with a class selector override (`None` keeps the socket's).
    fn write_cs(&mut self, _buf: &[u8], _cs: Option<ClassSelector>) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn writev_cs(&mut self, _iov: &[IoSlice<'_>], _cs: Option<ClassSelector>) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Receive several messages; returns how many slots were filled.
    fn read_mmsg(&mut self, _msgs: &mut [RecvMsg<'_, '_>]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Send several messages; returns how many were sent.
    fn write_mmsg(&mut self, _msgs: &mut [SendMsg<'_, '_>]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Receive into `pkt`, which must be exclusively owned.
    fn read_pkt(&mut self, pkt: &mut Packet) -> Result<()> {
        let recv = self.read(pkt.buf_mut()?)?;
        pkt.set_len(recv.len)?;
        pkt.set_timestamp_us(recv.ts_us)?;
        Ok(())
    }

    /// Send the packet's data. A short write is an error; stream backends
    /// override this to resume where a short write stopped.
    fn write_pkt(&mut self, pkt: &Packet) -> Result<()> {
        let n = self.write(pkt.data())?;
        if n != pkt.len() {
            return Err(Error::Io(io::Error::from(io::ErrorKind::WriteZero)));
        }
        Ok(())
    }

    /// Receive into a packet from `pool`.
    fn read_pkt_alloc(&mut self, pool: &mut RxPool) -> Result<Packet> {
        let mut pkt = pool.alloc();
        match self.read_pkt(&mut pkt) {
            Ok(()) => Ok(pkt),
            Err(e) => {
                pool.recycle(pkt);
                Err(e)
            }
        }
    }

    /// Receive up to `max` packets, appending them to `list`. Stops early
    /// when no more data is ready. An error is returned only if nothing was
    /// received.
    fn read_pkt_list(
        &mut self,
        pool: &mut RxPool,
        list: &mut PacketList,
        max: usize,
    ) -> Result<usize> {
        let mut count = 0;
        while count < max {
            match self.read_pkt_alloc(pool) {
                Ok(pkt) => {
                    list.add_last(&pkt)?;
                    count += 1;
                }
                Err(e) if count == 0 => return Err(e),
                Err(Error::WouldBlock) => break,
                Err(e) => {
                    warn!(error = %e, received = count, "receive batch cut short");
                    break;
                }
            }
        }
        Ok(count)
    }

    /// Send packets from the front of `list`, releasing each one sent.
    /// Stops at the first failure, leaving the rest in place; the failure is
    /// returned only if nothing was sent.
    fn write_pkt_list(&mut self, list: &mut PacketList) -> Result<usize> {
        let mut count = 0;
        while let Some(pkt) = list.first() {
            match self.write_pkt(pkt) {
                Ok(()) => {
                    list.pop_first();
                    count += 1;
                }
                Err(e) if count == 0 => return Err(e),
                Err(e) => {
                    trace!(error = %e, sent = count, remaining = list.len(), "send batch stopped");
                    break;
                }
            }
        }
        Ok(count)
    }

    /// Install (or with `None`, remove) the readiness callback.
    fn set_event_cb(&mut self, _events: Readiness, _cb: Option<EventCallback>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Add and remove bits of the monitored readiness set.
    fn update_events(&mut self, _add: Readiness, _remove: Readiness) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Datagram: set or clear (`None`) the peer. Stream: start the
    /// handshake, after binding to `local` if it is not the any endpoint.
    fn connect(&mut self, _local: SocketAddrV4, _remote: Option<SocketAddrV4>) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn listen(&mut self, _local: SocketAddrV4) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Take one pending connection.
    fn accept(&mut self) -> Result<(Box<dyn SocketBackend>, SocketAddrV4)> {
        Err(Error::NotSupported)
    }
}

// ─── Shared pieces for fd-based backends ─────────────────────────────────────

/// Reactor registration owned by a backend.
pub(crate) struct EventSlot {
    reactor: Reactor,
    registration: Option<Registration>,
}

impl EventSlot {
    pub(crate) fn new(reactor: Reactor) -> Self {
        EventSlot {
            reactor,
            registration: None,
        }
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Replace the registration; `None` removes it.
    pub(crate) fn set(
        &mut self,
        fd: RawFd,
        events: Readiness,
        cb: Option<EventCallback>,
    ) -> Result<()> {
        self.registration = None;
        if let Some(cb) = cb {
            self.registration = Some(self.reactor.register(fd, events, cb)?);
        }
        Ok(())
    }

    pub(crate) fn update(&mut self, add: Readiness, remove: Readiness) -> Result<()> {
        match &self.registration {
            Some(reg) => Ok(reg.update_events(add, remove)?),
            None => Err(Error::InvalidArgument("no event callback registered")),
        }
    }
}

fn non_negative(value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidArgument("negative option value"))
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Get an option common to all `socket2`-backed sockets.
pub(crate) fn common_option(socket: &socket2::Socket, opt: SocketOption) -> Result<i32> {
    match opt {
        SocketOption::RxBufSize => Ok(to_i32(socket.recv_buffer_size()?)),
        SocketOption::TxBufSize => Ok(to_i32(socket.send_buffer_size()?)),
        SocketOption::ClassSelector => Ok(socket.tos()? as i32),
        SocketOption::Error => Ok(socket
            .take_error()?
            .and_then(|e| e.raw_os_error())
            .unwrap_or(0)),
        SocketOption::NoDelay | SocketOption::Reset => Err(Error::NotSupported),
    }
}

/// Set an option common to all `socket2`-backed sockets.
pub(crate) fn set_common_option(
    socket: &socket2::Socket,
    opt: SocketOption,
    value: i32,
) -> Result<()> {
    match opt {
        SocketOption::RxBufSize => socket.set_recv_buffer_size(non_negative(value)?)?,
        SocketOption::TxBufSize => socket.set_send_buffer_size(non_negative(value)?)?,
        SocketOption::ClassSelector => {
            let tos = u8::try_from(value)
                .map_err(|_| Error::InvalidArgument("class selector out of range"))?;
            socket.set_tos(u32::from(tos))?
        }
        SocketOption::Error => return Err(Error::InvalidArgument("read-only option")),
        SocketOption::NoDelay | SocketOption::Reset => return Err(Error::NotSupported),
    }
    Ok(())
}

/// SO_LINGER with a zero timeout: close sends a reset.
pub(crate) fn abort_on_close(socket: &socket2::Socket) -> io::Result<()> {
    socket.set_linger(Some(Duration::ZERO))
}
