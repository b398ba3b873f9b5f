//! # Receive Packet Pool
//!
//! Per-socket free list of receive packets. Allocation pops a recycled
//! packet or, when the free list is empty, allocates a fresh one of the
//! configured size, so an exhausted pool never fails a read.

use tracing::trace;
use transit_packet::{Packet, PacketList};

/// Default receive packet capacity: one Ethernet MTU.
pub const RXPKT_MAX_SIZE_DEFAULT: usize = 1500;

/// Upper bound on packets parked in the free list.
pub const POOL_MAX_FREE: usize = 256;

/// Free list of receive packets, all with capacity `max_size`.
pub struct RxPool {
    max_size: usize,
    free: PacketList,
    allocated: u64,
    reused: u64,
}

impl RxPool {
    pub fn new(max_size: usize) -> Self {
        RxPool {
            max_size,
            free: PacketList::new(),
            allocated: 0,
            reused: 0,
        }
    }

    /// Capacity of packets handed out.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the packet size. Parked packets of the old size are released.
    pub fn set_max_size(&mut self, max_size: usize) {
        if max_size != self.max_size {
            trace!(old = self.max_size, new = max_size, "rx pool resized");
            self.free.flush();
            self.max_size = max_size;
        }
    }

    /// A packet ready to receive into: exclusive, empty, `max_size` capacity.
    pub fn alloc(&mut self) -> Packet {
        match self.free.pop_first() {
            Some(pkt) => {
                self.reused += 1;
                pkt
            }
            None => {
                self.allocated += 1;
                Packet::new(self.max_size)
            }
        }
    }

    /// Return a packet for reuse. Packets that are still shared, linked
    /// elsewhere, read-only or of another size are released instead.
    /// Returns `true` if the packet was parked.
    pub fn recycle(&mut self, mut pkt: Packet) -> bool {
        if self.free.len() >= POOL_MAX_FREE
            || pkt.is_shared()
            || pkt.in_list()
            || pkt.capacity() != self.max_size
            || pkt.buf_mut().is_err()
            || pkt.reset().is_err()
        {
            return false;
        }
        self.free.add_last(&pkt).is_ok()
    }

    /// Number of parked packets.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// (fresh allocations, reuses) since creation.
    pub fn counters(&self) -> (u64, u64) {
        (self.allocated, self.reused)
    }
}

impl Default for RxPool {
    fn default() -> Self {
        Self::new(RXPKT_MAX_SIZE_DEFAULT)
    }
}

impl std::fmt::Debug for RxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxPool")
            .field("max_size", &self.max_size)
            .field("free", &self.free.len())
            .finish()
    }
}
