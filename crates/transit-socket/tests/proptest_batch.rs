//! # Property tests: batch send contract
//!
//! For a list of K packets and a socket that accepts only the first j
//! writes, `write_pkt_list` sends exactly min(j, K), releases exactly those
//! from the front, and leaves the rest linked in order.

use std::os::fd::RawFd;

use proptest::prelude::*;
use transit_packet::{Packet, PacketList};
use transit_socket::{Error, Reactor, Result, Socket, SocketBackend, SocketKind};

struct Budget(usize);

impl SocketBackend for Budget {
    fn kind(&self) -> SocketKind {
        SocketKind::Custom
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.0 == 0 {
            return Err(Error::WouldBlock);
        }
        self.0 -= 1;
        Ok(buf.len())
    }
}

proptest! {
    #[test]
    fn sends_prefix_and_keeps_suffix(k in 1usize..24, j in 0usize..32) {
        let reactor = Reactor::new().unwrap();
        let mut socket = Socket::from_backend(&reactor, Box::new(Budget(j)));

        let mut list = PacketList::new();
        let handles: Vec<Packet> = (0..k)
            .map(|i| {
                let pkt = Packet::with_data(&(i as u32).to_be_bytes());
                list.add_last(&pkt).unwrap();
                pkt
            })
            .collect();

        let result = socket.write_pkt_list(&mut list);
        let sent = j.min(k);
        if sent == 0 {
            prop_assert!(matches!(result, Err(Error::WouldBlock)));
        } else {
            prop_assert_eq!(result.unwrap(), sent);
        }

        prop_assert_eq!(list.len(), k - sent);
        for (i, pkt) in handles.iter().enumerate() {
            if i < sent {
                prop_assert!(!pkt.in_list());
                prop_assert_eq!(pkt.ref_count(), 1);
            } else {
                prop_assert!(list.contains(pkt));
                prop_assert_eq!(pkt.ref_count(), 2);
            }
        }
        let remaining: Vec<u32> = list
            .iter()
            .map(|p| u32::from_be_bytes(p.data().try_into().unwrap()))
            .collect();
        let expected: Vec<u32> = (sent as u32..k as u32).collect();
        prop_assert_eq!(remaining, expected);
    }
}
