//! # Integration tests: packet-list batch I/O over scripted backends
//!
//! Backends supplied through `Socket::from_backend` exercise the generic
//! packet operations without a network.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;

use transit_packet::{Packet, PacketList};
use transit_socket::{Error, Reactor, Recv, Result, Socket, SocketBackend, SocketKind};

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Accepts `budget` writes, then fails every write with `WouldBlock`.
struct FlakyWriter {
    budget: usize,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl SocketBackend for FlakyWriter {
    fn kind(&self) -> SocketKind {
        SocketKind::Custom
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.budget == 0 {
            return Err(Error::WouldBlock);
        }
        self.budget -= 1;
        self.sent.borrow_mut().push(buf.to_vec());
        Ok(buf.len())
    }
}

/// Replays queued datagrams, then reports `WouldBlock`.
struct ScriptedReader {
    queue: VecDeque<Vec<u8>>,
    clock: u64,
}

impl SocketBackend for ScriptedReader {
    fn kind(&self) -> SocketKind {
        SocketKind::Custom
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Recv> {
        let datagram = self.queue.pop_front().ok_or(Error::WouldBlock)?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        self.clock += 10;
        Ok(Recv {
            len,
            ts_us: self.clock,
        })
    }
}

fn flaky_socket(reactor: &Reactor, budget: usize) -> (Socket, Rc<RefCell<Vec<Vec<u8>>>>) {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let backend = FlakyWriter {
        budget,
        sent: Rc::clone(&sent),
    };
    (Socket::from_backend(reactor, Box::new(backend)), sent)
}

fn numbered_list(k: u8) -> (PacketList, Vec<Packet>) {
    let mut list = PacketList::new();
    let mut handles = Vec::new();
    for i in 0..k {
        let pkt = Packet::with_data(&[i; 4]);
        list.add_last(&pkt).unwrap();
        handles.push(pkt);
    }
    (list, handles)
}

// ─── write_pkt_list ─────────────────────────────────────────────────────────

#[test]
fn partial_send_releases_only_sent_packets() {
    let reactor = Reactor::new().unwrap();
    let (mut socket, sent) = flaky_socket(&reactor, 2);
    let (mut list, handles) = numbered_list(5);

    assert_eq!(socket.write_pkt_list(&mut list).unwrap(), 2);

    assert_eq!(sent.borrow().as_slice(), &[vec![0u8; 4], vec![1u8; 4]]);
    assert_eq!(list.len(), 3);
    for (i, pkt) in handles.iter().enumerate() {
        if i < 2 {
            assert!(!pkt.in_list());
            assert_eq!(pkt.ref_count(), 1);
        } else {
            assert!(list.contains(pkt));
            assert_eq!(pkt.ref_count(), 2);
            assert_eq!(pkt.data(), &[i as u8; 4]);
        }
    }
    assert!(list.first().unwrap().ptr_eq(&handles[2]));
}

#[test]
fn send_failing_first_packet_reports_error() {
    let reactor = Reactor::new().unwrap();
    let (mut socket, sent) = flaky_socket(&reactor, 0);
    let (mut list, _handles) = numbered_list(3);

    assert!(matches!(socket.write_pkt_list(&mut list), Err(Error::WouldBlock)));
    assert_eq!(list.len(), 3);
    assert!(sent.borrow().is_empty());
}

#[test]
fn full_send_empties_list() {
    let reactor = Reactor::new().unwrap();
    let (mut socket, sent) = flaky_socket(&reactor, 10);
    let (mut list, handles) = numbered_list(4);

    assert_eq!(socket.write_pkt_list(&mut list).unwrap(), 4);
    assert!(list.is_empty());
    assert_eq!(sent.borrow().len(), 4);
    assert!(handles.iter().all(|p| p.ref_count() == 1 && !p.in_list()));
}

// ─── read_pkt_list ──────────────────────────────────────────────────────────

fn scripted_socket(reactor: &Reactor, datagrams: &[&[u8]]) -> Socket {
    let backend = ScriptedReader {
        queue: datagrams.iter().map(|d| d.to_vec()).collect(),
        clock: 0,
    };
    Socket::from_backend(reactor, Box::new(backend))
}

#[test]
fn batch_receive_stops_when_drained() {
    let reactor = Reactor::new().unwrap();
    let mut socket = scripted_socket(&reactor, &[b"a", b"bb", b"ccc"]);
    let mut list = PacketList::new();

    assert_eq!(socket.read_pkt_list(&mut list, 10).unwrap(), 3);
    let lens: Vec<usize> = list.iter().map(Packet::len).collect();
    assert_eq!(lens, vec![1, 2, 3]);
    let stamps: Vec<u64> = list.iter().map(Packet::timestamp_us).collect();
    assert_eq!(stamps, vec![10, 20, 30]);
    assert!(matches!(socket.read_pkt_list(&mut list, 10), Err(Error::WouldBlock)));
}

#[test]
fn batch_receive_respects_max() {
    let reactor = Reactor::new().unwrap();
    let mut socket = scripted_socket(&reactor, &[b"1", b"2", b"3", b"4"]);
    let mut list = PacketList::new();

    assert_eq!(socket.read_pkt_list(&mut list, 2).unwrap(), 2);
    assert_eq!(socket.read_pkt_list(&mut list, 0).unwrap(), 0);
    assert_eq!(socket.read_pkt_list(&mut list, 5).unwrap(), 2);
    let data: Vec<&[u8]> = list.iter().map(Packet::data).collect();
    assert_eq!(data, vec![b"1" as &[u8], b"2", b"3", b"4"]);
}

#[test]
fn batch_receive_appends_after_existing_packets() {
    let reactor = Reactor::new().unwrap();
    let mut socket = scripted_socket(&reactor, &[b"new"]);
    let mut list = PacketList::new();
    let existing = Packet::with_data(b"old");
    list.add_last(&existing).unwrap();

    assert_eq!(socket.read_pkt_list(&mut list, 4).unwrap(), 1);
    assert!(list.first().unwrap().ptr_eq(&existing));
    assert_eq!(list.last().unwrap().data(), b"new");
}

#[test]
fn recycled_packets_come_back_clean() {
    let reactor = Reactor::new().unwrap();
    let mut socket = scripted_socket(&reactor, &[b"first", b"second"]);

    let pkt = socket.read_pkt_alloc().unwrap();
    assert_eq!(pkt.data(), b"first");
    socket.recycle_pkt(pkt);

    let pkt = socket.read_pkt_alloc().unwrap();
    assert_eq!(pkt.data(), b"second");
    assert_eq!(pkt.capacity(), socket.rxpkt_max_size());
}
