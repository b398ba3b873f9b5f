//! # Integration tests: sockets over the loopback interface
//!
//! Real UDP and TCP sockets driven by a reactor on the test thread.

use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::{Duration, Instant};

use transit_packet::{clock, Packet, PacketList};
use transit_socket::{ClassSelector, Error, Reactor, Readiness, Socket, SocketKind, UdpEndpoint};

const WAIT: Duration = Duration::from_secs(2);

// ─── Helpers ────────────────────────────────────────────────────────────────

fn loopback() -> UdpEndpoint {
    UdpEndpoint::any().with_local("127.0.0.1:0".parse().unwrap())
}

/// Turn the reactor until `socket` reports readable.
fn wait_readable(reactor: &Reactor, socket: &mut Socket) {
    let ready = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ready);
    socket
        .set_event_cb(Readiness::IN, move |r| {
            if r.intersects(Readiness::IN | Readiness::HUP) {
                flag.set(true);
            }
        })
        .unwrap();
    assert!(reactor.run_until(WAIT, || ready.get()).unwrap(), "socket never became readable");
    socket.clear_event_cb().unwrap();
}

/// A port with nothing listening on it.
fn closed_port(reactor: &Reactor) -> u16 {
    let mut listener = Socket::tcp(reactor).unwrap();
    listener.listen(Some("127.0.0.1"), 0).unwrap();
    listener.local_port().unwrap()
}

/// Connect `client` to a fresh listener; returns the accepted end once the
/// handshake has completed on both sides.
fn tcp_connect(reactor: &Reactor, client: &mut Socket) -> Socket {
    let mut listener = Socket::tcp(reactor).unwrap();
    listener.listen(Some("127.0.0.1"), 0).unwrap();
    let port = listener.local_port().unwrap();
    client.connect(None, 0, Some("127.0.0.1"), port).unwrap();

    wait_readable(reactor, &mut listener);
    let (server, _) = listener.accept().unwrap();

    let connected = Rc::new(Cell::new(false));
    let flag = Rc::clone(&connected);
    client
        .set_event_cb(Readiness::OUT, move |r| {
            if r.contains(Readiness::OUT) {
                flag.set(true);
            }
        })
        .unwrap();
    assert!(reactor.run_until(WAIT, || connected.get()).unwrap());
    client.clear_event_cb().unwrap();
    assert_eq!(client.take_error().unwrap(), 0);
    server
}

fn udp_pair(reactor: &Reactor) -> (Socket, Socket) {
    let mut a = Socket::udp(reactor, &loopback()).unwrap();
    let mut b = Socket::udp(reactor, &loopback()).unwrap();
    let a_port = a.local_port().unwrap();
    let b_port = b.local_port().unwrap();
    a.connect(None, 0, Some("127.0.0.1"), b_port).unwrap();
    b.connect(None, 0, Some("127.0.0.1"), a_port).unwrap();
    (a, b)
}

// ─── UDP ────────────────────────────────────────────────────────────────────

#[test]
fn udp_ephemeral_port_is_allocated() {
    let reactor = Reactor::new().unwrap();
    let socket = Socket::udp(&reactor, &UdpEndpoint::any()).unwrap();
    let port = socket.local_port().unwrap();
    assert_ne!(port, 0);
    assert!(port >= 1024, "port {} outside the ephemeral range", port);
    assert_eq!(socket.kind(), SocketKind::Udp);
    assert_eq!(socket.remote_addr(), None);
}

#[test]
fn udp_round_trip_preserves_bytes_and_orders_timestamps() {
    let reactor = Reactor::new().unwrap();
    let (mut a, mut b) = udp_pair(&reactor);

    let payload = b"transit round trip";
    assert_eq!(a.write(payload).unwrap(), payload.len());
    let write_returned = clock::now_us();

    wait_readable(&reactor, &mut b);
    let mut buf = [0u8; 128];
    let recv = b.read(&mut buf).unwrap();
    assert_eq!(&buf[..recv.len], payload);
    assert!(recv.ts_us >= write_returned);
}

#[test]
fn udp_packet_carries_source_address() {
    let reactor = Reactor::new().unwrap();
    let mut sender = Socket::udp(&reactor, &loopback()).unwrap();
    let mut receiver = Socket::udp(&reactor, &loopback()).unwrap();
    let dest: SocketAddrV4 = receiver.local_addr().unwrap();

    let mut pkt = Packet::with_data(b"addressed");
    pkt.set_addr(dest.into()).unwrap();
    sender.write_pkt(&pkt).unwrap();
    assert_eq!(pkt.data(), b"addressed");

    wait_readable(&reactor, &mut receiver);
    let got = receiver.read_pkt_alloc().unwrap();
    assert_eq!(got.data(), b"addressed");
    assert_eq!(got.addr(), SocketAddr::V4(sender.local_addr().unwrap()));
    assert_eq!(got.capacity(), receiver.rxpkt_max_size());
    assert!(got.timestamp_us() > 0);
}

#[test]
fn udp_set_remote_sets_default_destination() {
    let reactor = Reactor::new().unwrap();
    let mut sender = Socket::udp(&reactor, &loopback()).unwrap();
    let mut receiver = Socket::udp(&reactor, &loopback()).unwrap();
    let port = receiver.local_port().unwrap();

    assert!(matches!(sender.write(b"x"), Err(Error::InvalidArgument(_))));
    sender.set_remote(Some("127.0.0.1"), port).unwrap();
    assert_eq!(sender.remote_port(), port);
    sender.write_cs(b"marked", Some(ClassSelector::CS5)).unwrap();

    wait_readable(&reactor, &mut receiver);
    let mut buf = [0u8; 16];
    let recv = receiver.read(&mut buf).unwrap();
    assert_eq!(&buf[..recv.len], b"marked");
}

#[test]
fn udp_batch_receive_keeps_order() {
    let reactor = Reactor::new().unwrap();
    let (mut a, mut b) = udp_pair(&reactor);

    for i in 0..5u8 {
        a.write(&[i; 8]).unwrap();
    }
    wait_readable(&reactor, &mut b);

    let mut list = PacketList::new();
    let n = b.read_pkt_list(&mut list, 16).unwrap();
    assert_eq!(n, 5);
    assert_eq!(list.len(), 5);
    for (i, pkt) in list.iter().enumerate() {
        assert_eq!(pkt.data(), &[i as u8; 8]);
        assert_eq!(pkt.ref_count(), 1);
        assert!(pkt.in_list());
    }
    assert!(matches!(b.read_pkt_list(&mut list, 16), Err(Error::WouldBlock)));
    b.recycle_pkt_list(&mut list);
    assert!(list.is_empty());
}

#[test]
fn udp_batch_receive_spans_several_system_calls() {
    let reactor = Reactor::new().unwrap();
    let (mut a, mut b) = udp_pair(&reactor);
    b.set_rx_buffer_size(1 << 20).unwrap();

    for i in 0..100u32 {
        a.write(&i.to_be_bytes()).unwrap();
    }
    wait_readable(&reactor, &mut b);

    let mut list = PacketList::new();
    assert_eq!(b.read_pkt_list(&mut list, 100).unwrap(), 100);
    assert_eq!(list.len(), 100);
    for (i, pkt) in list.iter().enumerate() {
        assert_eq!(pkt.data(), &(i as u32).to_be_bytes());
    }
    assert!(matches!(b.read_pkt_list(&mut list, 100), Err(Error::WouldBlock)));
    b.recycle_pkt_list(&mut list);
}

#[test]
fn udp_batch_send_and_vectored_io() {
    let reactor = Reactor::new().unwrap();
    let (mut a, mut b) = udp_pair(&reactor);

    let mut list = PacketList::new();
    for word in ["one", "two", "three"] {
        list.add_last(&Packet::with_data(word.as_bytes())).unwrap();
    }
    assert_eq!(a.write_pkt_list(&mut list).unwrap(), 3);
    assert!(list.is_empty());

    wait_readable(&reactor, &mut b);
    let mut head = [0u8; 2];
    let mut tail = [0u8; 8];
    let recv = b
        .readv(&mut [
            std::io::IoSliceMut::new(&mut head),
            std::io::IoSliceMut::new(&mut tail),
        ])
        .unwrap();
    assert_eq!(recv.len, 3);
    assert_eq!(&head, b"on");
    assert_eq!(tail[0], b'e');
}

#[test]
fn udp_rx_packet_size_bounds_reads() {
    let reactor = Reactor::new().unwrap();
    let (mut a, mut b) = udp_pair(&reactor);
    b.set_rxpkt_max_size(4).unwrap();

    a.write(b"truncated").unwrap();
    wait_readable(&reactor, &mut b);
    let pkt = b.read_pkt_alloc().unwrap();
    assert_eq!(pkt.capacity(), 4);
    assert_eq!(pkt.data(), b"trun");
}

#[test]
fn read_into_shared_packet_is_denied() {
    let reactor = Reactor::new().unwrap();
    let (_a, mut b) = udp_pair(&reactor);
    let mut pkt = Packet::new(64);
    let _other = pkt.clone();
    assert!(matches!(b.read_pkt(&mut pkt), Err(Error::PermissionDenied)));
}

// ─── TCP ────────────────────────────────────────────────────────────────────

#[test]
fn tcp_listen_connect_accept_and_close() {
    let reactor = Reactor::new().unwrap();

    let mut listener = Socket::tcp(&reactor).unwrap();
    listener.listen(Some("127.0.0.1"), 0).unwrap();
    let port = listener.local_port().unwrap();
    let listener = Rc::new(RefCell::new(listener));

    let accepted: Rc<RefCell<Option<(Socket, SocketAddrV4)>>> = Rc::new(RefCell::new(None));
    {
        let weak = Rc::downgrade(&listener);
        let slot = Rc::clone(&accepted);
        listener
            .borrow_mut()
            .set_event_cb(Readiness::IN, move |_| {
                if let Some(listener) = weak.upgrade() {
                    if let Ok(pair) = listener.borrow_mut().accept() {
                        *slot.borrow_mut() = Some(pair);
                    }
                }
            })
            .unwrap();
    }

    let mut client = Socket::tcp(&reactor).unwrap();
    client.connect(None, 0, Some("127.0.0.1"), port).unwrap();
    let connected = Rc::new(Cell::new(false));
    let flag = Rc::clone(&connected);
    client
        .set_event_cb(Readiness::OUT, move |r| {
            if r.contains(Readiness::OUT) {
                flag.set(true);
            }
        })
        .unwrap();

    let done = reactor
        .run_until(WAIT, || connected.get() && accepted.borrow().is_some())
        .unwrap();
    assert!(done);
    client.clear_event_cb().unwrap();
    assert_eq!(client.take_error().unwrap(), 0);

    let (mut server, peer) = accepted.borrow_mut().take().unwrap();
    assert_eq!(peer.port(), client.local_port().unwrap());
    assert_eq!(server.remote_port(), peer.port());
    assert_eq!(server.kind(), SocketKind::Tcp);

    assert_eq!(client.write(b"ping").unwrap(), 4);
    wait_readable(&reactor, &mut server);
    let mut buf = [0u8; 16];
    let recv = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..recv.len], b"ping");

    drop(client);
    wait_readable(&reactor, &mut server);
    assert!(matches!(server.read(&mut buf), Err(Error::Closed)));
}

#[test]
fn tcp_refused_connect_reports_pending_error() {
    let reactor = Reactor::new().unwrap();
    let port = closed_port(&reactor);

    let mut client = Socket::tcp(&reactor).unwrap();
    match client.connect(None, 0, Some("127.0.0.1"), port) {
        Ok(()) => {
            let fired = Rc::new(Cell::new(false));
            let flag = Rc::clone(&fired);
            client
                .set_event_cb(Readiness::OUT, move |_| flag.set(true))
                .unwrap();
            assert!(reactor.run_until(WAIT, || fired.get()).unwrap());
            assert_eq!(client.take_error().unwrap(), libc::ECONNREFUSED);
        }
        Err(e) => assert_eq!(e.errno(), -libc::ECONNREFUSED),
    }
}

#[test]
fn tcp_connect_twice_is_rejected() {
    let reactor = Reactor::new().unwrap();
    let mut listener = Socket::tcp(&reactor).unwrap();
    listener.listen(Some("127.0.0.1"), 0).unwrap();
    let port = listener.local_port().unwrap();

    let mut client = Socket::tcp(&reactor).unwrap();
    client.connect(None, 0, Some("127.0.0.1"), port).unwrap();
    assert!(matches!(
        client.connect(None, 0, Some("127.0.0.1"), port),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(client.listen(None, 0), Err(Error::InvalidArgument(_))));
}

#[test]
fn tcp_error_only_registration_reports_refusal() {
    let reactor = Reactor::new().unwrap();
    let port = closed_port(&reactor);

    let mut client = Socket::tcp(&reactor).unwrap();
    if let Err(e) = client.connect(None, 0, Some("127.0.0.1"), port) {
        // Refused synchronously; there is nothing left to watch.
        assert_eq!(e.errno(), -libc::ECONNREFUSED);
        return;
    }
    let seen = Rc::new(Cell::new(Readiness::EMPTY));
    let s = Rc::clone(&seen);
    client
        .set_event_cb(Readiness::ERR, move |r| s.set(s.get() | r))
        .unwrap();
    assert!(
        reactor.run_until(WAIT, || !seen.get().is_empty()).unwrap(),
        "error readiness never reported"
    );
    assert!(seen.get().contains(Readiness::ERR));
    assert!(!seen.get().intersects(Readiness::IN | Readiness::OUT));
    assert_eq!(client.take_error().unwrap(), libc::ECONNREFUSED);
}

#[test]
fn tcp_short_write_resumes_without_loss_or_repeat() {
    let reactor = Reactor::new().unwrap();
    let mut client = Socket::tcp(&reactor).unwrap();
    client.set_tx_buffer_size(4096).unwrap();
    let mut server = tcp_connect(&reactor, &mut client);
    server.set_rx_buffer_size(4096).unwrap();

    let data: Vec<u8> = (0..4usize << 20).map(|i| (i % 251) as u8).collect();
    let mut list = PacketList::new();
    list.add_last(&Packet::with_data(&data)).unwrap();

    // The peer is not reading yet, so only a head of the packet fits.
    assert!(matches!(client.write_pkt_list(&mut list), Err(Error::WouldBlock)));
    assert_eq!(list.len(), 1);

    // A different packet may not cut into the partial one.
    assert!(matches!(
        client.write_pkt(&Packet::with_data(b"interloper")),
        Err(Error::InvalidArgument(_))
    ));

    let mut received = Vec::with_capacity(data.len());
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = Instant::now() + Duration::from_secs(20);
    while received.len() < data.len() {
        assert!(Instant::now() < deadline, "stalled at {} bytes", received.len());
        match server.read(&mut buf) {
            Ok(recv) => received.extend_from_slice(&buf[..recv.len]),
            Err(Error::WouldBlock) => {}
            Err(e) => panic!("server read failed: {}", e),
        }
        if !list.is_empty() {
            match client.write_pkt_list(&mut list) {
                Ok(n) => assert_eq!(n, 1),
                Err(Error::WouldBlock) => {}
                Err(e) => panic!("client write failed: {}", e),
            }
        }
    }
    assert!(list.is_empty());
    assert_eq!(received.len(), data.len());
    assert!(received == data, "stream bytes were lost or repeated");
    assert!(matches!(server.read(&mut buf), Err(Error::WouldBlock)));

    // The backend is free for the next packet.
    client.write_pkt(&Packet::with_data(b"next")).unwrap();
    wait_readable(&reactor, &mut server);
    let recv = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..recv.len], b"next");
}
