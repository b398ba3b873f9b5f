//! # transit-echo
//!
//! Echo server over transit sockets: every datagram (UDP) or stream chunk
//! (TCP) received is written back to its sender.
//!
//! ## Usage
//!
//! ```bash
//! # UDP echo on an ephemeral port
//! transit-echo
//!
//! # From a config file
//! transit-echo --config echo.toml
//! ```
//!
//! ```toml
//! protocol = "tcp"
//! batch_size = 32
//!
//! [tcp]
//! listen_port = 7000
//!
//! [socket]
//! nodelay = true
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use transit_packet::PacketList;
use transit_socket::config::Protocol;
use transit_socket::{EchoConfig, Error, Reactor, Readiness, Socket};

type Clients = Rc<RefCell<HashMap<i32, Rc<RefCell<Socket>>>>>;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let config = load_config()?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let reactor = Reactor::new().context("creating reactor")?;

    // Sockets stay alive for the duration of the loop.
    let _server = match config.protocol {
        Protocol::Udp => start_udp(&reactor, &config)?,
        Protocol::Tcp => start_tcp(&reactor, &config)?,
    };

    while running.load(Ordering::Relaxed) {
        reactor.run_once(Some(Duration::from_millis(100)))?;
    }
    Ok(())
}

fn load_config() -> anyhow::Result<EchoConfig> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
                path = Some(val.clone());
            }
            "--help" | "-h" => {
                eprintln!("Usage: transit-echo [--config <file.toml>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
        i += 1;
    }

    let text = match &path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p))?,
        None => String::new(),
    };
    EchoConfig::from_toml_str(&text).map_err(|e| anyhow::anyhow!(e))
}

/// Echo datagrams back to their source, one batch per readiness event.
fn start_udp(reactor: &Reactor, config: &EchoConfig) -> anyhow::Result<Rc<RefCell<Socket>>> {
    let mut socket = Socket::udp(reactor, &config.udp).context("creating udp socket")?;
    socket.apply_config(&config.socket)?;
    tracing::info!(local = %socket.local_addr()?, "udp echo listening");

    let socket = Rc::new(RefCell::new(socket));
    let weak = Rc::downgrade(&socket);
    let batch = config.batch_size;
    socket
        .borrow_mut()
        .set_event_cb(Readiness::IN, move |ready| {
            if let Some(socket) = weak.upgrade() {
                echo_batch(&mut socket.borrow_mut(), batch, ready);
            }
        })?;
    Ok(socket)
}

/// Accept connections and echo each one's stream.
fn start_tcp(reactor: &Reactor, config: &EchoConfig) -> anyhow::Result<Rc<RefCell<Socket>>> {
    let mut listener = Socket::tcp(reactor).context("creating tcp socket")?;
    listener.apply_config(&config.socket)?;
    let ip = config.tcp_listen.ip().to_string();
    listener.listen(Some(&ip), config.tcp_listen.port())?;
    tracing::info!(local = %listener.local_addr()?, "tcp echo listening");

    let listener = Rc::new(RefCell::new(listener));
    let clients: Clients = Rc::new(RefCell::new(HashMap::new()));
    let weak = Rc::downgrade(&listener);
    let socket_config = config.socket.clone();
    let batch = config.batch_size;
    listener
        .borrow_mut()
        .set_event_cb(Readiness::IN, move |_| {
            let Some(listener) = weak.upgrade() else { return };
            loop {
                let accepted = listener.borrow_mut().accept();
                match accepted {
                    Ok((mut client, peer)) => {
                        if let Err(e) = client.apply_config(&socket_config) {
                            tracing::warn!(%peer, error = %e, "client config failed");
                        }
                        if let Err(e) = watch_client(&clients, client, batch) {
                            tracing::warn!(%peer, error = %e, "client registration failed");
                        }
                    }
                    Err(Error::WouldBlock) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        })?;
    Ok(listener)
}

fn watch_client(clients: &Clients, client: Socket, batch: usize) -> transit_socket::Result<()> {
    let fd = client.fd();
    let client = Rc::new(RefCell::new(client));
    let weak: Weak<RefCell<Socket>> = Rc::downgrade(&client);
    let registry = Rc::downgrade(clients);
    client
        .borrow_mut()
        .set_event_cb(Readiness::IN, move |ready| {
            let Some(client) = weak.upgrade() else { return };
            let open = echo_batch(&mut client.borrow_mut(), batch, ready);
            if !open {
                if let Some(clients) = registry.upgrade() {
                    clients.borrow_mut().remove(&fd);
                }
            }
        })?;
    clients.borrow_mut().insert(fd, client);
    Ok(())
}

/// Read one batch and write it back. Returns `false` once the peer is gone.
fn echo_batch(socket: &mut Socket, batch: usize, ready: Readiness) -> bool {
    if ready.intersects(Readiness::ERR | Readiness::HUP) && !ready.contains(Readiness::IN) {
        tracing::info!(fd = socket.fd(), ?ready, "peer gone");
        return false;
    }
    let mut list = PacketList::new();
    match socket.read_pkt_list(&mut list, batch) {
        Ok(_) => {}
        Err(Error::WouldBlock) => return true,
        Err(Error::Closed) | Err(Error::Reset) => {
            tracing::info!(fd = socket.fd(), "peer closed");
            return false;
        }
        Err(e) => {
            tracing::warn!(fd = socket.fd(), error = %e, "receive failed");
            return true;
        }
    }
    let received = list.len();
    match socket.write_pkt_list(&mut list) {
        Ok(sent) => tracing::debug!(received, sent, "echoed"),
        Err(e) => tracing::warn!(error = %e, dropped = list.len(), "echo failed"),
    }
    socket.recycle_pkt_list(&mut list);
    true
}
