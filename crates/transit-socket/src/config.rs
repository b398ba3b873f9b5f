//! # Configuration
//!
//! TOML-facing `*Input` structs with every field optional, and their
//! resolved counterparts. `resolve()` fills defaults, range-checks values
//! and rejects unknown versions before anything touches a socket.

use std::net::SocketAddrV4;

use serde::Deserialize;

use crate::addr::{local_endpoint, UdpEndpoint};
use crate::option::ClassSelector;
use crate::pool::RXPKT_MAX_SIZE_DEFAULT;

pub const CONFIG_VERSION: u32 = 1;

/// Largest receive packet: the maximum UDP payload.
pub const RXPKT_MAX_SIZE_LIMIT: usize = 65_507;

pub const BATCH_SIZE_DEFAULT: usize = 32;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SocketConfigInput {
    pub rx_buffer_size: Option<usize>,
    pub tx_buffer_size: Option<usize>,
    /// Class number 0..=7.
    pub class_selector: Option<u8>,
    pub nodelay: Option<bool>,
    pub reset_on_close: Option<bool>,
    pub rxpkt_max_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UdpEndpointInput {
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub multicast_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TcpEndpointInput {
    pub listen_addr: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EchoConfigInput {
    pub version: u32,
    pub protocol: Option<String>,
    pub udp: UdpEndpointInput,
    pub tcp: TcpEndpointInput,
    pub socket: SocketConfigInput,
    pub batch_size: Option<usize>,
}

/// Socket options applied with [`crate::Socket::apply_config`]. `None`
/// leaves the system default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    pub rx_buffer_size: Option<usize>,
    pub tx_buffer_size: Option<usize>,
    pub class_selector: Option<ClassSelector>,
    pub nodelay: Option<bool>,
    pub reset_on_close: Option<bool>,
    pub rxpkt_max_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: None,
            tx_buffer_size: None,
            class_selector: None,
            nodelay: None,
            reset_on_close: None,
            rxpkt_max_size: RXPKT_MAX_SIZE_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub version: u32,
    pub protocol: Protocol,
    pub udp: UdpEndpoint,
    pub tcp_listen: SocketAddrV4,
    pub socket: SocketConfig,
    pub batch_size: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            protocol: Protocol::Udp,
            udp: UdpEndpoint::any(),
            tcp_listen: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            socket: SocketConfig::default(),
            batch_size: BATCH_SIZE_DEFAULT,
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl SocketConfigInput {
    pub fn resolve(self) -> Result<SocketConfig, String> {
        let class_selector = match self.class_selector {
            Some(class) => Some(
                ClassSelector::from_priority(class)
                    .ok_or_else(|| format!("class_selector {} out of range 0..=7", class))?,
            ),
            None => None,
        };
        let rxpkt_max_size = self.rxpkt_max_size.unwrap_or(RXPKT_MAX_SIZE_DEFAULT);
        if rxpkt_max_size == 0 || rxpkt_max_size > RXPKT_MAX_SIZE_LIMIT {
            return Err(format!(
                "rxpkt_max_size {} out of range 1..={}",
                rxpkt_max_size, RXPKT_MAX_SIZE_LIMIT
            ));
        }
        Ok(SocketConfig {
            rx_buffer_size: self.rx_buffer_size.filter(|&s| s > 0),
            tx_buffer_size: self.tx_buffer_size.filter(|&s| s > 0),
            class_selector,
            nodelay: self.nodelay,
            reset_on_close: self.reset_on_close,
            rxpkt_max_size,
        })
    }
}

impl UdpEndpointInput {
    pub fn resolve(self) -> Result<UdpEndpoint, String> {
        UdpEndpoint::parse(
            non_empty(&self.local_addr),
            self.local_port,
            non_empty(&self.remote_addr),
            self.remote_port,
            non_empty(&self.multicast_addr),
        )
        .map_err(|e| format!("Invalid udp endpoint: {}", e))
    }
}

impl EchoConfigInput {
    pub fn resolve(self) -> Result<EchoConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let protocol = match self.protocol.as_deref().map(str::trim) {
            None | Some("") | Some("udp") => Protocol::Udp,
            Some("tcp") => Protocol::Tcp,
            Some(other) => return Err(format!("Unknown protocol {:?}", other)),
        };

        let tcp_listen = local_endpoint(non_empty(&self.tcp.listen_addr), self.tcp.listen_port)
            .map_err(|e| format!("Invalid tcp endpoint: {}", e))?;

        Ok(EchoConfig {
            version,
            protocol,
            udp: self.udp.resolve()?,
            tcp_listen,
            socket: self.socket.resolve()?,
            batch_size: self.batch_size.unwrap_or(BATCH_SIZE_DEFAULT).max(1),
        })
    }
}

impl EchoConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(EchoConfig::default());
        }
        let parsed: EchoConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}
