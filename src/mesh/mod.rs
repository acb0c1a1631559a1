//! AODVv2 reactive mesh routing.
//!
//! A single [`node::Node`] task owns all mutable protocol state: the own
//! sequence number, the client table, the route-request log and the routing
//! table. Inbound datagrams and forwarding-plane signals are serialized
//! through its inbox channel; outbound messages leave through a
//! [`node::LinkLayer`].

pub mod node;
pub mod proto;
pub mod routes;
pub mod seqnum;
pub mod tables;

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// UDP port for MANET control traffic (RFC 5498).
pub const MANET_PORT: u16 = 269;

/// Hop-count ceiling (AODVv2 draft, section 14.2).
pub const MAX_HOPCOUNT: u8 = 250;

pub const MAX_ROUTING_ENTRIES: usize = 255;
pub const MAX_CLIENTS: usize = 1;
pub const RREQ_BUF: usize = 128;
pub const MAX_UNREACHABLE_NODES: usize = 15;

/// A route is Active while it is used at least once per this interval.
pub const ACTIVE_INTERVAL_MS: u64 = 5_000;
/// An Idle route older than this is no longer trusted.
pub const MAX_IDLETIME_MS: u64 = 250_000;
/// After this, old sequence number information is worthless and the entry is
/// expunged.
pub const MAX_SEQNUM_LIFETIME_MS: u64 = 300_000;
/// Lifetime granted to a fresh or refreshed route.
pub const VALIDITY_MS: u64 = ACTIVE_INTERVAL_MS + MAX_IDLETIME_MS;

/// An L3 address with its prefix length. Constant-sized and comparable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    bytes: [u8; 16],
    prefix_len: u8,
}

impl Addr {
    pub fn new(ip: Ipv6Addr, prefix_len: u8) -> Self {
        Self { bytes: ip.octets(), prefix_len }
    }

    pub fn from_bytes(bytes: [u8; 16], prefix_len: u8) -> Self {
        Self { bytes, prefix_len }
    }

    pub fn ip(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.bytes)
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip(), self.prefix_len)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Route cost semantics. Only hop count is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetricType {
    HopCount = 3,
}

impl MetricType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            3 => Some(MetricType::HopCount),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Cost of one link under this metric.
    pub fn link_cost(self) -> u8 {
        match self {
            MetricType::HopCount => 1,
        }
    }

    /// Largest representable metric value.
    pub fn max_metric(self) -> u8 {
        match self {
            MetricType::HopCount => MAX_HOPCOUNT,
        }
    }

    /// A metric's new value after traversing one link.
    pub fn update(self, metric: u8) -> u8 {
        match self {
            MetricType::HopCount => metric + 1,
        }
    }
}

fn default_prefix_len() -> u8 {
    64
}

fn default_port() -> u16 {
    MANET_PORT
}

fn default_multicast() -> Ipv6Addr {
    // link-local all nodes
    Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 1)
}

/// Router configuration, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// The router's own address; also its only client.
    pub local_addr: Ipv6Addr,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where RREQs and RERRs are flooded to.
    #[serde(default = "default_multicast")]
    pub multicast_addr: Ipv6Addr,
}

impl MeshConfig {
    pub fn new(local_addr: Ipv6Addr) -> Self {
        Self {
            local_addr,
            prefix_len: default_prefix_len(),
            port: default_port(),
            multicast_addr: default_multicast(),
        }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("invalid mesh config: {e}"))
    }

    pub fn local(&self) -> Addr {
        Addr::new(self.local_addr, self.prefix_len)
    }

    pub fn multicast(&self) -> Addr {
        Addr::new(self.multicast_addr, self.prefix_len)
    }
}
