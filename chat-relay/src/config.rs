use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

pub const DEFAULT_PORT: u16 = 64882;

pub const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT);

/// Settings for one relay instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the listener binds to. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Numeric range identifiers are drawn from.
    pub identifiers: RangeInclusive<u32>,
    /// Lines a client may have queued before broadcasts evict it.
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            identifiers: 1..=9999,
            outbound_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn with_listen(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }
}
