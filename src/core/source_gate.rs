//! Source admission: which peers may use the relay at all.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::cidr::IpCidr;
use super::hooks::SourceAllowList;
use crate::logger::log;

/// Ordered set of allowed network prefixes
#[derive(Debug, Clone, Default)]
pub struct AllowedSourceSet {
    ranges: Vec<IpCidr>,
}

impl AllowedSourceSet {
    pub fn new(ranges: Vec<IpCidr>) -> Self {
        Self { ranges }
    }

    /// Parse CIDR strings, skipping (and logging) the ones that do not parse
    pub fn from_cidrs<I, S>(cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ranges = cidrs
            .into_iter()
            .filter_map(|s| match s.as_ref().parse::<IpCidr>() {
                Ok(cidr) => Some(cidr),
                Err(e) => {
                    log::warn!(error = %e, "Skipping allowed source range");
                    None
                }
            })
            .collect();
        Self::new(ranges)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl SourceAllowList for AllowedSourceSet {
    fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }
}

/// Decides whether an inbound peer is permitted
#[derive(Clone)]
pub struct SourceGate {
    allow: Arc<dyn SourceAllowList>,
}

impl SourceGate {
    pub fn new(allow: Arc<dyn SourceAllowList>) -> Self {
        Self { allow }
    }

    /// Whether a textual address (no port) is allowed.
    ///
    /// Anything that does not parse as an IPv4 or IPv6 address is refused.
    pub fn is_source_allowed(&self, address: &str) -> bool {
        match address.parse::<IpAddr>() {
            Ok(ip) => self.allow.contains(ip),
            Err(_) => false,
        }
    }

    /// Whether the peer of an accepted connection is allowed
    pub fn is_peer_allowed(&self, peer: SocketAddr) -> bool {
        self.is_source_allowed(&peer.ip().to_string())
    }
}
