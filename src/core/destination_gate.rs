//! Destination admission: which targets the relay refuses to dial.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use super::hooks::{DestinationBlockList, Resolver, SystemResolver};
use crate::logger::log;

/// Exact host addresses that may not be relayed to
#[derive(Debug, Clone, Default)]
pub struct BlockedDestinationSet {
    hosts: HashSet<String>,
}

impl BlockedDestinationSet {
    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl DestinationBlockList for BlockedDestinationSet {
    fn is_blocked(&self, address: &str) -> bool {
        self.hosts.contains(address)
    }
}

/// Decides whether a requested target host is forbidden
///
/// Literal addresses are checked as given. Names are resolved and every IPv4
/// answer is checked; IPv6 answers are not compared against the list. A name
/// that resolves to nothing is treated as not blocked unless
/// `block_unresolved` is set.
#[derive(Clone)]
pub struct DestinationGate {
    block: Arc<dyn DestinationBlockList>,
    resolver: Arc<dyn Resolver>,
    resolve_timeout: Option<Duration>,
    block_unresolved: bool,
}

impl DestinationGate {
    pub fn new(block: Arc<dyn DestinationBlockList>) -> Self {
        Self {
            block,
            resolver: Arc::new(SystemResolver),
            resolve_timeout: None,
            block_unresolved: false,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_block_unresolved(mut self, block_unresolved: bool) -> Self {
        self.block_unresolved = block_unresolved;
        self
    }

    /// Whether `host` (an address literal or a name, no port) is blocked
    pub async fn is_destination_blocked(&self, host: &str) -> bool {
        if host.parse::<IpAddr>().is_ok() {
            return self.block.is_blocked(host);
        }

        let resolved = self.resolve(host).await;
        if resolved.is_empty() {
            if self.block_unresolved {
                log::debug!(host = %host, "Destination did not resolve, treating as blocked");
            }
            return self.block_unresolved;
        }

        resolved
            .iter()
            .filter_map(ipv4_form)
            .any(|v4| self.block.is_blocked(&v4.to_string()))
    }

    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        match self.resolve_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.resolver.lookup_ip(host)).await {
                Ok(ips) => ips,
                Err(_) => {
                    log::debug!(host = %host, "DNS lookup timed out");
                    Vec::new()
                }
            },
            None => self.resolver.lookup_ip(host).await,
        }
    }
}

/// IPv4 form of an address, if it has one (IPv4-mapped IPv6 included)
fn ipv4_form(ip: &IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
