//! Hook traits for the lookup services the gates depend on
//!
//! The relay only needs three answers from the outside world: is a source
//! address allowed, is a destination address blocked, and what does a host
//! name resolve to. Each is a trait so the list data and DNS can be supplied
//! (and replaced in tests) independently of the relay logic.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

use super::snapshot::ListSnapshot;
use crate::logger::log;

/// Allowed source prefixes
pub trait SourceAllowList: Send + Sync {
    /// Whether `ip` falls in any allowed prefix
    fn contains(&self, ip: IpAddr) -> bool;
}

/// Blocked destination addresses
pub trait DestinationBlockList: Send + Sync {
    /// Exact-match lookup of an address string
    fn is_blocked(&self, address: &str) -> bool;
}

/// Forward DNS resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to its addresses. Failures yield an empty list.
    async fn lookup_ip(&self, host: &str) -> Vec<IpAddr>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, host: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                log::debug!(host = %host, error = %e, "DNS lookup failed");
                Vec::new()
            }
        }
    }
}

impl<T: SourceAllowList> SourceAllowList for ListSnapshot<T> {
    fn contains(&self, ip: IpAddr) -> bool {
        self.load().contains(ip)
    }
}

impl<T: DestinationBlockList> DestinationBlockList for ListSnapshot<T> {
    fn is_blocked(&self, address: &str) -> bool {
        self.load().is_blocked(address)
    }
}

impl<T: SourceAllowList + ?Sized> SourceAllowList for Arc<T> {
    fn contains(&self, ip: IpAddr) -> bool {
        (**self).contains(ip)
    }
}

impl<T: DestinationBlockList + ?Sized> DestinationBlockList for Arc<T> {
    fn is_blocked(&self, address: &str) -> bool {
        (**self).is_blocked(address)
    }
}
