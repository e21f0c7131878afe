//! Core relay server
//!
//! The Server struct bundles the admission gates, the outbound dialer and the
//! connection settings shared by every session.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::destination_gate::DestinationGate;
use super::dialer::Dialer;
use super::protocol::TargetPolicy;
use super::relay::RelayOptions;
use super::snapshot::ListSnapshot;
use super::source_gate::SourceGate;
use super::udp_tunnel::UdpTunnel;
use crate::config::ConnConfig;

/// Core relay server
pub struct Server {
    /// Peers allowed to connect
    pub source_gate: SourceGate,
    /// Targets refused after header parsing
    pub destination_gate: DestinationGate,
    /// Named substring rules checked before the destination gate; swapped on
    /// lists reload
    pub target_policy: Arc<ListSnapshot<TargetPolicy>>,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
    /// Cancelled on shutdown; live sessions observe it
    pub shutdown: CancellationToken,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn dialer(&self) -> Dialer {
        Dialer::new(self.conn_config.connect_timeout, self.conn_config.tcp_nodelay)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            buffer_size: self.conn_config.buffer_size,
            idle_timeout: self.conn_config.idle_timeout,
            shutdown: self.conn_config.relay_shutdown,
        }
    }

    pub fn udp_tunnel(&self) -> UdpTunnel {
        UdpTunnel::new(self.dialer(), self.conn_config.idle_timeout)
    }
}

/// Builder for constructing a Server
pub struct ServerBuilder {
    source_gate: Option<SourceGate>,
    destination_gate: Option<DestinationGate>,
    target_policy: Option<Arc<ListSnapshot<TargetPolicy>>>,
    conn_config: Option<ConnConfig>,
    shutdown: Option<CancellationToken>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            source_gate: None,
            destination_gate: None,
            target_policy: None,
            conn_config: None,
            shutdown: None,
        }
    }

    pub fn source_gate(mut self, gate: SourceGate) -> Self {
        self.source_gate = Some(gate);
        self
    }

    pub fn destination_gate(mut self, gate: DestinationGate) -> Self {
        self.destination_gate = Some(gate);
        self
    }

    /// Fixed policy; defaults to [`TargetPolicy::default`]
    pub fn target_policy(self, policy: TargetPolicy) -> Self {
        self.shared_target_policy(Arc::new(ListSnapshot::new(policy)))
    }

    /// Policy read through a snapshot the caller may swap later
    pub fn shared_target_policy(mut self, policy: Arc<ListSnapshot<TargetPolicy>>) -> Self {
        self.target_policy = Some(policy);
        self
    }

    /// Defaults to [`ConnConfig::default`]
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Defaults to a fresh token nobody else holds
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the server
    ///
    /// Panics if the source or destination gate is not set
    pub fn build(self) -> Server {
        Server {
            source_gate: self.source_gate.expect("source gate is required"),
            destination_gate: self.destination_gate.expect("destination gate is required"),
            target_policy: self
                .target_policy
                .unwrap_or_else(|| Arc::new(ListSnapshot::new(TargetPolicy::default()))),
            conn_config: self.conn_config.unwrap_or_default(),
            shutdown: self.shutdown.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AllowedSourceSet, BlockedDestinationSet, RelayShutdown};
    use std::time::Duration;

    fn gates() -> (SourceGate, DestinationGate) {
        (
            SourceGate::new(Arc::new(AllowedSourceSet::from_cidrs(["127.0.0.0/8"]))),
            DestinationGate::new(Arc::new(BlockedDestinationSet::from_hosts(["10.0.0.1"]))),
        )
    }

    #[test]
    fn test_server_builder_defaults() {
        let (source, destination) = gates();
        let server = Server::builder()
            .source_gate(source)
            .destination_gate(destination)
            .build();

        assert!(server.source_gate.is_source_allowed("127.0.0.1"));
        assert!(server.target_policy.load().violated_rule("temp-mail.org:443").is_some());
        assert!(server.conn_config.idle_timeout.is_none());
        assert!(!server.shutdown.is_cancelled());
    }

    #[test]
    fn test_server_derives_session_settings() {
        let (source, destination) = gates();
        let conn_config = ConnConfig {
            connect_timeout: Some(Duration::from_secs(3)),
            idle_timeout: Some(Duration::from_secs(60)),
            buffer_size: 4096,
            relay_shutdown: RelayShutdown::Both,
            tcp_nodelay: true,
            ..ConnConfig::default()
        };
        let server = Server::builder()
            .source_gate(source)
            .destination_gate(destination)
            .target_policy(TargetPolicy::new(["blocked.test"]))
            .conn_config(conn_config)
            .build();

        let dialer = server.dialer();
        assert_eq!(dialer.connect_timeout, Some(Duration::from_secs(3)));
        assert!(dialer.tcp_nodelay);

        let options = server.relay_options();
        assert_eq!(options.buffer_size, 4096);
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.shutdown, RelayShutdown::Both);

        assert!(server.target_policy.load().violated_rule("temp-mail.org:443").is_none());
    }

    #[test]
    fn test_server_shares_shutdown_token() {
        let (source, destination) = gates();
        let token = CancellationToken::new();
        let server = Server::builder()
            .source_gate(source)
            .destination_gate(destination)
            .shutdown(token.clone())
            .build();

        token.cancel();
        assert!(server.shutdown.is_cancelled());
    }

    #[test]
    fn test_server_sees_target_policy_swap() {
        let (source, destination) = gates();
        let policy = Arc::new(ListSnapshot::new(TargetPolicy::default()));
        let server = Server::builder()
            .source_gate(source)
            .destination_gate(destination)
            .shared_target_policy(policy.clone())
            .build();
        assert!(server.target_policy.load().violated_rule("example.com:443").is_none());

        policy.store(TargetPolicy::new(["example.com"]));
        assert_eq!(
            server.target_policy.load().violated_rule("example.com:443"),
            Some("example.com")
        );
    }

    #[test]
    #[should_panic(expected = "source gate is required")]
    fn test_server_builder_requires_source_gate() {
        let (_, destination) = gates();
        let _ = Server::builder().destination_gate(destination).build();
    }
}
