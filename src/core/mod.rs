//! Core relay module
//!
//! This module contains the relay functionality:
//! - Header protocol parsing and target policy
//! - Source and destination admission gates
//! - Outbound dialing, duplex relay and the UDP tunnel
//! - Hook traits for list lookups and name resolution

mod cidr;
mod destination_gate;
mod dialer;
pub mod hooks;
pub mod protocol;
mod relay;
mod server;
mod snapshot;
mod source_gate;
mod udp_tunnel;

pub use cidr::{CidrParseError, IpCidr};
pub use destination_gate::{BlockedDestinationSet, DestinationGate};
pub use dialer::Dialer;
pub use hooks::{DestinationBlockList, Resolver, SourceAllowList, SystemResolver};
pub use protocol::{
    parse_header, read_header, split_host_port, HeaderError, RelayHeader, TargetPolicy, Transport,
    TEMP_MAIL_RULE,
};
pub use relay::{
    relay_duplex, CopyResult, RelayEnd, RelayOptions, RelayShutdown, DEFAULT_BUFFER_SIZE,
};
pub use server::{Server, ServerBuilder};
pub use snapshot::ListSnapshot;
pub use source_gate::{AllowedSourceSet, SourceGate};
pub use udp_tunnel::{TunnelStats, UdpFrame, UdpTunnel};
