//! Configuration module for the relay
//!
//! This module handles CLI argument parsing with environment variable support.
//! Allow and block tables live in an optional YAML lists file (see `lists`).

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::protocol::DEFAULT_MAX_HEADER_SIZE;
use crate::core::{RelayShutdown, DEFAULT_BUFFER_SIZE};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// What the accept loop does when `accept()` fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AcceptErrorPolicy {
    /// Stop the server; the process exits non-zero
    #[default]
    Exit,
    /// Log the error and keep accepting
    Continue,
}

/// CLI arguments for the relay
///
/// Supports environment variables with EDGE_RELAY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Header-addressed TCP/UDP edge relay")]
pub struct CliArgs {
    /// Address or host name to listen on
    #[arg(short = 'b', long, env = "EDGE_RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short = 'p', long, env = "EDGE_RELAY_PORT", default_value_t = 6666)]
    pub port: u16,

    /// YAML file with allowed_sources, blocked_destinations and
    /// forbidden_target_substrings (built-in tables when omitted)
    #[arg(long, env = "EDGE_RELAY_LISTS_FILE")]
    pub lists_file: Option<PathBuf>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "EDGE_RELAY_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Refuse names that resolve to no address
    #[arg(long, env = "EDGE_RELAY_BLOCK_UNRESOLVED", default_value_t = false)]
    pub block_unresolved: bool,

    /// What to do when accepting a connection fails
    #[arg(long, env = "EDGE_RELAY_ON_ACCEPT_ERROR", value_enum, default_value_t = AcceptErrorPolicy::Exit)]
    pub on_accept_error: AcceptErrorPolicy,

    // ==================== Timeouts (all off unless set) ====================
    /// Deadline for the client to send its header line
    #[arg(long, env = "EDGE_RELAY_HEADER_TIMEOUT", value_parser = parse_duration, help_heading = "Timeouts")]
    pub header_timeout: Option<Duration>,

    /// Deadline for resolving a destination name
    #[arg(long, env = "EDGE_RELAY_RESOLVE_TIMEOUT", value_parser = parse_duration, help_heading = "Timeouts")]
    pub resolve_timeout: Option<Duration>,

    /// Deadline for connecting to the target
    #[arg(long, env = "EDGE_RELAY_CONNECT_TIMEOUT", value_parser = parse_duration, help_heading = "Timeouts")]
    pub connect_timeout: Option<Duration>,

    /// Close sessions with no traffic in either direction for this long
    #[arg(long, env = "EDGE_RELAY_IDLE_TIMEOUT", value_parser = parse_duration, help_heading = "Timeouts")]
    pub idle_timeout: Option<Duration>,

    // ==================== Performance Tuning ====================
    /// Buffer size for data transfer in bytes (default: 256KB)
    #[arg(long, env = "EDGE_RELAY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Longest accepted header line in bytes
    #[arg(long, env = "EDGE_RELAY_MAX_HEADER_SIZE", default_value_t = DEFAULT_MAX_HEADER_SIZE, help_heading = "Performance")]
    pub max_header_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "EDGE_RELAY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY on both legs of a session
    #[arg(
        long,
        env = "EDGE_RELAY_TCP_NODELAY",
        default_value_t = false,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// When a TCP session ends: after the target side closes (primary) or
    /// after both sides close (both)
    #[arg(long, env = "EDGE_RELAY_RELAY_SHUTDOWN", value_enum, default_value_t = RelayShutdown::Primary, help_heading = "Performance")]
    pub relay_shutdown: RelayShutdown,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("Listen host is required"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.max_header_size == 0 {
            return Err(anyhow!("max_header_size must be greater than 0"));
        }
        if self.tcp_backlog <= 0 {
            return Err(anyhow!("tcp_backlog must be greater than 0"));
        }

        for (name, value) in [
            ("header_timeout", self.header_timeout),
            ("resolve_timeout", self.resolve_timeout),
            ("connect_timeout", self.connect_timeout),
            ("idle_timeout", self.idle_timeout),
        ] {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        if let Some(ref path) = self.lists_file {
            if !path.exists() {
                return Err(anyhow!("Lists file not found: {}", path.display()));
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !ext.eq_ignore_ascii_case("yaml") && !ext.eq_ignore_ascii_case("yml") {
                return Err(anyhow!(
                    "Invalid lists file format: expected .yaml or .yml extension"
                ));
            }
        }

        Ok(())
    }

    /// `host:port` the listener binds
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Per-session settings shared by every connection
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    pub header_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    pub max_header_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    pub relay_shutdown: RelayShutdown,
    pub on_accept_error: AcceptErrorPolicy,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            header_timeout: None,
            connect_timeout: None,
            idle_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            tcp_backlog: 1024,
            tcp_nodelay: false,
            relay_shutdown: RelayShutdown::default(),
            on_accept_error: AcceptErrorPolicy::default(),
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            header_timeout: cli.header_timeout,
            connect_timeout: cli.connect_timeout,
            idle_timeout: cli.idle_timeout,
            buffer_size: cli.buffer_size,
            max_header_size: cli.max_header_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            relay_shutdown: cli.relay_shutdown,
            on_accept_error: cli.on_accept_error,
        }
    }
}
