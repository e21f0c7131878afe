//! Source-gated TCP/UDP relay
//!
//! Architecture:
//! - `core/`: header protocol, admission gates, dialer, relay and UDP tunnel
//! - `handler`: per-connection session processing
//! - `server_runner`: listener setup and accept loop
//! - `lists`: built-in and file-backed allow/block tables
//! - `config`: command line and connection settings

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod lists;
pub mod logger;
pub mod server_runner;
pub mod utils;
