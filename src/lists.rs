//! Allow and block tables
//!
//! Built-in defaults ship with the binary. A YAML lists file can override any
//! of them; keys missing from the file keep their built-in value.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::core::{
    AllowedSourceSet, BlockedDestinationSet, ListSnapshot, TargetPolicy, TEMP_MAIL_RULE,
};
use crate::logger::log;

/// Loopback plus the published Cloudflare edge ranges
pub const DEFAULT_ALLOWED_SOURCES: &[&str] = &[
    "127.0.0.0/8", "103.21.244.0/22", "103.22.200.0/22", "103.31.4.0/22",
    "104.16.0.0/12", "108.162.192.0/18", "131.0.72.0/22", "141.101.64.0/18",
    "162.158.0.0/15", "172.64.0.0/13", "173.245.48.0/20", "188.114.96.0/20",
    "190.93.240.0/20", "197.234.240.0/22", "198.41.128.0/17", "::1/128",
    "2400:cb00::/32", "2405:8100::/32", "2405:b500::/32", "2606:4700::/32",
    "2803:f800::/32", "2c0f:f248::/32", "2a06:98c0::/29",
];

/// Known tracker addresses
pub const DEFAULT_BLOCKED_DESTINATIONS: &[&str] = &[
    "93.158.213.92", "102.223.180.235", "23.134.88.6", "185.243.218.213",
    "208.83.20.20", "91.216.110.52", "83.146.97.90", "23.157.120.14",
    "185.102.219.163", "163.172.29.130", "156.234.201.18", "209.141.59.16",
    "34.94.213.23", "192.3.165.191", "130.61.55.93", "109.201.134.183",
    "95.31.11.224", "83.102.180.21", "192.95.46.115", "198.100.149.66",
    "95.216.74.39", "51.68.174.87", "37.187.111.136", "51.15.79.209",
    "45.92.156.182", "49.12.76.8", "5.196.89.204", "62.233.57.13",
    "45.9.60.30", "35.227.12.84", "179.43.155.30", "94.243.222.100",
    "207.241.231.226", "207.241.226.111", "51.159.54.68", "82.65.115.10",
    "95.217.167.10", "86.57.161.157", "83.31.30.230", "94.103.87.87",
    "160.119.252.41", "193.42.111.57", "80.240.22.46", "107.189.31.134",
    "104.244.79.114", "85.239.33.28", "61.222.178.254", "38.7.201.142",
    "51.81.222.188", "103.196.36.31", "23.153.248.2", "73.170.204.100",
    "176.31.250.174", "149.56.179.233", "212.237.53.230", "185.68.21.244",
    "82.156.24.219", "216.201.9.155", "51.15.41.46", "85.206.172.159",
    "104.244.77.87", "37.27.4.53", "192.3.165.198", "15.204.205.14",
    "103.122.21.50", "104.131.98.232", "173.249.201.201", "23.254.228.89",
    "5.102.159.190", "65.130.205.148", "119.28.71.45", "159.69.65.157",
    "160.251.78.190", "107.189.7.143", "159.65.224.91", "185.217.199.21",
    "91.224.92.110", "161.97.67.210", "51.15.3.74", "209.126.11.233",
    "37.187.95.112", "167.99.185.219", "144.91.88.22", "88.99.2.212",
    "37.59.48.81", "95.179.130.187", "51.15.26.25", "192.9.228.30",
];

pub const DEFAULT_FORBIDDEN_TARGET_SUBSTRINGS: &[&str] = &[TEMP_MAIL_RULE];

fn default_allowed_sources() -> Vec<String> {
    DEFAULT_ALLOWED_SOURCES.iter().map(|s| s.to_string()).collect()
}

fn default_blocked_destinations() -> Vec<String> {
    DEFAULT_BLOCKED_DESTINATIONS.iter().map(|s| s.to_string()).collect()
}

fn default_forbidden_target_substrings() -> Vec<String> {
    DEFAULT_FORBIDDEN_TARGET_SUBSTRINGS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Contents of the lists file
///
/// ```yaml
/// allowed_sources:
///   - 127.0.0.0/8
///   - 10.0.0.0/8
/// blocked_destinations:
///   - 192.0.2.1
/// forbidden_target_substrings:
///   - temp-mail.org
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListsConfig {
    /// CIDR ranges of peers allowed to connect
    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,
    /// Literal IP strings refused as destinations
    #[serde(default = "default_blocked_destinations")]
    pub blocked_destinations: Vec<String>,
    /// Targets containing any of these are refused before resolution
    #[serde(default = "default_forbidden_target_substrings")]
    pub forbidden_target_substrings: Vec<String>,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ListsConfig {
    /// The tables compiled into the binary
    pub fn builtin() -> Self {
        Self {
            allowed_sources: default_allowed_sources(),
            blocked_destinations: default_blocked_destinations(),
            forbidden_target_substrings: default_forbidden_target_substrings(),
        }
    }

    /// Parse a YAML document; an empty document yields the built-in tables
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::builtin());
        }
        serde_yaml::from_str(content).context("Failed to parse lists file")
    }

    /// Read and parse the lists file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lists file: {}", path.display()))?;
        let lists = Self::from_yaml(&content)?;
        log::info!(
            file = %path.display(),
            allowed_sources = lists.allowed_sources.len(),
            blocked_destinations = lists.blocked_destinations.len(),
            forbidden_target_substrings = lists.forbidden_target_substrings.len(),
            "Lists loaded"
        );
        Ok(lists)
    }

    /// Built-in tables when `path` is `None`
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn allowed_source_set(&self) -> AllowedSourceSet {
        AllowedSourceSet::from_cidrs(&self.allowed_sources)
    }

    pub fn blocked_destination_set(&self) -> BlockedDestinationSet {
        BlockedDestinationSet::from_hosts(self.blocked_destinations.iter().cloned())
    }

    pub fn target_policy(&self) -> TargetPolicy {
        TargetPolicy::new(self.forbidden_target_substrings.iter().cloned())
    }
}

/// Live tables and target policy, swapped wholesale on reload
#[derive(Clone)]
pub struct LiveLists {
    pub allowed_sources: Arc<ListSnapshot<AllowedSourceSet>>,
    pub blocked_destinations: Arc<ListSnapshot<BlockedDestinationSet>>,
    pub target_policy: Arc<ListSnapshot<TargetPolicy>>,
}

impl LiveLists {
    pub fn new(lists: &ListsConfig) -> Self {
        Self {
            allowed_sources: Arc::new(ListSnapshot::new(lists.allowed_source_set())),
            blocked_destinations: Arc::new(ListSnapshot::new(lists.blocked_destination_set())),
            target_policy: Arc::new(ListSnapshot::new(lists.target_policy())),
        }
    }

    /// Replace every table with the contents of `lists`
    pub fn apply(&self, lists: &ListsConfig) {
        self.allowed_sources.store(lists.allowed_source_set());
        self.blocked_destinations
            .store(lists.blocked_destination_set());
        self.target_policy.store(lists.target_policy());
    }

    /// Re-read `path` and swap the tables in.
    ///
    /// On failure the current tables stay in place.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let lists = ListsConfig::load(path)?;
        self.apply(&lists);
        Ok(())
    }
}
