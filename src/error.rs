use std::io;
use thiserror::Error;

use crate::core::HeaderError;

/// Errors that end a single relay session
///
/// None of these are ever reported to the client: every variant results in
/// the inbound connection being closed.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Header could not be read or decoded
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// Target rejected by a named target policy rule
    #[error("Target forbidden by policy rule '{rule}': {target}")]
    ForbiddenTarget { rule: String, target: String },

    /// Target could not be split into host and port
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    /// Destination (or one of its resolved addresses) is on the block list
    #[error("Destination host is blocked: {0}")]
    BlockedDestination(String),

    /// Outbound dial failed
    #[error("Failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// A configured deadline expired
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether this error was raised before any outbound connection existed
    /// because the request itself was not admitted.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            RelayError::Header(_)
                | RelayError::ForbiddenTarget { .. }
                | RelayError::InvalidTarget(_)
                | RelayError::BlockedDestination(_)
        )
    }
}

/// Result alias for the session path
pub type Result<T> = std::result::Result<T, RelayError>;
