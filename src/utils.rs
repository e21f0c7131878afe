use std::future::Future;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Await `fut`, bounded by `deadline` when one is configured.
///
/// `what` names the operation in the resulting [`RelayError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Option<Duration>, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RelayError::Timeout(what))?,
        None => fut.await,
    }
}
