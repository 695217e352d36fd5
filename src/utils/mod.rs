//! Small cross-cutting helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// Run `fut` to completion, failing with [`ErrorKind::Timeout`] if it takes
/// longer than `duration`. A thin wrapper over `tokio::time::timeout` that
/// folds the elapsed error into this crate's own error taxonomy, so callers
/// at a listener's handshake boundary can match on [`ErrorKind`] like any
/// other failure instead of a separate `Elapsed` type.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(ErrorKind::Timeout)),
    }
}
