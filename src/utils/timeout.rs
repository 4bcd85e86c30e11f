//! # Timeouts
//!
//! Shared timeout constants and an async wrapper that maps elapsed
//! deadlines onto [`ProtocolError::Timeout`].

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default deadline for client operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long teardown waits for in-flight writes before forcing the socket closed
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// Smallest idle timeout accepted by configuration
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_millis(10);

/// Pause after a failed accept before accepting again
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Run `fut` with a deadline, flattening the inner result
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
