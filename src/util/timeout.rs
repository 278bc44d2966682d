//! Timeout helper.

use std::future::Future;
use std::time::Duration;

/// Race a future against an optional deadline. `None` disables the timeout;
/// a timed-out race yields `None`.
pub async fn with_timeout<T>(duration: Option<Duration>, future: impl Future<Output = T>) -> Option<T> {
    match duration {
        Some(duration) => tokio::time::timeout(duration, future).await.ok(),
        None => Some(future.await),
    }
}
