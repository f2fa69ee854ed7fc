//! Polling helpers for relay tests
//!
//! Connection setup, peer lookup, and disconnect cleanup all happen on
//! background tasks, so tests wait for observable state instead of sleeping
//! a fixed amount.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::relay::server::RelayServer;

/// Default wait used by relay tests
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default poll interval used by relay tests
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Retry `check` until it returns `Ok`, panicking with the last error after `timeout`.
///
/// ```rust,ignore
/// let label = wait_until_ok(
///     "first connection label",
///     SETTLE_TIMEOUT,
///     POLL_INTERVAL,
///     || async { server.connection_labels().first().cloned().ok_or("no connections") },
/// )
/// .await;
/// ```
pub async fn wait_until_ok<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = std::time::Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last_error = match check().await {
            Ok(value) => return value,
            Err(e) => e.to_string(),
        };

        if started.elapsed() >= timeout {
            panic!(
                "Timeout waiting for {} after {:?} ({} attempts), last error: {}",
                desc,
                started.elapsed(),
                attempts,
                last_error
            );
        }
        tokio::time::sleep(interval).await;
    }
}

/// Boolean form of [`wait_until_ok`]
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_until_ok(desc, timeout, interval, || {
        let fut = condition();
        async move {
            if fut.await {
                Ok(())
            } else {
                Err("condition never became true")
            }
        }
    })
    .await
}

/// Wait until the server's registry holds exactly `expected` connections
pub async fn wait_for_connections(server: &RelayServer, expected: usize) {
    let desc = format!("{} registered connections", expected);
    assert_eventually_bool(&desc, SETTLE_TIMEOUT, POLL_INTERVAL, || async {
        server.connection_count() == expected
    })
    .await;
}
