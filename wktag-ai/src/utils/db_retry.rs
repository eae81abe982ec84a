//! Lock-contention retry for claim and work-unit writes
//!
//! Several worker processes write the same SQLite file. `busy_timeout`
//! absorbs most contention inside SQLite; whatever still surfaces as
//! "database is locked" is retried here with exponential backoff
//! (10 ms doubling to 1 s) until `max_wait` elapses.

use std::time::Duration;

use tokio::time::Instant;
use wktag_common::{Error, Result};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;

/// Retry `operation` while it fails with lock contention
///
/// Any other error returns immediately. Once `max_wait` has elapsed the last
/// attempt's failure is reported as [`Error::Internal`].
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait: Duration, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_lock_contention() => return Err(err),
            Err(err) => {
                let elapsed = start.elapsed();
                if elapsed >= max_wait {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %err,
                        "Database still locked, giving up"
                    );
                    return Err(Error::Internal(format!(
                        "{}: database locked after {} attempts ({} ms)",
                        operation_name,
                        attempt,
                        elapsed.as_millis()
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, retrying after backoff"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}
