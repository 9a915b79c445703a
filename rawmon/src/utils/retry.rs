//! Retry helper for transient failures of external services.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BASE_DELAY_MS: u64 = 200;
const MAX_DELAY_MS: u64 = 5000;

/// Transport-level failures worth another attempt.
///
/// Answers the server gave on purpose (4xx, not-found) are final.
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::Http(e) => {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                return true;
            }
            e.status().is_some_and(|s| s.is_server_error())
        }
        Error::Io(_) => true,
        _ => false,
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp_ms = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = exp_ms.min(MAX_DELAY_MS);
    let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
    Duration::from_millis((capped_ms + jitter_ms).min(MAX_DELAY_MS))
}

/// Run `op` up to `attempts` times, sleeping with jittered exponential backoff between
/// transient failures.
pub async fn retry_transient<T, F, Fut>(op_name: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !is_transient(&err) || attempt >= attempts {
                    return Err(err);
                }

                let delay = backoff(attempt - 1);
                debug!(
                    "{} failed: {}, retrying in {:?} (attempt {}/{})",
                    op_name, err, delay, attempt, attempts
                );
                sleep(delay).await;
            }
        }
    }
}
