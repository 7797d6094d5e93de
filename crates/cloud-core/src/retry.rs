//! Exponential-backoff retry helper, reused by the RPC dispatcher's
//! `call` retries and the Zone Manager's poll loop.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retries `f` up to `max_attempts` times with exponential backoff
/// starting at `base_delay`, doubling each attempt. Returns the first
/// `Ok`, or the last `Err` once attempts are exhausted.
pub async fn retry<F, Fut, T, E>(max_attempts: u32, base_delay: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = base_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!(attempt, %e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let result: Result<i32, &str> = retry(3, Duration::from_millis(1), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<i32, &str> = retry(5, Duration::from_millis(1), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err("not yet") } else { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let result: Result<i32, &str> =
            retry(3, Duration::from_millis(1), || async { Err("always fails") }).await;
        assert_eq!(result.unwrap_err(), "always fails");
    }
}
