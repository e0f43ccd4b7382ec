//! Retry with exponential backoff and jitter for transient store I/O.

use rand::{thread_rng, Rng};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 0, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: usize) -> Self { Self { max_retries, ..Self::default() } }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(16) as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Retry only errors accepted by `retryable`; others are returned immediately.
pub async fn retry_async_when<F, Fut, T, E, P>(cfg: &RetryConfig, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !retryable(&e) => return Err(e),
            Err(_) => {
                let delay = cfg.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum ReadError { Busy, Missing }

    fn fast(max_retries: usize) -> RetryConfig {
        RetryConfig { max_retries, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), jitter: 0.0 }
    }

    fn transient(e: &ReadError) -> bool { *e == ReadError::Busy }

    #[tokio::test]
    async fn transient_errors_are_retried_until_read_succeeds() {
        let mut reads = 0;
        let res = retry_async_when(&fast(3), transient, |_| {
            reads += 1;
            let n = reads;
            async move { if n < 3 { Err(ReadError::Busy) } else { Ok("artifact") } }
        }).await;
        assert_eq!(res, Ok("artifact"));
        assert_eq!(reads, 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let mut reads = 0;
        let res: Result<(), _> = retry_async_when(&fast(2), transient, |_| { reads += 1; async { Err(ReadError::Busy) } }).await;
        assert_eq!(res, Err(ReadError::Busy));
        assert_eq!(reads, 3);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_retried() {
        let mut reads = 0;
        let res: Result<(), _> = retry_async_when(&fast(5), transient, |_| { reads += 1; async { Err(ReadError::Missing) } }).await;
        assert_eq!(res, Err(ReadError::Missing));
        assert_eq!(reads, 1);
    }

    #[tokio::test]
    async fn zero_retries_is_single_attempt() {
        let mut reads = 0;
        let _: Result<(), _> = retry_async_when(&RetryConfig::default(), transient, |attempt| {
            assert_eq!(attempt, 0);
            reads += 1;
            async { Err(ReadError::Busy) }
        }).await;
        assert_eq!(reads, 1);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = RetryConfig { max_retries: 10, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(250), jitter: 0.0 };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(5), Duration::from_millis(250));
    }
}
