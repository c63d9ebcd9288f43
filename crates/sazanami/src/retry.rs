use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::error::{SazanamiError, SazanamiResult};

/// Relative fuzz applied to every backoff delay.
const FUZZ_FACTOR: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries allowed after the first attempt.
    pub total_retries: u32,
}

/// Runs fallible network operations with exponential backoff.
///
/// The fuzz source is shared by clones, so a seeded executor stays
/// reproducible even when it is handed to several streams.
#[derive(Clone)]
pub struct RetryExecutor {
    rng: Arc<Mutex<StdRng>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt - 1), max)` scaled by a random factor in `[0.7, 1.3]`.
    pub fn backoff_delay(&self, options: &RetryOptions, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let nominal = (options.base_delay.as_secs_f64() * 2f64.powi(exponent))
            .min(options.max_delay.as_secs_f64());
        let fuzz = self
            .rng
            .lock()
            .gen_range((1. - FUZZ_FACTOR)..=(1. + FUZZ_FACTOR));
        Duration::from_secs_f64(nominal * fuzz)
    }

    /// Run `operation` until it succeeds, the error is not retryable, the retry
    /// budget is spent or `cancel` fires.
    ///
    /// `operation` receives the index of the attempt, starting at 0.
    /// `on_retry` is called with the error, the retry number and the delay
    /// before the next attempt is started.
    pub async fn run<T, F, Fut, R, C>(
        &self,
        mut operation: F,
        options: &RetryOptions,
        should_retry: R,
        mut on_retry: C,
        cancel: &CancellationToken,
    ) -> SazanamiResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SazanamiResult<T>>,
        R: Fn(&SazanamiError) -> bool,
        C: FnMut(&SazanamiError, u32, Duration),
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SazanamiError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SazanamiError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if cancel.is_cancelled() || error.is_cancelled() {
                return Err(SazanamiError::Cancelled);
            }
            if attempt >= options.total_retries || !should_retry(&error) {
                return Err(error);
            }

            attempt += 1;
            let delay = self.backoff_delay(options, attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Request failed, retry later."
            );
            on_retry(&error, attempt, delay);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SazanamiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::error::NetworkError;

    fn options(total_retries: u32) -> RetryOptions {
        RetryOptions {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            total_retries,
        }
    }

    fn server_error() -> SazanamiError {
        NetworkError::HttpStatus {
            status: 503,
            url: "https://example.com/1.m4s".to_string(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_bounds() {
        let executor = RetryExecutor::with_seed(42);
        let options = options(6);
        let cancel = CancellationToken::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let result: SazanamiResult<()> = executor
            .run(
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.lock().push(Instant::now());
                        Err(server_error())
                    }
                },
                &options,
                SazanamiError::is_retryable,
                |_, _, _| {},
                &cancel,
            )
            .await;
        assert!(result.is_err());

        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 7);
        for (i, pair) in attempts.windows(2).enumerate() {
            let observed = (pair[1] - pair[0]).as_secs_f64();
            let nominal = (0.1 * 2f64.powi(i as i32)).min(1.0);
            assert!(
                observed >= 0.7 * nominal - 1e-3 && observed <= 1.3 * nominal + 1e-3,
                "retry {} waited {observed}s, nominal {nominal}s",
                i + 1
            );
        }
    }

    #[test]
    fn test_seeded_delays_are_reproducible() {
        let options = options(4);
        let a = RetryExecutor::with_seed(7);
        let b = RetryExecutor::with_seed(7);
        for attempt in 1..=4 {
            assert_eq!(
                a.backoff_delay(&options, attempt),
                b.backoff_delay(&options, attempt)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let executor = RetryExecutor::with_seed(1);
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();

        let value = executor
            .run(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 2 {
                            Err(server_error())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                &options(4),
                SazanamiError::is_retryable,
                |_, attempt, _| retries.push(attempt),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_retryable() {
        let executor = RetryExecutor::with_seed(1);
        let calls = AtomicU32::new(0);

        let result: SazanamiResult<()> = executor
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(NetworkError::HttpStatus {
                            status: 404,
                            url: "https://example.com/404".to_string(),
                        }
                        .into())
                    }
                },
                &options(4),
                SazanamiError::is_retryable,
                |_, _, _| {},
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(SazanamiError::Network(NetworkError::HttpStatus { status: 404, .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let executor = RetryExecutor::with_seed(3);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let counter = calls.clone();
        let result: SazanamiResult<()> = executor
            .run(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(server_error()) }
                },
                &options(100),
                SazanamiError::is_retryable,
                |_, _, _| {},
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(SazanamiError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // nothing keeps running once the executor returned
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt() {
        let executor = RetryExecutor::with_seed(3);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: SazanamiResult<()> = executor
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                &options(3),
                SazanamiError::is_retryable,
                |_, _, _| {},
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(SazanamiError::Cancelled)));
    }
}
