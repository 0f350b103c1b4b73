//! Bounded polling for results the API server produces asynchronously.
//!
//! A signed CSR certificate and a service-account token secret both appear
//! some time after the call that triggers them. [`poll_until_ready`] re-runs a
//! read with exponential backoff and jitter while it reports "not ready", and
//! aborts on anything else.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Total reads, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl PollConfig {
    /// One immediate read with no retry.
    #[cfg(test)]
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error that is not
/// [`Error::is_not_ready`], or `config.max_attempts` reads have been made.
///
/// A single-attempt config returns the underlying error unchanged. When more
/// than one read was made, exhaustion is reported as [`Error::Timeout`]
/// carrying the last cause.
pub async fn poll_until_ready<F, Fut, T>(
    config: &PollConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !e.is_not_ready() {
            return Err(e);
        }

        if attempt >= max_attempts {
            if max_attempts == 1 {
                return Err(e);
            }
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Result never became ready"
            );
            return Err(Error::Timeout {
                operation: operation_name.to_string(),
                attempts: attempt,
                last: Box::new(e),
            });
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            "Not ready yet, polling again"
        );

        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
