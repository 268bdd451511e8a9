//! Retrying a fallible async operation with [`Backoff`] delays.

use {
    crate::backoff::Backoff,
    std::{fmt::Display, future::Future, time::Duration},
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: Display> {
    #[error("{0}")]
    Permanent(E),

    #[error("maximum attempts exceeded after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("interrupted by shutdown after {attempts} attempts")]
    Interrupted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryOpts {
    /// Total number of attempts, the first one included.
    pub max_retries: u32,

    /// Delay before the second attempt.
    pub delay_initial: Duration,

    /// Upper bound for any delay between attempts.
    pub delay_maximum: Duration,
}

impl Default for RetryOpts {
    fn default() -> Self {
        // About a day worth of attempts.
        Self {
            max_retries: 25,
            delay_initial: Duration::from_secs(10),
            delay_maximum: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryOpts {
    fn backoff(&self) -> Backoff {
        let retries = self.max_retries.saturating_sub(1) as usize;
        Backoff::new(self.delay_initial, self.delay_maximum, retries)
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `stop` is cancelled while waiting between attempts.
///
/// The first attempt always runs, even if `stop` is already cancelled.
pub async fn retry<F, Fut, T, E>(
    opts: &RetryOpts,
    stop: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempts = 1;

    let mut last = match op().await {
        Ok(value) => return Ok(value),
        Err(err) if !err.is_retryable() => return Err(RetryError::Permanent(err)),
        Err(err) => err,
    };

    for delay in opts.backoff() {
        warn!(
            error = %last,
            attempt = attempts,
            max_attempts = opts.max_retries,
            delay_ms = saturating_millis(delay),
            "retrying after error"
        );

        tokio::select! {
            biased;

            _ = stop.cancelled() => return Err(RetryError::Interrupted { attempts }),
            _ = tokio::time::sleep(delay) => {}
        }

        attempts += 1;

        last = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(RetryError::Permanent(err)),
            Err(err) => err,
        };
    }

    Err(RetryError::Exhausted { attempts, last })
}
