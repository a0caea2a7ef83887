use std::{future::Future, time::Duration};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Number of full rounds. Each round tries every endpoint once.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter (`0..=jitter_max_ms`) added to each backoff sleep.
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
            jitter_max_ms: 250,
        }
    }
}

impl BackoffConfig {
    /// A single pass with no sleeping, for fakes and tests.
    pub const fn single_pass() -> Self {
        Self {
            rounds: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("no endpoints configured")]
    NoEndpoints,

    /// Every attempt failed, or one failed with an error that must not be retried.
    #[error(transparent)]
    Exhausted(E),
}

fn compute_backoff_delay(cfg: &BackoffConfig, round: usize) -> Duration {
    let shift = u32::try_from(round.min(16)).unwrap_or(16_u32);
    let pow2 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(pow2).min(max_ms);
    let jitter = if cfg!(test) || cfg.jitter_max_ms == 0 {
        0
    } else {
        rand::random::<u64>() % cfg.jitter_max_ms.saturating_add(1).max(1)
    };
    Duration::from_millis(ms.saturating_add(jitter))
}

/// Try `op(item)` across all items, in order, for `cfg.rounds` rounds, sleeping with
/// exponential backoff between rounds.
///
/// An error for which `is_retryable` returns false stops immediately: an endpoint that
/// rejected a broadcast will not accept it from a mirror either.
pub async fn try_each_with_backoff<'a, I, T, E, Fut>(
    items: &'a [I],
    cfg: &BackoffConfig,
    mut op: impl FnMut(&'a I) -> Fut + Send,
    is_retryable: impl Fn(&E) -> bool + Send,
) -> Result<T, RetryError<E>>
where
    I: Sync,
    E: std::fmt::Display,
    Fut: Future<Output = Result<T, E>> + Send,
{
    if items.is_empty() {
        return Err(RetryError::NoEndpoints);
    }

    let rounds = cfg.rounds.max(1);
    let mut last_err: Option<E> = None;

    for round in 0..rounds {
        for item in items {
            match op(item).await {
                Ok(v) => return Ok(v),
                Err(e) if !is_retryable(&e) => return Err(RetryError::Exhausted(e)),
                Err(e) => {
                    tracing::debug!(round, error = %e, "endpoint attempt failed");
                    last_err = Some(e);
                }
            }
        }

        if round + 1 < rounds {
            tokio::time::sleep(compute_backoff_delay(cfg, round)).await;
        }
    }

    Err(last_err.map_or(RetryError::NoEndpoints, RetryError::Exhausted))
}
