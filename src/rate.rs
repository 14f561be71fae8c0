//! Byte-admission control for transfers.
//!
//! A transfer asks its limiter for permission before writing each slice
//! of the body. The limiter is advisory: the core never consults it
//! after EOF, and transfers without one run unthrottled.

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, Result};

/// Admission control granting permission to write `n` bytes.
///
/// Implementations block until the bytes are admitted, or fail with
/// [`DownloadError::Canceled`] when the cancellation token fires first.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn wait_n(&self, n: usize, cancel: &CancellationToken) -> Result<()>;
}

/// Token-bucket limiter with a fixed bytes-per-second quota.
///
/// The burst capacity equals one second worth of quota; admission
/// requests larger than the burst are granted in installments so that
/// arbitrarily large writes still pace correctly.
pub struct TokenBucket {
    limiter: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: u32,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u32) -> Self {
        let rate = NonZeroU32::new(bytes_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: GovernorLimiter::direct(Quota::per_second(rate)),
            burst: rate.get(),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn wait_n(&self, n: usize, cancel: &CancellationToken) -> Result<()> {
        let mut remaining = n as u64;
        while remaining > 0 {
            let take = remaining.min(u64::from(self.burst)) as u32;
            let Some(take) = NonZeroU32::new(take) else {
                break;
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Canceled),
                // `take` never exceeds the burst, so capacity cannot be
                // exceeded and the wait always resolves.
                outcome = self.limiter.until_n_ready(take) => {
                    let _ = outcome;
                }
            }
            remaining -= u64::from(take.get());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn admits_burst_immediately() {
        let bucket = TokenBucket::new(10_000);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        bucket.wait_n(10_000, &cancel).await.unwrap();
        assert!(start.elapsed().as_millis() < 100);
    }

    #[tokio::test]
    async fn paces_requests_beyond_the_burst() {
        let bucket = TokenBucket::new(1_000);
        let cancel = CancellationToken::new();

        // First second of quota is free; the next 500 bytes must wait.
        let start = Instant::now();
        bucket.wait_n(1_000, &cancel).await.unwrap();
        bucket.wait_n(500, &cancel).await.unwrap();
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let bucket = TokenBucket::new(100);
        let cancel = CancellationToken::new();

        // Drain the burst, then cancel while the next request is queued.
        bucket.wait_n(100, &cancel).await.unwrap();

        let waiter = {
            let cancel = cancel.clone();
            async move { bucket.wait_n(10_000, &cancel).await }
        };
        let handle = tokio::spawn(waiter);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DownloadError::Canceled)));
    }
}
