//! Token bucket with a bounded wait queue.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Parameters of a single token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketOptions {
    /// Maximum tokens (burst capacity). The bucket starts full.
    pub token_limit: u32,
    /// Tokens added every `replenishment_period`.
    pub tokens_per_period: u32,
    pub replenishment_period: Duration,
    /// Maximum number of callers waiting for a token. Zero means fail fast.
    pub queue_limit: u32,
}

impl TokenBucketOptions {
    /// `token_limit` tokens, fully replenished every `period`, no queueing.
    #[must_use]
    pub fn new(token_limit: u32, period: Duration) -> Self {
        Self {
            token_limit,
            tokens_per_period: token_limit,
            replenishment_period: period,
            queue_limit: 0,
        }
    }

    #[must_use]
    pub fn with_tokens_per_period(mut self, tokens: u32) -> Self {
        self.tokens_per_period = tokens;
        self
    }

    #[must_use]
    pub fn with_queue_limit(mut self, queue_limit: u32) -> Self {
        self.queue_limit = queue_limit;
        self
    }
}

/// Why a token could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("queue limit exceeded")]
    QueueLimitExceeded,
    #[error("timed out waiting for a token")]
    Timeout,
    #[error("cancelled while waiting for a token")]
    Cancelled,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_replenish: Instant,
    queued: u32,
}

/// Token bucket. Replenishes in whole periods; waiters beyond `queue_limit`
/// are rejected immediately.
#[derive(Debug)]
pub struct TokenBucket {
    options: TokenBucketOptions,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(options: TokenBucketOptions) -> Self {
        let options = TokenBucketOptions {
            tokens_per_period: options.tokens_per_period.max(1),
            ..options
        };
        Self {
            state: Mutex::new(BucketState {
                tokens: options.token_limit,
                last_replenish: Instant::now(),
                queued: 0,
            }),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &TokenBucketOptions {
        &self.options
    }

    /// Tokens currently available.
    #[must_use]
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.replenish(&mut state, Instant::now());
        state.tokens
    }

    /// Callers currently waiting for a token.
    #[must_use]
    pub fn queued(&self) -> u32 {
        self.state.lock().queued
    }

    /// Takes a token if one is available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.replenish(&mut state, Instant::now());
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Takes a token, waiting for replenishment if the queue has room.
    ///
    /// # Errors
    ///
    /// - `QueueLimitExceeded` if no token is available and the queue is full
    /// - `Timeout` if `timeout` elapses first
    /// - `Cancelled` if `cancel` fires first
    pub async fn acquire(&self, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<(), AcquireError> {
        if self.options.token_limit == 0 {
            return Err(AcquireError::QueueLimitExceeded);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot: Option<QueueSlot<'_>> = None;

        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                self.replenish(&mut state, now);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return Ok(());
                }
                if slot.is_none() {
                    if state.queued >= self.options.queue_limit {
                        return Err(AcquireError::QueueLimitExceeded);
                    }
                    state.queued += 1;
                    slot = Some(QueueSlot(self));
                }
                (state.last_replenish + self.options.replenishment_period).saturating_duration_since(now)
            };

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = cancel.cancelled() => return Err(AcquireError::Cancelled),
                () = expired => return Err(AcquireError::Timeout),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn replenish(&self, state: &mut BucketState, now: Instant) {
        let period = self.options.replenishment_period;
        if period.is_zero() {
            state.tokens = self.options.token_limit;
            state.last_replenish = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_replenish);
        let periods = elapsed.as_nanos() / period.as_nanos();
        if periods == 0 {
            return;
        }
        let added = u128::from(self.options.tokens_per_period) * periods;
        let limit = self.options.token_limit;
        state.tokens = u32::try_from(u128::from(state.tokens) + added)
            .unwrap_or(limit)
            .min(limit);
        state.last_replenish = u32::try_from(periods)
            .ok()
            .and_then(|n| period.checked_mul(n))
            .map_or(now, |advance| state.last_replenish + advance);
    }
}

/// A reserved place in the wait queue, released on drop.
struct QueueSlot<'a>(&'a TokenBucket);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.queued = state.queued.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
