use std::time::Duration;

use tether_core::LimitGroup;

use super::bucket::TokenBucketOptions;

/// Limits applied to inbound messages, per connection.
///
/// Three levels are checked in order: the global bucket, the bucket of the
/// message's limit group, then the operation bucket. Operation buckets use the
/// operation's own rate-limit setting when present, else the group default.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Upper bound on how long one message may wait in a queue.
    pub acquire_timeout: Option<Duration>,
    pub global: TokenBucketOptions,
    pub ping: TokenBucketOptions,
    pub unary: TokenBucketOptions,
    pub subscription: TokenBucketOptions,
    pub stream: TokenBucketOptions,
    pub ingest: TokenBucketOptions,
    pub unary_operation: TokenBucketOptions,
    pub subscription_operation: TokenBucketOptions,
    pub stream_operation: TokenBucketOptions,
    pub ingest_operation: TokenBucketOptions,
}

impl RateLimitConfig {
    /// Bucket options for a whole limit group.
    #[must_use]
    pub fn group(&self, group: LimitGroup) -> TokenBucketOptions {
        match group {
            LimitGroup::Ping => self.ping,
            LimitGroup::Unary => self.unary,
            LimitGroup::Subscription => self.subscription,
            LimitGroup::Stream => self.stream,
            LimitGroup::Ingest => self.ingest,
        }
    }

    /// Default operation-level bucket for a group. Pings have none.
    #[must_use]
    pub fn operation_default(&self, group: LimitGroup) -> Option<TokenBucketOptions> {
        match group {
            LimitGroup::Ping => None,
            LimitGroup::Unary => Some(self.unary_operation),
            LimitGroup::Subscription => Some(self.subscription_operation),
            LimitGroup::Stream => Some(self.stream_operation),
            LimitGroup::Ingest => Some(self.ingest_operation),
        }
    }

    /// Every level allows `options`; useful for tests and trusted links.
    #[must_use]
    pub fn uniform(options: TokenBucketOptions) -> Self {
        Self {
            enabled: true,
            acquire_timeout: None,
            global: options,
            ping: options,
            unary: options,
            subscription: options,
            stream: options,
            ingest: options,
            unary_operation: options,
            subscription_operation: options,
            stream_operation: options,
            ingest_operation: options,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let second = Duration::from_secs(1);
        Self {
            enabled: true,
            acquire_timeout: Some(Duration::from_secs(5)),
            global: TokenBucketOptions::new(1000, second).with_queue_limit(100),
            ping: TokenBucketOptions::new(10, second),
            unary: TokenBucketOptions::new(200, second).with_queue_limit(50),
            subscription: TokenBucketOptions::new(20, second).with_queue_limit(10),
            stream: TokenBucketOptions::new(50, second).with_queue_limit(20),
            ingest: TokenBucketOptions::new(500, second).with_queue_limit(100),
            unary_operation: TokenBucketOptions::new(100, second).with_queue_limit(20),
            subscription_operation: TokenBucketOptions::new(10, second).with_queue_limit(5),
            stream_operation: TokenBucketOptions::new(20, second).with_queue_limit(10),
            ingest_operation: TokenBucketOptions::new(250, second).with_queue_limit(50),
        }
    }
}
