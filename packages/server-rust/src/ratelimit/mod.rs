//! Token-bucket rate limiting for inbound protocol messages.
//!
//! - [`bucket`]: A single token bucket with a bounded wait queue
//! - [`config`]: Bucket options per level and limit group
//! - [`manager`]: Global, group and operation levels for one connection

pub mod bucket;
pub mod config;
pub mod manager;

pub use bucket::{AcquireError, TokenBucket, TokenBucketOptions};
pub use config::RateLimitConfig;
pub use manager::{LimitLevel, RateLimitError, RateLimiterManager};
