//! Per-connection hierarchical rate limiting.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tether_core::{LimitGroup, MessageType};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::bucket::{AcquireError, TokenBucket, TokenBucketOptions};
use super::config::RateLimitConfig;
use crate::service::blueprint::{OperationBlueprint, OperationKey};

/// Level of the hierarchy that rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLevel {
    Global,
    Group,
    Operation,
}

impl LimitLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Group => "group",
            Self::Operation => "operation",
        }
    }
}

impl fmt::Display for LimitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message was rejected by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded at {level} level: {reason}")]
pub struct RateLimitError {
    pub level: LimitLevel,
    pub reason: AcquireError,
}

/// Buckets of one connection: one global, one per limit group, one per
/// operation and one per linked correlation id.
///
/// A correlation id is linked to a blueprint while its flow is active (an
/// open stream, subscription or client stream). Follow-up messages that only
/// carry the correlation id are then limited by that flow's own bucket.
pub struct RateLimiterManager {
    config: Arc<RateLimitConfig>,
    global: TokenBucket,
    groups: DashMap<LimitGroup, Arc<TokenBucket>>,
    operations: DashMap<OperationKey, Arc<TokenBucket>>,
    correlations: DashMap<String, Arc<TokenBucket>>,
    links: DashMap<String, Arc<OperationBlueprint>>,
}

impl RateLimiterManager {
    #[must_use]
    pub fn new(config: Arc<RateLimitConfig>) -> Self {
        Self {
            global: TokenBucket::new(config.global),
            config,
            groups: DashMap::new(),
            operations: DashMap::new(),
            correlations: DashMap::new(),
            links: DashMap::new(),
        }
    }

    /// Admits one inbound message, waiting in bucket queues where allowed.
    ///
    /// Exempt message types and a disabled limiter admit immediately.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` naming the first level that rejected.
    pub async fn acquire(
        &self,
        message_type: MessageType,
        blueprint: Option<&Arc<OperationBlueprint>>,
        correlation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(group) = message_type.limit_group() else {
            return Ok(());
        };

        self.take(&self.global, LimitLevel::Global, message_type, cancel).await?;
        let group_bucket = self.group_bucket(group);
        self.take(&group_bucket, LimitLevel::Group, message_type, cancel).await?;
        if let Some(bucket) = self.operation_bucket(blueprint, correlation_id) {
            self.take(&bucket, LimitLevel::Operation, message_type, cancel).await?;
        }
        Ok(())
    }

    async fn take(
        &self,
        bucket: &TokenBucket,
        level: LimitLevel,
        message_type: MessageType,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        bucket
            .acquire(cancel, self.config.acquire_timeout)
            .await
            .map_err(|reason| {
                warn!(
                    level = level.as_str(),
                    message_type = message_type.as_str(),
                    %reason,
                    "message rate limited"
                );
                metrics::counter!(
                    "tether_rate_limit_rejections_total",
                    "level" => level.as_str(),
                    "message_type" => message_type.as_str()
                )
                .increment(1);
                RateLimitError { level, reason }
            })
    }

    fn group_bucket(&self, group: LimitGroup) -> Arc<TokenBucket> {
        Arc::clone(
            self.groups
                .entry(group)
                .or_insert_with(|| Arc::new(TokenBucket::new(self.config.group(group))))
                .value(),
        )
    }

    /// Linked correlation ids win over the blueprint of the message itself.
    fn operation_bucket(
        &self,
        blueprint: Option<&Arc<OperationBlueprint>>,
        correlation_id: Option<&str>,
    ) -> Option<Arc<TokenBucket>> {
        if let Some(id) = correlation_id {
            let linked = self.links.get(id).map(|entry| Arc::clone(entry.value()));
            if let Some(linked) = linked {
                let options = self.operation_options(&linked)?;
                return Some(Arc::clone(
                    self.correlations
                        .entry(id.to_owned())
                        .or_insert_with(|| Arc::new(TokenBucket::new(options)))
                        .value(),
                ));
            }
        }
        let blueprint = blueprint?;
        let options = self.operation_options(blueprint)?;
        Some(Arc::clone(
            self.operations
                .entry(blueprint.key().clone())
                .or_insert_with(|| Arc::new(TokenBucket::new(options)))
                .value(),
        ))
    }

    fn operation_options(&self, blueprint: &OperationBlueprint) -> Option<TokenBucketOptions> {
        blueprint
            .config()
            .rate_limit()
            .copied()
            .or_else(|| self.config.operation_default(blueprint.kind().into()))
    }

    /// Associates `correlation_id` with `blueprint` for operation-level limits.
    pub fn link(&self, correlation_id: &str, blueprint: Arc<OperationBlueprint>) {
        self.links.insert(correlation_id.to_owned(), blueprint);
    }

    /// Drops the link and the correlation's bucket.
    pub fn unlink(&self, correlation_id: &str) {
        self.links.remove(correlation_id);
        self.correlations.remove(correlation_id);
    }

    #[must_use]
    pub fn is_linked(&self, correlation_id: &str) -> bool {
        self.links.contains_key(correlation_id)
    }

    #[must_use]
    pub fn linked_count(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn operation_bucket_count(&self) -> usize {
        self.operations.len() + self.correlations.len()
    }
}

impl fmt::Debug for RateLimiterManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterManager")
            .field("enabled", &self.config.enabled)
            .field("groups", &self.groups.len())
            .field("operations", &self.operations.len())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::default_registry;

    fn generous() -> TokenBucketOptions {
        TokenBucketOptions::new(1000, Duration::from_secs(3600))
    }

    fn tight(limit: u32) -> TokenBucketOptions {
        TokenBucketOptions::new(limit, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn exempt_messages_bypass_every_level() {
        let manager = RateLimiterManager::new(Arc::new(RateLimitConfig::uniform(tight(0))));
        let cancel = CancellationToken::new();
        for exempt in [
            MessageType::ConnectionInit,
            MessageType::Pong,
            MessageType::StreamDataAck,
            MessageType::IngestDataAck,
        ] {
            assert!(manager.acquire(exempt, None, None, &cancel).await.is_ok());
        }
        let err = manager
            .acquire(MessageType::Ping, None, None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.level, LimitLevel::Global);
    }

    #[tokio::test]
    async fn levels_are_checked_in_order() {
        let config = RateLimitConfig {
            unary: tight(1),
            ..RateLimitConfig::uniform(generous())
        };
        let manager = RateLimiterManager::new(Arc::new(config));
        let cancel = CancellationToken::new();

        manager
            .acquire(MessageType::OperationInvoke, None, None, &cancel)
            .await
            .unwrap();
        let err = manager
            .acquire(MessageType::OperationInvoke, None, None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.level, LimitLevel::Group);
        assert_eq!(err.reason, AcquireError::QueueLimitExceeded);

        // Other groups are unaffected.
        assert!(manager
            .acquire(MessageType::Ping, None, None, &cancel)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn operation_level_prefers_the_blueprint_setting() {
        let registry = default_registry();
        // "limited" carries its own 1-token bucket.
        let limited = registry.resolve("calculator", "limited").unwrap();
        let answer = registry.resolve("calculator", "answer").unwrap();

        let manager = RateLimiterManager::new(Arc::new(RateLimitConfig::uniform(generous())));
        let cancel = CancellationToken::new();
        let invoke = MessageType::OperationInvoke;

        manager.acquire(invoke, Some(&limited), None, &cancel).await.unwrap();
        let err = manager
            .acquire(invoke, Some(&limited), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.level, LimitLevel::Operation);

        // A different operation has its own bucket.
        manager.acquire(invoke, Some(&answer), None, &cancel).await.unwrap();
        assert_eq!(manager.operation_bucket_count(), 2);
    }

    #[tokio::test]
    async fn linked_correlations_get_their_own_bucket() {
        let registry = default_registry();
        let limited = registry.resolve("calculator", "limited").unwrap();
        let manager = RateLimiterManager::new(Arc::new(RateLimitConfig::uniform(generous())));
        let cancel = CancellationToken::new();

        manager.link("s1", Arc::clone(&limited));
        manager.link("s2", Arc::clone(&limited));
        assert!(manager.is_linked("s1"));

        let data = MessageType::IngestData;
        manager.acquire(data, None, Some("s1"), &cancel).await.unwrap();
        assert!(manager.acquire(data, None, Some("s1"), &cancel).await.is_err());
        // Same blueprint, different flow.
        manager.acquire(data, None, Some("s2"), &cancel).await.unwrap();

        manager.unlink("s1");
        assert!(!manager.is_linked("s1"));
        // Unlinked ids fall back to the group level only.
        manager.acquire(data, None, Some("s1"), &cancel).await.unwrap();
        assert_eq!(manager.linked_count(), 1);
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::uniform(tight(0))
        };
        let manager = RateLimiterManager::new(Arc::new(config));
        let cancel = CancellationToken::new();
        assert!(manager
            .acquire(MessageType::OperationInvoke, None, None, &cancel)
            .await
            .is_ok());
    }
}
