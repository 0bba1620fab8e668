//! Timeout middleware for operations.
//!
//! Fails unary and ingest operations that exceed their timeout with
//! `OperationError::Timeout`. The timeout comes from the operation's own
//! configuration when set, else from the server default.

use std::time::Duration;

use async_trait::async_trait;
use tether_core::OperationKind;

use super::pipeline::{Middleware, Next};
use crate::service::blueprint::OperationBlueprint;
use crate::service::operation::{OperationContext, OperationError};

#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    default: Duration,
}

impl TimeoutMiddleware {
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self { default }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
    }

    /// Streams and subscriptions are long-lived and end on cancellation.
    fn applies_to(&self, blueprint: &OperationBlueprint) -> bool {
        matches!(blueprint.kind(), OperationKind::Method | OperationKind::Ingest)
    }

    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
        let duration = ctx.blueprint.config().timeout().unwrap_or(self.default);
        let outcome = tokio::time::timeout(duration, next.run(ctx)).await;
        match outcome {
            Ok(result) => result,
            Err(_elapsed) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = duration.as_millis() as u64;
                ctx.fail(OperationError::Timeout { timeout_ms });
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::service::middleware::{MiddlewareCategory, PipelineBuilder};
    use crate::service::operation::{OperationResult, Produced};
    use crate::test_support::{context_for, registry_with};

    /// Routing stage that takes a configurable delay before completing.
    struct SlowRouting {
        delay: Duration,
    }

    #[async_trait]
    impl Middleware for SlowRouting {
        fn name(&self) -> &'static str {
            "routing"
        }

        async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
            tokio::time::sleep(self.delay).await;
            ctx.complete(Produced::Unit);
            next.run(ctx).await
        }
    }

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new().with(
            MiddlewareCategory::PreRouting,
            Arc::new(TimeoutMiddleware::new(Duration::from_millis(1000))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_timeout() {
        let registry = registry_with(builder());
        let blueprint = registry.resolve("calculator", "answer").unwrap();
        let mut ctx = context_for(&blueprint, vec![]);

        let routing = SlowRouting {
            delay: Duration::from_millis(10),
        };
        blueprint.pipeline().execute(&mut ctx, &routing).await.unwrap();
        assert!(matches!(ctx.result, Some(OperationResult::Completed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn per_operation_timeout_overrides_the_default() {
        let registry = registry_with(builder());
        // "slow" is configured with a 50ms timeout.
        let blueprint = registry.resolve("calculator", "slow").unwrap();
        let mut ctx = context_for(&blueprint, vec![]);

        let routing = SlowRouting {
            delay: Duration::from_millis(200),
        };
        blueprint.pipeline().execute(&mut ctx, &routing).await.unwrap();
        assert!(matches!(ctx.error, Some(OperationError::Timeout { timeout_ms: 50 })));
    }

    #[test]
    fn long_lived_kinds_are_exempt() {
        let registry = registry_with(builder());
        assert!(registry.resolve("calculator", "count_to").unwrap().pipeline().is_empty());
        assert!(registry.resolve("calculator", "ticks").unwrap().pipeline().is_empty());
        assert_eq!(registry.resolve("calculator", "sum_lines").unwrap().pipeline().len(), 1);
    }
}
