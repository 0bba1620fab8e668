//! Outermost stage: turns escaped errors into structured failures.

use async_trait::async_trait;
use tracing::error;

use super::pipeline::{Middleware, Next};
use crate::service::operation::{Failure, OperationContext, OperationError};

/// Catches every error raised by inner stages and records it as the
/// operation's failure result, so nothing escapes the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionMiddleware {
    detailed_errors: bool,
}

impl ExceptionMiddleware {
    /// With `detailed_errors`, internal error messages reach the caller.
    #[must_use]
    pub fn new(detailed_errors: bool) -> Self {
        Self { detailed_errors }
    }
}

#[async_trait]
impl Middleware for ExceptionMiddleware {
    fn name(&self) -> &'static str {
        "exception"
    }

    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
        if let Err(err) = next.run(ctx).await {
            error!(
                contract = ctx.blueprint.contract_name(),
                operation = %ctx.operation,
                code = err.code(),
                error = %err,
                "operation failed"
            );
            let failure = Failure::from_error(&err, self.detailed_errors);
            ctx.record_failure(err, failure);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::service::middleware::{MiddlewareCategory, PipelineBuilder};
    use crate::service::operation::OperationResult;
    use crate::test_support::{context_for, registry_with};

    /// Fails with an internal error from whatever position it is placed at.
    struct Exploding;

    #[async_trait]
    impl Middleware for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        async fn invoke(&self, _ctx: &mut OperationContext, _next: Next<'_>) -> Result<(), OperationError> {
            Err(OperationError::internal("secret stack detail"))
        }
    }

    struct NeverCalled;

    #[async_trait]
    impl Middleware for NeverCalled {
        fn name(&self) -> &'static str {
            "never"
        }

        async fn invoke(&self, _ctx: &mut OperationContext, _next: Next<'_>) -> Result<(), OperationError> {
            panic!("routing must be short-circuited");
        }
    }

    async fn run_with(category: MiddlewareCategory, detailed: bool) -> OperationResult {
        let builder = PipelineBuilder::new()
            .with(MiddlewareCategory::Exception, Arc::new(ExceptionMiddleware::new(detailed)))
            .with(category, Arc::new(Exploding));
        let registry = registry_with(builder);
        let blueprint = registry.resolve("calculator", "answer").unwrap();
        let mut ctx = context_for(&blueprint, vec![]);

        blueprint
            .pipeline()
            .execute(&mut ctx, &NeverCalled)
            .await
            .expect("exception middleware swallows errors");
        assert!(ctx.error.is_some());
        ctx.result.unwrap()
    }

    #[tokio::test]
    async fn errors_from_any_inner_category_become_failures() {
        for category in [
            MiddlewareCategory::Logging,
            MiddlewareCategory::Authentication,
            MiddlewareCategory::PreRouting,
        ] {
            match run_with(category, false).await {
                OperationResult::Failed(failure) => {
                    assert_eq!(failure.code, "internal");
                    assert_eq!(failure.message, "internal server error");
                }
                OperationResult::Completed(_) => panic!("expected a failure"),
            }
        }
    }

    #[tokio::test]
    async fn detailed_errors_expose_the_message() {
        match run_with(MiddlewareCategory::PreRouting, true).await {
            OperationResult::Failed(failure) => assert!(failure.message.contains("secret stack detail")),
            OperationResult::Completed(_) => panic!("expected a failure"),
        }
    }
}
