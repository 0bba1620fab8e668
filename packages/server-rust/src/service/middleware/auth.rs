//! Authorization middleware.
//!
//! Included only in pipelines of operations that require authorization.
//! Compares the caller's principal with the roles and policies precomputed
//! on the blueprint.

use async_trait::async_trait;
use tracing::debug;

use super::pipeline::{Middleware, Next};
use crate::service::blueprint::OperationBlueprint;
use crate::service::operation::{OperationContext, OperationError};

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizationMiddleware;

#[async_trait]
impl Middleware for AuthorizationMiddleware {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn applies_to(&self, blueprint: &OperationBlueprint) -> bool {
        blueprint.requires_authorization()
    }

    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
        let verdict = ctx.blueprint.authorization().check(ctx.principal());
        match verdict {
            Ok(()) => next.run(ctx).await,
            Err(err) => {
                debug!(
                    contract = ctx.blueprint.contract_name(),
                    operation = %ctx.operation,
                    code = err.code(),
                    "caller rejected"
                );
                ctx.fail(err);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
