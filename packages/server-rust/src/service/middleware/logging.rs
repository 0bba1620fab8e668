//! Logging middleware for operations.
//!
//! Wraps each execution in a `tracing` span and records duration and outcome
//! both on the span and through the `metrics` facade.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use super::pipeline::{Middleware, Next};
use crate::service::operation::{OperationContext, OperationError};

/// Instruments operations with timing and outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
        let contract = ctx.blueprint.contract_name().to_string();
        let operation = ctx.operation.clone();
        let kind = ctx.blueprint.kind().as_str();

        let span = info_span!(
            "operation",
            contract = %contract,
            operation = %operation,
            kind = kind,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = next.run(ctx).await;
            let elapsed = start.elapsed();

            let outcome = match (&result, ctx.is_failed()) {
                (Err(_), _) => "error",
                (Ok(()), true) => "failed",
                (Ok(()), false) => "ok",
            };

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = elapsed.as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);

            metrics::counter!(
                "tether_operations_total",
                "contract" => contract.clone(),
                "operation" => operation.clone(),
                "outcome" => outcome
            )
            .increment(1);
            metrics::histogram!(
                "tether_operation_duration_seconds",
                "contract" => contract,
                "operation" => operation
            )
            .record(elapsed.as_secs_f64());

            tracing::debug!(duration_ms, outcome, "operation complete");
            result
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
