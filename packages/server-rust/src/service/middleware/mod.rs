//! Middleware stages for the operation pipeline.
//!
//! - [`exception`]: Converts escaped errors into structured failures
//! - [`logging`]: Operation spans, timing and counters
//! - [`auth`]: Role and policy checks for protected operations
//! - [`timeout`]: Per-operation timeout enforcement
//! - [`pipeline`]: Category ordering and per-blueprint composition

pub mod auth;
pub mod exception;
pub mod logging;
pub mod pipeline;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

pub use auth::AuthorizationMiddleware;
pub use exception::ExceptionMiddleware;
pub use logging::LoggingMiddleware;
pub use pipeline::{Middleware, MiddlewareCategory, Next, Pipeline, PipelineBuilder};
pub use timeout::TimeoutMiddleware;

use crate::service::config::ServerConfig;

/// The built-in stages, configured from `config`.
///
/// Order, outermost to innermost:
/// 1. `ExceptionMiddleware`: nothing escapes past this point
/// 2. `LoggingMiddleware`: span, duration and outcome
/// 3. `AuthorizationMiddleware`: protected operations only
/// 4. `TimeoutMiddleware`: unary and ingest operations only
#[must_use]
pub fn default_pipeline(config: &ServerConfig) -> PipelineBuilder {
    PipelineBuilder::new()
        .with(
            MiddlewareCategory::Exception,
            Arc::new(ExceptionMiddleware::new(config.detailed_errors)),
        )
        .with(MiddlewareCategory::Logging, Arc::new(LoggingMiddleware))
        .with(MiddlewareCategory::Authentication, Arc::new(AuthorizationMiddleware))
        .with(
            MiddlewareCategory::PreRouting,
            Arc::new(TimeoutMiddleware::new(Duration::from_millis(
                config.default_operation_timeout_ms,
            ))),
        )
}
