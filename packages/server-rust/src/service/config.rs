use crate::network::ConnectionConfig;
use crate::ratelimit::RateLimitConfig;
use crate::telemetry::LoggingConfig;

/// Server-level configuration for the dispatch core.
///
/// Controls error detail, operation timeouts, rate limits and per-connection
/// resources.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Include internal error messages in responses. Development only.
    pub detailed_errors: bool,
    /// Default timeout for unary and ingest operations in milliseconds.
    pub default_operation_timeout_ms: u64,
    pub rate_limits: RateLimitConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            detailed_errors: false,
            default_operation_timeout_ms: 30_000,
            rate_limits: RateLimitConfig::default(),
            connection: ConnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
