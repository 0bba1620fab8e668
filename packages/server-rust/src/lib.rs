//! Tether server: contract registry, middleware pipeline, rate limiting,
//! live subscriptions and the per-connection session adapter.

pub mod network;
pub mod ratelimit;
pub mod service;
pub mod subscription;
pub mod telemetry;

pub use network::{HttpInvoker, RpcModule, Session};
pub use service::{Contract, ContractBuilder, OperationError, RequestHandler, ServerConfig};
pub use subscription::Subscription;

#[cfg(test)]
mod test_support;
