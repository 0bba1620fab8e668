//! Transport-facing side of the dispatch core.
//!
//! - [`session`]: Per-connection protocol adapter
//! - [`connection`]: Outbound channels and the connection registry
//! - [`http`]: Unary methods as a tower HTTP service
//! - [`module`]: Wiring of registry, handler, sessions and shutdown
//! - [`shutdown`]: Health state and in-flight drain

pub mod config;
pub mod connection;
pub mod http;
pub mod module;
pub mod session;
pub mod shutdown;

pub use config::ConnectionConfig;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundMessage, SendError};
pub use http::{HttpInvoker, HttpRoute};
pub use module::RpcModule;
pub use session::Session;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
