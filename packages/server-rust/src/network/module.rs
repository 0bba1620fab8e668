//! Assembly of the dispatch core.
//!
//! [`RpcModule`] owns the shared state every transport needs: the operation
//! registry, service instances, live subscriptions, open connections and the
//! shutdown controller. Transports call [`RpcModule::open_session`] per
//! accepted connection and forward decoded frames to the returned session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::connection::{ConnectionRegistry, OutboundMessage};
use super::http::HttpInvoker;
use super::session::Session;
use super::shutdown::ShutdownController;
use crate::service::contract::Contract;
use crate::service::handler::RequestHandler;
use crate::service::middleware::default_pipeline;
use crate::service::provider::{IdentityAccessor, ServiceProvider};
use crate::service::registry::{OperationRegistry, RegistryError};
use crate::service::ServerConfig;
use crate::subscription::LiveSubscriptionRegistry;

pub struct RpcModule {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl RpcModule {
    /// Creates the module with the default middleware pipeline.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(OperationRegistry::new(default_pipeline(&config)));
        Self::with_registry(config, registry)
    }

    /// Creates the module around a registry built with a custom pipeline.
    #[must_use]
    pub fn with_registry(config: ServerConfig, registry: Arc<OperationRegistry>) -> Self {
        let handler = Arc::new(RequestHandler::new(
            registry,
            Arc::new(ServiceProvider::new()),
            Arc::new(LiveSubscriptionRegistry::new()),
            &config,
        ));
        Self {
            config,
            handler,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Registers contract `C` and the instance that serves it.
    ///
    /// # Errors
    ///
    /// Returns the registry's error if `C` describes an unsupported member.
    pub fn register_contract<C: Contract>(&self, instance: Arc<C>) -> Result<usize, RegistryError> {
        let count = self.handler.registry().register::<C>()?;
        self.handler.services().register(instance);
        info!(contract = C::NAME, operations = count, "contract registered");
        Ok(count)
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn handler(&self) -> Arc<RequestHandler> {
        Arc::clone(&self.handler)
    }

    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Marks the module ready to accept traffic.
    pub fn set_ready(&self) {
        self.shutdown.set_ready();
    }

    /// Registers a new connection and returns its session together with the
    /// receiver the transport's write loop drains.
    #[must_use]
    pub fn open_session(
        &self,
        identity: Arc<dyn IdentityAccessor>,
    ) -> (Arc<Session>, mpsc::Receiver<OutboundMessage>) {
        let (connection, outbound) = self.connections.register(&self.config.connection);
        let session = Session::new(
            connection,
            Arc::clone(&self.handler),
            identity,
            Arc::clone(&self.shutdown),
            &self.config,
        );
        info!(session = %session.id(), connection = session.connection().id.0, "session opened");
        (session, outbound)
    }

    /// Closes `session` and forgets its connection.
    pub fn close_session(&self, session: &Session) {
        session.close();
        self.connections.remove(session.connection().id);
    }

    /// Tower service exposing unary methods over HTTP.
    #[must_use]
    pub fn http_invoker(&self) -> HttpInvoker {
        HttpInvoker::new(Arc::clone(&self.handler))
    }

    /// Stops admitting operations, asks every connection to close and waits
    /// up to `timeout` for running operations. Returns `true` if everything
    /// drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.trigger_shutdown();

        let handles = self.connections.drain_all();
        if !handles.is_empty() {
            info!(connections = handles.len(), "draining connections");
        }
        for handle in &handles {
            handle.close(Some("server shutting down".to_string()));
        }

        let drained = self.shutdown.wait_for_drain(timeout).await;
        if drained {
            info!("all operations drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with operations still running"
            );
        }
        drained
    }
}

impl std::fmt::Debug for RpcModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcModule")
            .field("contracts", &self.handler.registry().contract_count())
            .field("connections", &self.connections.count())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}
