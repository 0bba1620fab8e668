//! Entry points that resolve, execute and shape one operation request.
//!
//! Each entry point resolves the blueprint for the expected operation kind,
//! reconciles the encoded arguments, runs the blueprint's pipeline around the
//! kind's routing stage and converts the context's result into the shape the
//! transport sends back.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tether_core::{DynamicConverter, Element, EncodedArg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::args::{ArgSlot, Args};
use super::blueprint::{Invoker, OperationBlueprint};
use super::config::ServerConfig;
use super::ingest::StreamSource;
use super::middleware::{Middleware, Next};
use super::operation::{
    ElementStream, OperationContext, OperationError, OperationKind, OperationRequest,
    OperationResult, Produced, ResponseEnvelope, TransportContext,
};
use super::provider::ServiceProvider;
use super::registry::OperationRegistry;
use crate::subscription::{
    EventSink, LeasedStream, LiveSubscriptionRegistry, Observer, SubscriptionDescriptor,
    SubscriptionKey, SubscriptionLease,
};

/// A long-lived request that could not be started.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub envelope: ResponseEnvelope,
    /// The transport should close the connection after reporting the failure.
    pub close_connection: bool,
}

impl Rejection {
    /// Authentication and authorization failures close the connection.
    fn new(envelope: ResponseEnvelope) -> Self {
        let close_connection = matches!(envelope.code, Some("unauthorized" | "forbidden"));
        Self {
            envelope,
            close_connection,
        }
    }

    /// Stable error code carried by the envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.envelope.code.unwrap_or("internal")
    }

    /// Message carried by the envelope.
    #[must_use]
    pub fn message(&self) -> &str {
        self.envelope.error.as_deref().unwrap_or_default()
    }
}

/// Dispatches operation requests against the registry.
pub struct RequestHandler {
    registry: Arc<OperationRegistry>,
    services: Arc<ServiceProvider>,
    subscriptions: Arc<LiveSubscriptionRegistry>,
    converter: DynamicConverter,
    detailed_errors: bool,
}

impl RequestHandler {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        services: Arc<ServiceProvider>,
        subscriptions: Arc<LiveSubscriptionRegistry>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            services,
            subscriptions,
            converter: DynamicConverter::new(),
            detailed_errors: config.detailed_errors,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn services(&self) -> &Arc<ServiceProvider> {
        &self.services
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<LiveSubscriptionRegistry> {
        &self.subscriptions
    }

    #[must_use]
    pub fn detailed_errors(&self) -> bool {
        self.detailed_errors
    }

    /// Looks up the blueprint addressed by `request`.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::NotFound` if no operation of kind `kind` is
    /// registered under the requested name.
    pub fn resolve(
        &self,
        request: &OperationRequest,
        kind: OperationKind,
    ) -> Result<Arc<OperationBlueprint>, OperationError> {
        self.registry
            .resolve(&request.contract, &request.operation)
            .filter(|blueprint| blueprint.kind() == kind)
            .ok_or_else(|| OperationError::NotFound {
                contract: request.contract.clone(),
                operation: request.operation.clone(),
            })
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Executes a unary method.
    pub async fn invoke_method(
        &self,
        request: OperationRequest,
        transport: Option<TransportContext>,
        cancel: CancellationToken,
    ) -> ResponseEnvelope {
        let blueprint = match self.resolve(&request, OperationKind::Method) {
            Ok(blueprint) => blueprint,
            Err(err) => return self.envelope_for(&err),
        };
        let slots = self
            .converter
            .deserialize_args(blueprint.params(), request.args.clone())
            .into_iter()
            .map(ArgSlot::from_encoded)
            .collect();
        self.run_unary(blueprint, request, slots, transport, cancel).await
    }

    /// Starts a server stream. The returned sequence is lazy and ends early
    /// once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] if the stream could not be started.
    pub async fn invoke_stream(
        &self,
        request: OperationRequest,
        transport: Option<TransportContext>,
        cancel: CancellationToken,
    ) -> Result<ElementStream, Rejection> {
        let blueprint = self.resolve_long_lived(&request, OperationKind::Stream, transport.as_ref())?;
        let slots = self
            .converter
            .deserialize_args(blueprint.params(), request.args.clone())
            .into_iter()
            .map(ArgSlot::from_encoded)
            .collect();
        let args = Args::new(slots, self.converter, cancel.clone());
        let mut ctx = self
            .context(Arc::clone(&blueprint), request, transport, cancel.clone())
            .with_arguments(args);

        if let Err(err) = blueprint.pipeline().execute(&mut ctx, &InvokeStage).await {
            return Err(Rejection::new(self.escaped(&blueprint, &err)));
        }
        let elements = self.stream_result(&mut ctx)?;
        Ok(elements
            .take_until(async move { cancel.cancelled().await })
            .boxed())
    }

    /// Attaches to a subscription source. Dropping the returned sequence
    /// detaches the subscriber.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] if the subscription could not be started.
    /// Unauthenticated or forbidden callers are rejected with a
    /// close-connection instruction.
    pub async fn subscribe(
        &self,
        request: OperationRequest,
        transport: Option<TransportContext>,
        cancel: CancellationToken,
    ) -> Result<ElementStream, Rejection> {
        let blueprint =
            self.resolve_long_lived(&request, OperationKind::Subscription, transport.as_ref())?;
        let mut ctx = self.context(Arc::clone(&blueprint), request, transport, cancel);
        let stage = SubscribeStage {
            subscriptions: Arc::clone(&self.subscriptions),
            converter: self.converter,
        };

        if let Err(err) = blueprint.pipeline().execute(&mut ctx, &stage).await {
            return Err(Rejection::new(self.escaped(&blueprint, &err)));
        }
        self.stream_result(&mut ctx)
    }

    /// Executes an ingest operation, substituting open client streams for
    /// the correlation ids in its sequence parameters.
    ///
    /// Unknown or already taken stream ids leave the parameter absent.
    pub async fn invoke_ingest(
        &self,
        request: OperationRequest,
        streams: &dyn StreamSource,
        transport: Option<TransportContext>,
        cancel: CancellationToken,
    ) -> ResponseEnvelope {
        let blueprint = match self.resolve(&request, OperationKind::Ingest) {
            Ok(blueprint) => blueprint,
            Err(err) => return self.envelope_for(&err),
        };

        let declared = blueprint.params().len();
        let trailing = blueprint.trailing_cancellation_count();
        if request.args.len() + trailing != declared {
            return self.envelope_for(&OperationError::ParameterCountMismatch {
                expected: declared - trailing,
                actual: request.args.len(),
            });
        }

        let slots = self
            .converter
            .deserialize_args(blueprint.params(), request.args.clone())
            .into_iter()
            .map(|arg| match arg {
                EncodedArg::StreamId(Some(id)) => match streams.take_stream(&id) {
                    Some(stream) => ArgSlot::Stream(stream),
                    None => {
                        debug!(stream_id = %id, "no open stream for ingest argument");
                        ArgSlot::Absent
                    }
                },
                other => ArgSlot::from_encoded(other),
            })
            .collect();
        self.run_unary(blueprint, request, slots, transport, cancel).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn context(
        &self,
        blueprint: Arc<OperationBlueprint>,
        request: OperationRequest,
        transport: Option<TransportContext>,
        cancel: CancellationToken,
    ) -> OperationContext {
        OperationContext::new(blueprint, request, Arc::clone(&self.services), transport, cancel)
            .with_detailed_errors(self.detailed_errors)
    }

    fn resolve_long_lived(
        &self,
        request: &OperationRequest,
        kind: OperationKind,
        transport: Option<&TransportContext>,
    ) -> Result<Arc<OperationBlueprint>, Rejection> {
        let blueprint = self
            .resolve(request, kind)
            .map_err(|err| Rejection::new(self.envelope_for(&err)))?;
        let authenticated = transport.is_some_and(TransportContext::is_authenticated);
        if blueprint.requires_authorization() && !authenticated {
            warn!(
                operation = %blueprint.key(),
                kind = kind.as_str(),
                "unauthenticated caller rejected"
            );
            return Err(Rejection::new(self.envelope_for(&OperationError::Unauthorized)));
        }
        Ok(blueprint)
    }

    async fn run_unary(
        &self,
        blueprint: Arc<OperationBlueprint>,
        request: OperationRequest,
        slots: Vec<ArgSlot>,
        transport: Option<TransportContext>,
        cancel: CancellationToken,
    ) -> ResponseEnvelope {
        let args = Args::new(slots, self.converter, cancel.clone());
        let mut ctx = self
            .context(Arc::clone(&blueprint), request, transport, cancel)
            .with_arguments(args);

        if let Err(err) = blueprint.pipeline().execute(&mut ctx, &InvokeStage).await {
            return self.escaped(&blueprint, &err);
        }
        match ctx.result.take() {
            Some(OperationResult::Completed(Produced::Unit)) => ResponseEnvelope::unit(),
            Some(OperationResult::Completed(Produced::Value(value))) => {
                match value.encode(&self.converter) {
                    Ok(element) => ResponseEnvelope::ok(element),
                    Err(err) => self.envelope_for(&OperationError::encode(&err)),
                }
            }
            Some(OperationResult::Completed(Produced::Stream(_))) => {
                self.envelope_for(&OperationError::internal("unary operation produced a stream"))
            }
            Some(OperationResult::Failed(failure)) => ResponseEnvelope::failure(&failure),
            None => self.envelope_for(&OperationError::internal("operation produced no result")),
        }
    }

    fn stream_result(&self, ctx: &mut OperationContext) -> Result<ElementStream, Rejection> {
        match ctx.result.take() {
            Some(OperationResult::Completed(Produced::Stream(elements))) => Ok(elements),
            Some(OperationResult::Failed(failure)) => {
                Err(Rejection::new(ResponseEnvelope::failure(&failure)))
            }
            Some(OperationResult::Completed(_)) => Err(Rejection::new(self.envelope_for(
                &OperationError::internal("streaming operation produced a single value"),
            ))),
            None => Err(Rejection::new(
                self.envelope_for(&OperationError::internal("operation produced no result")),
            )),
        }
    }

    /// An error left the pipeline; only possible without an exception stage.
    fn escaped(&self, blueprint: &OperationBlueprint, err: &OperationError) -> ResponseEnvelope {
        warn!(operation = %blueprint.key(), error = %err, "error escaped the pipeline");
        self.envelope_for(err)
    }

    fn envelope_for(&self, err: &OperationError) -> ResponseEnvelope {
        ResponseEnvelope::from_error(err, self.detailed_errors)
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("contracts", &self.registry.contract_count())
            .field("subscriptions", &self.subscriptions.len())
            .field("detailed_errors", &self.detailed_errors)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Routing stages
// ---------------------------------------------------------------------------

/// Calls the bound method, stream or ingest delegate.
struct InvokeStage;

#[async_trait]
impl Middleware for InvokeStage {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
        let Invoker::Call(invoke) = ctx.blueprint.invoker() else {
            return Err(OperationError::internal("operation has no call delegate"));
        };
        let invoke = Arc::clone(invoke);
        let instance = ctx
            .services
            .resolve(ctx.blueprint.contract_type())
            .ok_or(OperationError::ServiceUnavailable {
                type_name: ctx.blueprint.contract_type_name(),
            })?;
        let args = ctx
            .take_arguments()
            .ok_or_else(|| OperationError::internal("arguments were already consumed"))?;

        let cancel = ctx.cancellation.clone();
        let produced = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(OperationError::Cancelled),
            produced = invoke(instance, args) => produced?,
        };
        ctx.complete(produced);
        next.run(ctx).await
    }
}

/// Attaches the caller to the shared subscription source.
struct SubscribeStage {
    subscriptions: Arc<LiveSubscriptionRegistry>,
    converter: DynamicConverter,
}

#[async_trait]
impl Middleware for SubscribeStage {
    fn name(&self) -> &'static str {
        "routing"
    }

    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
        let blueprint = Arc::clone(&ctx.blueprint);
        let Invoker::Subscribe(subscribe) = blueprint.invoker() else {
            return Err(OperationError::internal("operation has no subscribe delegate"));
        };

        let client_id = if blueprint.requires_authorization() {
            ctx.principal().map(|p| p.id.clone()).unwrap_or_default()
        } else {
            String::new()
        };
        let key = SubscriptionKey::new(client_id, blueprint.contract_name(), blueprint.operation_name());

        let observer = Arc::new(Observer::<Element>::new());
        let events = observer
            .take_stream()
            .ok_or_else(|| OperationError::internal("observer stream already taken"))?;
        let services = Arc::clone(&ctx.services);
        let (descriptor, handler) = self.subscriptions.attach(
            &key,
            || {
                let instance = services.resolve(blueprint.contract_type()).ok_or(
                    OperationError::ServiceUnavailable {
                        type_name: blueprint.contract_type_name(),
                    },
                )?;
                let source = subscribe(&instance)?;
                Ok(SubscriptionDescriptor::new(
                    key.clone(),
                    source,
                    blueprint.authorization().clone(),
                ))
            },
            EventSink::new(observer, self.converter),
        )?;
        debug!(subscription = %key, handlers = descriptor.handler_count(), "subscriber attached");

        let lease = SubscriptionLease::new(Arc::clone(&self.subscriptions), descriptor, handler);
        let cancel = ctx.cancellation.clone();
        let elements = LeasedStream::new(events.map(Ok::<Element, OperationError>), lease)
            .take_until(async move { cancel.cancelled().await })
            .boxed();
        ctx.complete(Produced::Stream(elements));
        next.run(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
