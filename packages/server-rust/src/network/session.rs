//! Per-connection protocol adapter.
//!
//! A [`Session`] turns inbound [`Message`]s into handler calls and queues the
//! replies on the connection's outbound channel. It owns everything scoped to
//! one connection: the rate limiter, the client streams of ingest
//! operations, the active correlation ids and the pending acknowledgements.
//!
//! Rate-limited messages pass through a per-session admission queue drained
//! by one task in arrival order. Exempt messages (acks, `connection_init`)
//! are handled inline and never wait behind a throttled message.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use tether_core::messages::{
    self, CorrelationPayload, DataPayload, ErrorPayload, IngestInitPayload, InvokePayload,
};
use tether_core::{Element, Message, OperationKind};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::ConnectionConfig;
use super::connection::ConnectionHandle;
use super::shutdown::ShutdownController;
use crate::ratelimit::{AcquireError, LimitLevel, RateLimitError, RateLimiterManager};
use crate::service::blueprint::OperationBlueprint;
use crate::service::handler::RequestHandler;
use crate::service::ingest::IngestStreamRegistry;
use crate::service::operation::{
    ElementStream, OperationError, OperationRequest, ResponseEnvelope, TransportContext,
};
use crate::service::provider::IdentityAccessor;
use crate::service::ServerConfig;

/// Protocol state of one client connection.
pub struct Session {
    id: Uuid,
    connection: Arc<ConnectionHandle>,
    handler: Arc<RequestHandler>,
    limiter: RateLimiterManager,
    ingest: Arc<IngestStreamRegistry>,
    identity: Arc<dyn IdentityAccessor>,
    shutdown: Arc<ShutdownController>,
    client_id: ArcSwapOption<String>,
    active: DashMap<String, CancellationToken>,
    acks: DashMap<String, Arc<Notify>>,
    closed: CancellationToken,
    admission: mpsc::Sender<Message>,
    config: ConnectionConfig,
}

impl Session {
    /// Creates the session and spawns its admission task on the current
    /// Tokio runtime.
    #[must_use]
    pub fn new(
        connection: Arc<ConnectionHandle>,
        handler: Arc<RequestHandler>,
        identity: Arc<dyn IdentityAccessor>,
        shutdown: Arc<ShutdownController>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        let (admission, queued) = mpsc::channel(config.connection.admission_queue_capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            connection,
            handler,
            limiter: RateLimiterManager::new(Arc::new(config.rate_limits.clone())),
            ingest: Arc::new(IngestStreamRegistry::new()),
            identity,
            closed: shutdown.token().child_token(),
            shutdown,
            client_id: ArcSwapOption::empty(),
            active: DashMap::new(),
            acks: DashMap::new(),
            admission,
            config: config.connection.clone(),
        });
        tokio::spawn(Self::drain_admissions(
            Arc::downgrade(&session),
            queued,
            session.closed.clone(),
        ));
        session
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    /// Client id announced in `connection_init`, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<Arc<String>> {
        self.client_id.load_full()
    }

    /// Number of operations currently running on this session.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Cancels every running operation and drops open client streams.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.active.clear();
        self.acks.clear();
        self.ingest.clear();
        debug!(session = %self.id, "session closed");
    }

    /// Decodes and handles one binary frame.
    pub async fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        match messages::decode(frame) {
            Ok(message) => self.handle(message).await,
            Err(err) => {
                debug!(session = %self.id, error = %err, "undecodable frame");
                self.send_error(None, "invalid_message", &err.to_string()).await;
            }
        }
    }

    /// Handles one inbound message.
    ///
    /// Exempt messages are dispatched before this returns. Rate-limited ones
    /// are queued for admission and dispatched in arrival order; a full
    /// queue rejects the message as rate limited. Operations run on their
    /// own tasks and reply through the outbound channel.
    pub async fn handle(self: &Arc<Self>, message: Message) {
        if self.is_closed() {
            return;
        }
        let message_type = message.message_type();
        debug!(session = %self.id, message_type = message_type.as_str(), "inbound message");

        if message_type.limit_group().is_none() {
            self.dispatch(message).await;
            return;
        }
        match self.admission.try_send(message) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(message)) => {
                let err = RateLimitError {
                    level: LimitLevel::Global,
                    reason: AcquireError::QueueLimitExceeded,
                };
                warn!(session = %self.id, message_type = message_type.as_str(), "admission queue full");
                self.reject_limited(&message, err).await;
            }
        }
    }

    async fn drain_admissions(
        session: Weak<Self>,
        mut queued: mpsc::Receiver<Message>,
        closed: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                () = closed.cancelled() => break,
                message = queued.recv() => message,
            };
            let (Some(message), Some(session)) = (message, session.upgrade()) else {
                break;
            };
            session.admit(message).await;
        }
    }

    /// Waits for the limiter, then dispatches.
    async fn admit(self: &Arc<Self>, message: Message) {
        let message_type = message.message_type();
        let blueprint = message
            .operation_target()
            .and_then(|(contract, operation)| self.handler.registry().resolve(contract, operation));
        let admitted = self
            .limiter
            .acquire(
                message_type,
                blueprint.as_ref(),
                message.correlation_id(),
                &self.closed,
            )
            .await;
        if let Err(err) = admitted {
            self.reject_limited(&message, err).await;
            return;
        }
        if message.operation_target().is_some() && !self.shutdown.is_accepting() {
            let id = message.correlation_id().map(str::to_owned);
            self.send_error(id, "unavailable", "server is shutting down").await;
            return;
        }
        self.dispatch(message).await;
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::ConnectionInit(payload) => {
                self.client_id.store(payload.client_id.map(Arc::new));
                self.send(Message::ConnectionAck).await;
            }
            Message::Ping => {
                self.send(Message::Pong).await;
            }
            Message::OperationInvoke(payload) => self.spawn_invoke(payload, true).await,
            Message::OperationCall(payload) => self.spawn_invoke(payload, false).await,
            Message::StreamInit(payload) => self.spawn_flow(OperationKind::Stream, payload).await,
            Message::SubscriptionInit(payload) => {
                self.spawn_flow(OperationKind::Subscription, payload).await;
            }
            Message::StreamComplete(payload) | Message::SubscriptionComplete(payload) => {
                if let Some(token) = self.active.get(&payload.id) {
                    token.cancel();
                }
            }
            Message::StreamDataAck(payload) => {
                if let Some(waiter) = self.acks.get(&payload.id) {
                    waiter.notify_one();
                }
            }
            Message::IngestInit(payload) => self.start_ingest(payload).await,
            Message::IngestData(payload) => {
                self.push(payload).await;
            }
            Message::IngestDataWithAck(payload) => {
                let id = payload.id.clone();
                if self.push(payload).await {
                    self.send(Message::IngestDataAck(CorrelationPayload::new(id))).await;
                }
            }
            Message::IngestComplete(payload) => {
                self.ingest.close(&payload.id);
                self.limiter.unlink(&payload.id);
            }
            other => {
                warn!(
                    session = %self.id,
                    message_type = other.message_type().as_str(),
                    "server-bound peer sent a server-to-client message"
                );
                let id = other.correlation_id().map(str::to_owned);
                self.send_error(id, "unexpected_message", "message type is not accepted by the server")
                    .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Unary
    // -----------------------------------------------------------------------

    async fn spawn_invoke(self: &Arc<Self>, payload: InvokePayload, reply: bool) {
        let id = payload.id.clone();
        let Some(cancel) = self.begin(&id) else {
            self.reject_duplicate(id).await;
            return;
        };
        let guard = self.shutdown.in_flight_guard();
        let session = Arc::clone(self);
        let transport = self.transport_context();
        tokio::spawn(async move {
            let _guard = guard;
            let envelope = session
                .handler
                .invoke_method(OperationRequest::from(payload), Some(transport), cancel)
                .await;
            session.finish(&id);
            if reply {
                session
                    .send(Message::OperationResponse(envelope.into_payload(id)))
                    .await;
            } else if !envelope.success {
                debug!(call_id = %id, error = ?envelope.error, "fire-and-forget call failed");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Streams and subscriptions
    // -----------------------------------------------------------------------

    async fn spawn_flow(self: &Arc<Self>, kind: OperationKind, payload: InvokePayload) {
        let id = payload.id.clone();
        let Some(cancel) = self.begin(&id) else {
            self.reject_duplicate(id).await;
            return;
        };
        let guard = self.shutdown.in_flight_guard();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            session.run_flow(kind, payload, cancel).await;
            session.finish(&id);
        });
    }

    async fn run_flow(&self, kind: OperationKind, payload: InvokePayload, cancel: CancellationToken) {
        let id = payload.id.clone();
        let request = OperationRequest::from(payload);
        let blueprint = self
            .handler
            .registry()
            .resolve(&request.contract, &request.operation);
        let transport = Some(self.transport_context());
        let started = if kind == OperationKind::Stream {
            self.handler.invoke_stream(request, transport, cancel.clone()).await
        } else {
            self.handler.subscribe(request, transport, cancel.clone()).await
        };

        let elements = match started {
            Ok(elements) => elements,
            Err(rejection) => {
                self.send_error(Some(id), rejection.code(), rejection.message()).await;
                if rejection.close_connection {
                    self.connection.close(Some(rejection.message().to_string()));
                    self.close();
                }
                return;
            }
        };

        if let Some(blueprint) = &blueprint {
            self.limiter.link(&id, Arc::clone(blueprint));
        }
        self.pump(kind, &id, elements, blueprint.as_deref(), &cancel).await;
        self.limiter.unlink(&id);

        let done = CorrelationPayload::new(id);
        let complete = if kind == OperationKind::Stream {
            Message::StreamComplete(done)
        } else {
            Message::SubscriptionComplete(done)
        };
        self.send(complete).await;
    }

    /// Forwards elements as `*_data` messages until the sequence ends, the
    /// flow is cancelled or the connection goes away.
    async fn pump(
        &self,
        kind: OperationKind,
        id: &str,
        mut elements: ElementStream,
        blueprint: Option<&OperationBlueprint>,
        cancel: &CancellationToken,
    ) {
        let ack_interval = blueprint
            .and_then(|b| b.config().ack_interval())
            .filter(|interval| *interval > 0);
        let throttle = blueprint.and_then(|b| b.config().throttle());
        let waiter = ack_interval.map(|_| {
            let waiter = Arc::new(Notify::new());
            self.acks.insert(id.to_owned(), Arc::clone(&waiter));
            waiter
        });

        let mut sent: u32 = 0;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = elements.next() => next,
            };
            let data = match next {
                None => break,
                Some(Ok(data)) => data,
                Some(Err(err)) => {
                    warn!(flow = id, error = %err, "element sequence failed");
                    let message = err.public_message(self.handler.detailed_errors());
                    self.send_error(Some(id.to_owned()), err.code(), &message).await;
                    break;
                }
            };

            sent = sent.wrapping_add(1);
            let wants_ack = ack_interval.is_some_and(|interval| sent % interval == 0);
            if !self.send(data_message(kind, id, data, wants_ack)).await {
                break;
            }
            if let (true, Some(waiter)) = (wants_ack, &waiter) {
                let acked = tokio::select! {
                    biased;
                    () = cancel.cancelled() => false,
                    acked = tokio::time::timeout(self.config.ack_timeout, waiter.notified()) => acked.is_ok(),
                };
                if !acked {
                    debug!(flow = id, "no acknowledgement; flow stopped");
                    break;
                }
            }
            if let Some(delay) = throttle {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        if waiter.is_some() {
            self.acks.remove(id);
        }
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    async fn start_ingest(self: &Arc<Self>, payload: IngestInitPayload) {
        let id = payload.id.clone();
        let Some(cancel) = self.begin(&id) else {
            self.reject_duplicate(id).await;
            return;
        };
        let blueprint = self
            .handler
            .registry()
            .resolve(&payload.contract, &payload.operation);
        let capacity = blueprint
            .as_ref()
            .and_then(|b| b.config().channel_capacity())
            .unwrap_or(self.config.ingest_channel_capacity);

        let mut opened = Vec::with_capacity(payload.streams.len());
        for stream_id in &payload.streams {
            if !self.ingest.open(stream_id, capacity) {
                warn!(stream_id = %stream_id, "client stream id already in use");
                continue;
            }
            if let Some(blueprint) = &blueprint {
                self.limiter.link(stream_id, Arc::clone(blueprint));
            }
            opened.push(stream_id.clone());
        }
        self.send(Message::IngestInitAck(CorrelationPayload::new(id.clone())))
            .await;

        let guard = self.shutdown.in_flight_guard();
        let session = Arc::clone(self);
        let transport = self.transport_context();
        tokio::spawn(async move {
            let _guard = guard;
            let request = OperationRequest::new(payload.contract, payload.operation, payload.args);
            let envelope = session
                .handler
                .invoke_ingest(request, session.ingest.as_ref(), Some(transport), cancel)
                .await;
            for stream_id in &opened {
                session.ingest.discard(stream_id);
                session.limiter.unlink(stream_id);
            }
            session.finish(&id);
            session
                .send(Message::IngestResult(envelope.into_payload(id)))
                .await;
        });
    }

    /// Pushes one client element into its stream. Returns `false` if the
    /// element was dropped.
    async fn push(&self, payload: DataPayload) -> bool {
        let Some(sender) = self.ingest.sender(&payload.id) else {
            debug!(stream_id = %payload.id, "data for unknown or completed stream");
            return false;
        };
        match sender.send_timeout(payload.data, self.config.send_timeout).await {
            Ok(()) => true,
            Err(err) => {
                warn!(stream_id = %payload.id, error = %err, "client stream element dropped");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn transport_context(&self) -> TransportContext {
        let principal = self.identity.principal();
        let client_id = principal
            .as_ref()
            .map(|p| p.id.clone())
            .or_else(|| self.client_id.load_full().map(|id| id.as_ref().clone()));
        let mut metadata = HashMap::new();
        metadata.insert("session_id".to_string(), self.id.to_string());
        TransportContext {
            client_id,
            principal,
            metadata,
        }
    }

    /// Registers `id` as active. `None` if the id is already running.
    fn begin(&self, id: &str) -> Option<CancellationToken> {
        match self.active.entry(id.to_owned()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = self.closed.child_token();
                slot.insert(token.clone());
                Some(token)
            }
        }
    }

    fn finish(&self, id: &str) {
        self.active.remove(id);
    }

    async fn send(&self, message: Message) -> bool {
        match self.connection.send(message).await {
            Ok(()) => true,
            Err(err) => {
                debug!(session = %self.id, error = %err, "outbound message dropped");
                false
            }
        }
    }

    async fn send_error(&self, id: Option<String>, code: &str, message: &str) {
        self.send(Message::Error(ErrorPayload {
            id,
            code: code.to_string(),
            message: message.to_string(),
        }))
        .await;
    }

    async fn reject_duplicate(&self, id: String) {
        warn!(session = %self.id, correlation_id = %id, "correlation id already active");
        self.send_error(Some(id), "duplicate_id", "correlation id is already in use")
            .await;
    }

    async fn reject_limited(&self, message: &Message, err: RateLimitError) {
        let err = OperationError::from(err);
        match message {
            Message::OperationInvoke(payload) => {
                let envelope = ResponseEnvelope::from_error(&err, self.handler.detailed_errors());
                self.send(Message::OperationResponse(envelope.into_payload(payload.id.clone())))
                    .await;
            }
            other => {
                let id = other.correlation_id().map(str::to_owned);
                self.send_error(id, err.code(), &err.to_string()).await;
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection", &self.connection.id)
            .field("active", &self.active.len())
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn data_message(kind: OperationKind, id: &str, data: Element, with_ack: bool) -> Message {
    let payload = DataPayload {
        id: id.to_owned(),
        data,
    };
    match (kind, with_ack) {
        (OperationKind::Stream, false) => Message::StreamData(payload),
        (OperationKind::Stream, true) => Message::StreamDataWithAck(payload),
        (_, false) => Message::SubscriptionData(payload),
        (_, true) => Message::SubscriptionDataWithAck(payload),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
