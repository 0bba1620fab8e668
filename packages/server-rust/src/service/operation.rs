//! Operation request, context, result and error types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde::Serialize;
use tether_core::messages::{InvokePayload, ResponsePayload};
use tether_core::{ConvertError, DynamicConverter, Element, Principal};
use tokio_util::sync::CancellationToken;

use super::args::Args;
use super::blueprint::OperationBlueprint;
use super::provider::ServiceProvider;
use crate::ratelimit::RateLimitError;

pub use tether_core::OperationKind;

/// Lazily produced sequence of encoded elements handed to the transport.
pub type ElementStream = BoxStream<'static, Result<Element, OperationError>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while dispatching an operation.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("operation not found: {contract}.{operation}")]
    NotFound { contract: String, operation: String },
    #[error("expected {expected} arguments, got {actual}")]
    ParameterCountMismatch { expected: usize, actual: usize },
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitError),
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("no service instance registered for {type_name}")]
    ServiceUnavailable { type_name: &'static str },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Wraps an arbitrary message as an internal error.
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::Internal(anyhow::Error::msg(message.to_string()))
    }

    pub(crate) fn encode(err: &ConvertError) -> Self {
        Self::internal(format!("failed to encode result: {err}"))
    }

    /// Stable machine-readable code for the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ParameterCountMismatch { .. } => "parameter_count_mismatch",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimitExceeded(_) => "rate_limited",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to show to the caller.
    ///
    /// Internal errors are reduced to a generic message unless detailed
    /// error reporting is enabled.
    #[must_use]
    pub fn public_message(&self, detailed: bool) -> String {
        match self {
            Self::Internal(err) if detailed => format!("{err:#}"),
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// A failure recorded on an operation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: &'static str,
    pub message: String,
}

impl Failure {
    #[must_use]
    pub fn from_error(err: &OperationError, detailed: bool) -> Self {
        Self {
            code: err.code(),
            message: err.public_message(detailed),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / transport context
// ---------------------------------------------------------------------------

/// Wire-level input: target plus ordered, still-encoded arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub contract: String,
    pub operation: String,
    pub args: Vec<Element>,
}

impl OperationRequest {
    #[must_use]
    pub fn new(contract: impl Into<String>, operation: impl Into<String>, args: Vec<Element>) -> Self {
        Self {
            contract: contract.into(),
            operation: operation.into(),
            args,
        }
    }
}

impl From<InvokePayload> for OperationRequest {
    fn from(payload: InvokePayload) -> Self {
        Self {
            contract: payload.contract,
            operation: payload.operation,
            args: payload.args,
        }
    }
}

/// Transport-specific information about the caller.
#[derive(Debug, Clone, Default)]
pub struct TransportContext {
    /// Identity used for keying per-client state.
    pub client_id: Option<String>,
    /// The authenticated principal, if any.
    pub principal: Option<Principal>,
    /// Free-form transport metadata (headers, session id, remote address).
    pub metadata: HashMap<String, String>,
}

impl TransportContext {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn authenticated(principal: Principal) -> Self {
        Self {
            client_id: Some(principal.id.clone()),
            principal: Some(principal),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Type-erased value that can be encoded through the converter later.
pub trait EncodeValue: Send {
    /// # Errors
    ///
    /// Returns the converter's error if the value cannot be encoded.
    fn encode(&self, converter: &DynamicConverter) -> Result<Element, ConvertError>;
}

impl<T: Serialize + Send> EncodeValue for T {
    fn encode(&self, converter: &DynamicConverter) -> Result<Element, ConvertError> {
        converter.serialize_to_element(self)
    }
}

/// What the routing stage produced.
pub enum Produced {
    Unit,
    Value(Box<dyn EncodeValue>),
    Stream(ElementStream),
}

impl fmt::Debug for Produced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("Unit"),
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub enum OperationResult {
    Completed(Produced),
    Failed(Failure),
}

/// Uniform response shape returned to callers of unary and ingest operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Element>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn unit() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            code: None,
        }
    }

    #[must_use]
    pub fn ok(data: Element) -> Self {
        Self {
            data: Some(data),
            ..Self::unit()
        }
    }

    #[must_use]
    pub fn failure(failure: &Failure) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(failure.message.clone()),
            code: Some(failure.code),
        }
    }

    #[must_use]
    pub fn from_error(err: &OperationError, detailed: bool) -> Self {
        Self::failure(&Failure::from_error(err, detailed))
    }

    #[must_use]
    pub fn into_payload(self, id: String) -> ResponsePayload {
        ResponsePayload {
            id,
            success: self.success,
            data: self.data,
            error: self.error,
        }
    }
}

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Per-request state threaded through the middleware pipeline.
///
/// Owned exclusively by one execution and dropped when it completes.
pub struct OperationContext {
    pub operation: String,
    pub blueprint: Arc<OperationBlueprint>,
    pub request: OperationRequest,
    pub services: Arc<ServiceProvider>,
    pub transport: Option<TransportContext>,
    pub result: Option<OperationResult>,
    pub error: Option<OperationError>,
    pub cancellation: CancellationToken,
    pub detailed_errors: bool,
    arguments: Option<Args>,
}

impl OperationContext {
    #[must_use]
    pub fn new(
        blueprint: Arc<OperationBlueprint>,
        request: OperationRequest,
        services: Arc<ServiceProvider>,
        transport: Option<TransportContext>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            operation: blueprint.operation_name().to_string(),
            blueprint,
            request,
            services,
            transport,
            result: None,
            error: None,
            cancellation,
            detailed_errors: false,
            arguments: None,
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: Args) -> Self {
        self.arguments = Some(arguments);
        self
    }

    #[must_use]
    pub fn with_detailed_errors(mut self, detailed: bool) -> Self {
        self.detailed_errors = detailed;
        self
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.transport.as_ref().and_then(|t| t.principal.as_ref())
    }

    /// Takes the reconciled arguments; `None` once consumed.
    pub fn take_arguments(&mut self) -> Option<Args> {
        self.arguments.take()
    }

    pub fn complete(&mut self, produced: Produced) {
        self.result = Some(OperationResult::Completed(produced));
    }

    /// Records an expected failure as the operation result.
    pub fn fail(&mut self, err: OperationError) {
        let failure = Failure::from_error(&err, self.detailed_errors);
        self.record_failure(err, failure);
    }

    pub fn record_failure(&mut self, err: OperationError, failure: Failure) {
        self.result = Some(OperationResult::Failed(failure));
        self.error = Some(err);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.result, Some(OperationResult::Failed(_)))
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("contract", &self.blueprint.contract_name())
            .field("operation", &self.operation)
            .field("result", &self.result)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_redacted_unless_detailed() {
        let err = OperationError::internal("database exploded");
        assert_eq!(err.public_message(false), "internal server error");
        assert!(err.public_message(true).contains("database exploded"));

        let not_found = OperationError::NotFound {
            contract: "c".to_string(),
            operation: "o".to_string(),
        };
        assert_eq!(not_found.public_message(false), "operation not found: c.o");
        assert_eq!(not_found.code(), "not_found");
    }

    #[test]
    fn failure_envelope_carries_code_and_message() {
        let envelope = ResponseEnvelope::from_error(&OperationError::Unauthorized, false);
        assert!(!envelope.success);
        assert_eq!(envelope.code, Some("unauthorized"));
        assert_eq!(envelope.error.as_deref(), Some("authentication required"));

        let payload = envelope.into_payload("7".to_string());
        assert_eq!(payload.id, "7");
        assert!(!payload.success);
    }

    #[test]
    fn success_envelope_serializes_without_empty_fields() {
        let json = serde_json::to_value(ResponseEnvelope::ok(Element::from(3))).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true, "data": 3 }));
    }

    #[test]
    fn encode_value_is_erased_through_the_converter() {
        let boxed: Box<dyn EncodeValue> = Box::new(vec![1_u8, 2]);
        let element = boxed.encode(&DynamicConverter::new()).unwrap();
        assert!(element.is_array() || element.is_bin());
    }
}
