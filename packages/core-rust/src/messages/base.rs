//! Payload structs shared by the wire message variants.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` and are flattened
//! next to the `type` tag of [`Message`](super::Message).

use serde::{Deserialize, Serialize};

use crate::types::Element;

/// Payload for `connection_init`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInitPayload {
    /// Client-chosen identifier, used when no principal is available.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
}

/// Payload for `operation_invoke`, `operation_call`, `stream_init` and
/// `subscription_init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokePayload {
    /// Correlation id chosen by the client.
    pub id: String,
    pub contract: String,
    pub operation: String,
    /// Ordered encoded arguments.
    #[serde(default)]
    pub args: Vec<Element>,
}

/// Payload for `ingest_init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestInitPayload {
    pub id: String,
    pub contract: String,
    pub operation: String,
    /// Ordered encoded arguments; sequence slots hold stream correlation ids.
    #[serde(default)]
    pub args: Vec<Element>,
    /// Correlation ids of the streams the client will push on.
    #[serde(default)]
    pub streams: Vec<String>,
}

/// Payload for every `*_data` and `*_data_with_ack` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub id: String,
    pub data: Element,
}

/// Payload for acknowledgements and completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationPayload {
    pub id: String,
}

/// Payload for `operation_response` and `ingest_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Element>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Payload for `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Correlation id of the failed flow, if the error belongs to one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    /// Stable machine-readable error code (e.g. `"unauthorized"`).
    pub code: String,
    pub message: String,
}

impl CorrelationPayload {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}
