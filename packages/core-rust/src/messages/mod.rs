//! Wire message schemas for the Tether protocol.
//!
//! One connection multiplexes many operations. Every message is a map with a
//! snake_case `type` tag and the fields of its payload struct, serialized as
//! named `MsgPack` (`rmp_serde::to_vec_named()`).

pub mod base;

use serde::{Deserialize, Serialize};

use crate::contract::OperationKind;

pub use base::{
    ConnectionInitPayload, CorrelationPayload, DataPayload, ErrorPayload, IngestInitPayload,
    InvokePayload, ResponsePayload,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ----- Handshake -----
    ConnectionInit(ConnectionInitPayload),
    ConnectionAck,

    // ----- Keepalive -----
    Ping,
    Pong,

    // ----- Unary -----
    OperationInvoke(InvokePayload),
    OperationCall(InvokePayload),
    OperationResponse(ResponsePayload),

    // ----- Stream -----
    StreamInit(InvokePayload),
    StreamData(DataPayload),
    /// Acknowledges a `stream_data_with_ack` or `subscription_data_with_ack`.
    StreamDataAck(CorrelationPayload),
    StreamDataWithAck(DataPayload),
    StreamComplete(CorrelationPayload),

    // ----- Subscription -----
    SubscriptionInit(InvokePayload),
    SubscriptionData(DataPayload),
    SubscriptionDataWithAck(DataPayload),
    SubscriptionComplete(CorrelationPayload),

    // ----- Ingest -----
    IngestInit(IngestInitPayload),
    IngestInitAck(CorrelationPayload),
    IngestData(DataPayload),
    IngestDataAck(CorrelationPayload),
    IngestDataWithAck(DataPayload),
    IngestComplete(CorrelationPayload),
    IngestResult(ResponsePayload),

    // ----- Error -----
    Error(ErrorPayload),
}

impl Message {
    /// Returns the discriminant of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionInit(_) => MessageType::ConnectionInit,
            Self::ConnectionAck => MessageType::ConnectionAck,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::OperationInvoke(_) => MessageType::OperationInvoke,
            Self::OperationCall(_) => MessageType::OperationCall,
            Self::OperationResponse(_) => MessageType::OperationResponse,
            Self::StreamInit(_) => MessageType::StreamInit,
            Self::StreamData(_) => MessageType::StreamData,
            Self::StreamDataAck(_) => MessageType::StreamDataAck,
            Self::StreamDataWithAck(_) => MessageType::StreamDataWithAck,
            Self::StreamComplete(_) => MessageType::StreamComplete,
            Self::SubscriptionInit(_) => MessageType::SubscriptionInit,
            Self::SubscriptionData(_) => MessageType::SubscriptionData,
            Self::SubscriptionDataWithAck(_) => MessageType::SubscriptionDataWithAck,
            Self::SubscriptionComplete(_) => MessageType::SubscriptionComplete,
            Self::IngestInit(_) => MessageType::IngestInit,
            Self::IngestInitAck(_) => MessageType::IngestInitAck,
            Self::IngestData(_) => MessageType::IngestData,
            Self::IngestDataAck(_) => MessageType::IngestDataAck,
            Self::IngestDataWithAck(_) => MessageType::IngestDataWithAck,
            Self::IngestComplete(_) => MessageType::IngestComplete,
            Self::IngestResult(_) => MessageType::IngestResult,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Correlation id carried by the message, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionInit(_) | Self::ConnectionAck | Self::Ping | Self::Pong => None,
            Self::OperationInvoke(p)
            | Self::OperationCall(p)
            | Self::StreamInit(p)
            | Self::SubscriptionInit(p) => Some(&p.id),
            Self::IngestInit(p) => Some(&p.id),
            Self::OperationResponse(p) | Self::IngestResult(p) => Some(&p.id),
            Self::StreamData(p)
            | Self::StreamDataWithAck(p)
            | Self::SubscriptionData(p)
            | Self::SubscriptionDataWithAck(p)
            | Self::IngestData(p)
            | Self::IngestDataWithAck(p) => Some(&p.id),
            Self::StreamDataAck(p)
            | Self::StreamComplete(p)
            | Self::SubscriptionComplete(p)
            | Self::IngestInitAck(p)
            | Self::IngestDataAck(p)
            | Self::IngestComplete(p) => Some(&p.id),
            Self::Error(p) => p.id.as_deref(),
        }
    }

    /// `(contract, operation)` addressed by an initiating message.
    #[must_use]
    pub fn operation_target(&self) -> Option<(&str, &str)> {
        match self {
            Self::OperationInvoke(p)
            | Self::OperationCall(p)
            | Self::StreamInit(p)
            | Self::SubscriptionInit(p) => Some((&p.contract, &p.operation)),
            Self::IngestInit(p) => Some((&p.contract, &p.operation)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageType / categories
// ---------------------------------------------------------------------------

/// Fieldless discriminant of [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectionInit,
    ConnectionAck,
    Ping,
    Pong,
    OperationInvoke,
    OperationCall,
    OperationResponse,
    StreamInit,
    StreamData,
    StreamDataAck,
    StreamDataWithAck,
    StreamComplete,
    SubscriptionInit,
    SubscriptionData,
    SubscriptionDataWithAck,
    SubscriptionComplete,
    IngestInit,
    IngestInitAck,
    IngestData,
    IngestDataAck,
    IngestDataWithAck,
    IngestComplete,
    IngestResult,
    Error,
}

/// Protocol category of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Handshake,
    Keepalive,
    Unary,
    Stream,
    Subscription,
    Ingest,
    Error,
}

/// Rate-limit bucket group. Sub-types of one logical flow share a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitGroup {
    Ping,
    Unary,
    Subscription,
    Stream,
    Ingest,
}

impl LimitGroup {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Unary => "unary",
            Self::Subscription => "subscription",
            Self::Stream => "stream",
            Self::Ingest => "ingest",
        }
    }
}

impl From<OperationKind> for LimitGroup {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Method => Self::Unary,
            OperationKind::Stream => Self::Stream,
            OperationKind::Subscription => Self::Subscription,
            OperationKind::Ingest => Self::Ingest,
        }
    }
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::OperationInvoke => "operation_invoke",
            Self::OperationCall => "operation_call",
            Self::OperationResponse => "operation_response",
            Self::StreamInit => "stream_init",
            Self::StreamData => "stream_data",
            Self::StreamDataAck => "stream_data_ack",
            Self::StreamDataWithAck => "stream_data_with_ack",
            Self::StreamComplete => "stream_complete",
            Self::SubscriptionInit => "subscription_init",
            Self::SubscriptionData => "subscription_data",
            Self::SubscriptionDataWithAck => "subscription_data_with_ack",
            Self::SubscriptionComplete => "subscription_complete",
            Self::IngestInit => "ingest_init",
            Self::IngestInitAck => "ingest_init_ack",
            Self::IngestData => "ingest_data",
            Self::IngestDataAck => "ingest_data_ack",
            Self::IngestDataWithAck => "ingest_data_with_ack",
            Self::IngestComplete => "ingest_complete",
            Self::IngestResult => "ingest_result",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn category(self) -> MessageCategory {
        match self {
            Self::ConnectionInit | Self::ConnectionAck => MessageCategory::Handshake,
            Self::Ping | Self::Pong => MessageCategory::Keepalive,
            Self::OperationInvoke | Self::OperationCall | Self::OperationResponse => {
                MessageCategory::Unary
            }
            Self::StreamInit
            | Self::StreamData
            | Self::StreamDataAck
            | Self::StreamDataWithAck
            | Self::StreamComplete => MessageCategory::Stream,
            Self::SubscriptionInit
            | Self::SubscriptionData
            | Self::SubscriptionDataWithAck
            | Self::SubscriptionComplete => MessageCategory::Subscription,
            Self::IngestInit
            | Self::IngestInitAck
            | Self::IngestData
            | Self::IngestDataAck
            | Self::IngestDataWithAck
            | Self::IngestComplete
            | Self::IngestResult => MessageCategory::Ingest,
            Self::Error => MessageCategory::Error,
        }
    }

    /// Bucket group for rate limiting, or `None` for exempt control traffic.
    ///
    /// Handshake, acknowledgements, pong, errors and result delivery are never
    /// throttled: a session waiting on its own acknowledgement must not be
    /// blocked behind its own limit.
    #[must_use]
    pub fn limit_group(self) -> Option<LimitGroup> {
        match self {
            Self::ConnectionInit
            | Self::ConnectionAck
            | Self::Pong
            | Self::OperationResponse
            | Self::StreamDataAck
            | Self::IngestInitAck
            | Self::IngestDataAck
            | Self::IngestResult
            | Self::Error => None,
            Self::Ping => Some(LimitGroup::Ping),
            Self::OperationInvoke | Self::OperationCall => Some(LimitGroup::Unary),
            Self::StreamInit | Self::StreamData | Self::StreamDataWithAck | Self::StreamComplete => {
                Some(LimitGroup::Stream)
            }
            Self::SubscriptionInit
            | Self::SubscriptionData
            | Self::SubscriptionDataWithAck
            | Self::SubscriptionComplete => Some(LimitGroup::Subscription),
            Self::IngestInit | Self::IngestData | Self::IngestDataWithAck | Self::IngestComplete => {
                Some(LimitGroup::Ingest)
            }
        }
    }

    #[must_use]
    pub fn is_rate_limited(self) -> bool {
        self.limit_group().is_some()
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors from encoding or decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a message as named `MsgPack`.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes a message from named `MsgPack`.
///
/// # Errors
///
/// Returns `CodecError::Decode` for malformed input or an unknown `type` tag.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
