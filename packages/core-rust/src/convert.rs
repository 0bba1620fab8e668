//! Dynamic converter between typed Rust values and [`Element`] documents.
//!
//! This is the narrow serialize/deserialize boundary the dispatch core uses;
//! nothing else in the server touches `rmpv` encoding directly.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::contract::{ParamDescriptor, ParamShape};
use crate::types::Element;

/// Errors from converting values to or from [`Element`].
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("failed to encode {type_name}: {reason}")]
    Encode {
        type_name: &'static str,
        reason: String,
    },
    #[error("failed to decode element into {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },
}

/// An argument slot after positional matching against declared parameters.
///
/// Value slots stay encoded until the handler asks for a concrete type;
/// sequence slots carry the correlation id the client put in the slot.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedArg {
    Value(Element),
    /// Correlation id of a client stream. `None` if the slot was not a string.
    StreamId(Option<String>),
    /// The caller supplied fewer arguments than declared.
    Missing,
    /// Filled by the server with the request's cancellation token.
    Cancellation,
}

/// Converts typed values to [`Element`] and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicConverter;

impl DynamicConverter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Serializes a value into its document form.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::Encode` if the value's `Serialize` impl fails.
    pub fn serialize_to_element<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Element, ConvertError> {
        let encode_error = |reason: String| ConvertError::Encode {
            type_name: std::any::type_name::<T>(),
            reason,
        };
        // Named encoding keeps struct fields as map keys.
        let bytes = rmp_serde::to_vec_named(value).map_err(|e| encode_error(e.to_string()))?;
        rmpv::decode::read_value(&mut bytes.as_slice()).map_err(|e| encode_error(e.to_string()))
    }

    /// Deserializes a document into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::Decode` if the element does not match `T`.
    pub fn deserialize_element<T: DeserializeOwned>(
        &self,
        element: Element,
    ) -> Result<T, ConvertError> {
        let decode_error = |reason: String| ConvertError::Decode {
            type_name: std::any::type_name::<T>(),
            reason,
        };
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &element).map_err(|e| decode_error(e.to_string()))?;
        rmp_serde::from_slice(&bytes).map_err(|e| decode_error(e.to_string()))
    }

    /// Matches encoded positional arguments against declared parameters.
    ///
    /// Cancellation parameters never consume an encoded argument. Surplus
    /// arguments are ignored; count validation is the caller's concern.
    #[must_use]
    pub fn deserialize_args(
        &self,
        params: &[ParamDescriptor],
        encoded: Vec<Element>,
    ) -> Vec<EncodedArg> {
        let mut supplied = encoded.into_iter();
        params
            .iter()
            .map(|param| match param.shape {
                ParamShape::Cancellation => EncodedArg::Cancellation,
                ParamShape::Value => supplied.next().map_or(EncodedArg::Missing, EncodedArg::Value),
                ParamShape::Sequence => match supplied.next() {
                    Some(element) => EncodedArg::StreamId(element.as_str().map(str::to_owned)),
                    None => EncodedArg::Missing,
                },
            })
            .collect()
    }
}
