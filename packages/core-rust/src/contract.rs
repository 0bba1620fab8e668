//! Contract shape model.
//!
//! Describes the shape of a contract member (its parameters and return
//! value, or the fact that it is a property) independently of any Rust
//! closure. The server classifies these shapes into an [`OperationKind`];
//! client proxies can use the same descriptors to pick the right wire flow.

use std::any::type_name;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The four dispatchable operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Unary request/response call.
    Method,
    /// Server-to-client element sequence.
    Stream,
    /// Property-shaped, event-driven subscription.
    Subscription,
    /// Client-to-server element sequence, optionally producing a result.
    Ingest,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Stream => "stream",
            Self::Subscription => "subscription",
            Self::Ingest => "ingest",
        }
    }

    /// Whether the operation keeps a channel open after the initial request.
    #[must_use]
    pub fn is_long_lived(self) -> bool {
        matches!(self, Self::Stream | Self::Subscription)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a single declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// A regular encoded value.
    Value,
    /// An asynchronous element sequence pushed by the client.
    Sequence,
    /// A cancellation token supplied by the server, never by the caller.
    Cancellation,
}

/// An ordered, named parameter of a contract member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub name: String,
    /// Rust type name of the value (or of the sequence element).
    pub type_name: &'static str,
    pub shape: ParamShape,
}

impl ParamDescriptor {
    /// Declares a regular value parameter of type `T`.
    #[must_use]
    pub fn value<T: ?Sized>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name::<T>(),
            shape: ParamShape::Value,
        }
    }

    /// Declares a client-pushed sequence of `T` elements.
    #[must_use]
    pub fn sequence<T: ?Sized>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name::<T>(),
            shape: ParamShape::Sequence,
        }
    }

    /// Declares a cancellation parameter.
    #[must_use]
    pub fn cancellation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: "CancellationToken",
            shape: ParamShape::Cancellation,
        }
    }

    #[must_use]
    pub fn is_sequence(&self) -> bool {
        self.shape == ParamShape::Sequence
    }

    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.shape == ParamShape::Cancellation
    }
}

/// Shape of a member's return value, already unwrapped of the async wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Unit,
    Value,
    Sequence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnDescriptor {
    pub type_name: &'static str,
    pub shape: ReturnShape,
}

impl ReturnDescriptor {
    #[must_use]
    pub fn unit() -> Self {
        Self {
            type_name: "()",
            shape: ReturnShape::Unit,
        }
    }

    #[must_use]
    pub fn value<T: ?Sized>() -> Self {
        Self {
            type_name: type_name::<T>(),
            shape: ReturnShape::Value,
        }
    }

    #[must_use]
    pub fn sequence<T: ?Sized>() -> Self {
        Self {
            type_name: type_name::<T>(),
            shape: ReturnShape::Sequence,
        }
    }
}

/// Shape of one contract member as declared by its contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberShape {
    /// A property. Only properties assignable to the subscription
    /// capability are dispatchable.
    Property {
        type_name: &'static str,
        subscription: bool,
    },
    /// A callable member.
    Method {
        params: Vec<ParamDescriptor>,
        returns: ReturnDescriptor,
    },
}

impl MemberShape {
    /// Declared parameters; empty for properties.
    #[must_use]
    pub fn params(&self) -> &[ParamDescriptor] {
        match self {
            Self::Property { .. } => &[],
            Self::Method { params, .. } => params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_descriptors_record_type_and_shape() {
        let value = ParamDescriptor::value::<u32>("count");
        assert_eq!(value.type_name, "u32");
        assert_eq!(value.shape, ParamShape::Value);

        let seq = ParamDescriptor::sequence::<String>("lines");
        assert!(seq.is_sequence());
        assert!(seq.type_name.ends_with("String"));

        assert!(ParamDescriptor::cancellation("ct").is_cancellation());
    }

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(OperationKind::Subscription.to_string(), "subscription");
        assert_eq!(
            serde_json::to_string(&OperationKind::Ingest).unwrap(),
            "\"ingest\""
        );
        assert!(OperationKind::Stream.is_long_lived());
        assert!(!OperationKind::Ingest.is_long_lived());
    }

    #[test]
    fn property_has_no_params() {
        let shape = MemberShape::Property {
            type_name: "u64",
            subscription: false,
        };
        assert!(shape.params().is_empty());
    }
}
