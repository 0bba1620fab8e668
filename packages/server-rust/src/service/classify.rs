//! Shape classification: converts a declared `MemberShape` into an `OperationKind`.

use tether_core::{MemberShape, OperationKind, ParamDescriptor, ReturnShape};

/// Reason a member shape is not dispatchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("plain properties are not dispatchable; only subscriptions are")]
    PlainProperty,
    #[error("a member cannot both consume and produce a sequence")]
    Bidirectional,
}

/// Classifies a member by its shape.
///
/// - subscription property: `Subscription`
/// - any sequence parameter: `Ingest`
/// - sequence return: `Stream`
/// - everything else: `Method`
///
/// # Errors
///
/// Returns `ShapeError` for plain properties and for members that take and
/// return sequences at the same time.
pub fn classify(shape: &MemberShape) -> Result<OperationKind, ShapeError> {
    match shape {
        MemberShape::Property {
            subscription: true, ..
        } => Ok(OperationKind::Subscription),
        MemberShape::Property { .. } => Err(ShapeError::PlainProperty),
        MemberShape::Method { params, returns } => {
            let ingest = params.iter().any(ParamDescriptor::is_sequence);
            match (ingest, returns.shape) {
                (true, ReturnShape::Sequence) => Err(ShapeError::Bidirectional),
                (true, _) => Ok(OperationKind::Ingest),
                (false, ReturnShape::Sequence) => Ok(OperationKind::Stream),
                (false, _) => Ok(OperationKind::Method),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tether_core::ReturnDescriptor;

    use super::*;

    fn method(params: Vec<ParamDescriptor>, returns: ReturnDescriptor) -> MemberShape {
        MemberShape::Method { params, returns }
    }

    #[test]
    fn unit_and_value_returns_are_methods() {
        assert_eq!(
            classify(&method(vec![], ReturnDescriptor::unit())),
            Ok(OperationKind::Method)
        );
        assert_eq!(
            classify(&method(
                vec![ParamDescriptor::value::<u32>("id"), ParamDescriptor::cancellation("ct")],
                ReturnDescriptor::value::<String>(),
            )),
            Ok(OperationKind::Method)
        );
    }

    #[test]
    fn sequence_return_is_a_stream() {
        assert_eq!(
            classify(&method(
                vec![ParamDescriptor::value::<u32>("n")],
                ReturnDescriptor::sequence::<u32>()
            )),
            Ok(OperationKind::Stream)
        );
    }

    #[test]
    fn sequence_parameter_is_ingest_wherever_it_appears() {
        let shape = method(
            vec![
                ParamDescriptor::value::<String>("label"),
                ParamDescriptor::value::<u8>("mode"),
                ParamDescriptor::sequence::<i64>("numbers"),
            ],
            ReturnDescriptor::value::<i64>(),
        );
        assert_eq!(classify(&shape), Ok(OperationKind::Ingest));

        let no_result = method(
            vec![ParamDescriptor::sequence::<i64>("numbers")],
            ReturnDescriptor::unit(),
        );
        assert_eq!(classify(&no_result), Ok(OperationKind::Ingest));
    }

    #[test]
    fn bidirectional_members_are_rejected() {
        let shape = method(
            vec![ParamDescriptor::sequence::<i64>("in")],
            ReturnDescriptor::sequence::<i64>(),
        );
        assert_eq!(classify(&shape), Err(ShapeError::Bidirectional));
    }

    #[test]
    fn properties_must_be_subscriptions() {
        let sub = MemberShape::Property {
            type_name: "Subscription<u64>",
            subscription: true,
        };
        assert_eq!(classify(&sub), Ok(OperationKind::Subscription));

        let plain = MemberShape::Property {
            type_name: "u64",
            subscription: false,
        };
        assert_eq!(classify(&plain), Err(ShapeError::PlainProperty));
    }
}
