//! Reconciled arguments handed to operation handlers.

use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tether_core::{DynamicConverter, Element, EncodedArg};
use tokio_util::sync::CancellationToken;

use super::ingest::IngestStream;
use super::operation::OperationError;

/// One positional argument after reconciliation.
#[derive(Debug)]
pub enum ArgSlot {
    /// Still-encoded value; decoded on demand by [`Args::get`].
    Encoded(Element),
    /// Client-pushed stream substituted for its correlation id.
    Stream(IngestStream),
    /// Not supplied, or a stream id with no open stream.
    Absent,
    /// Filled with the request's cancellation token.
    Cancellation,
}

impl ArgSlot {
    /// Maps a converter slot to an argument slot. Stream ids resolve to
    /// `Absent`; ingest reconciliation substitutes them separately.
    #[must_use]
    pub fn from_encoded(arg: EncodedArg) -> Self {
        match arg {
            EncodedArg::Value(element) => Self::Encoded(element),
            EncodedArg::Cancellation => Self::Cancellation,
            EncodedArg::StreamId(_) | EncodedArg::Missing => Self::Absent,
        }
    }
}

/// Ordered arguments for a single invocation.
#[derive(Debug)]
pub struct Args {
    slots: Vec<ArgSlot>,
    converter: DynamicConverter,
    cancellation: CancellationToken,
}

impl Args {
    #[must_use]
    pub fn new(slots: Vec<ArgSlot>, converter: DynamicConverter, cancellation: CancellationToken) -> Self {
        Self {
            slots,
            converter,
            cancellation,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Decodes the value at `index`.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::InvalidArgument` if the slot is missing, is
    /// not a value, or does not decode into `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, OperationError> {
        match self.slots.get(index) {
            Some(ArgSlot::Encoded(element)) => self
                .converter
                .deserialize_element(element.clone())
                .map_err(|e| OperationError::InvalidArgument {
                    index,
                    reason: e.to_string(),
                }),
            Some(ArgSlot::Absent) | None => Err(OperationError::InvalidArgument {
                index,
                reason: "argument not supplied".to_string(),
            }),
            Some(ArgSlot::Stream(_) | ArgSlot::Cancellation) => Err(OperationError::InvalidArgument {
                index,
                reason: "argument is not a value".to_string(),
            }),
        }
    }

    /// Like [`get`](Self::get), but an absent slot yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::InvalidArgument` if a supplied value does not
    /// decode into `T`.
    pub fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, OperationError> {
        match self.slots.get(index) {
            Some(ArgSlot::Absent) | None => Ok(None),
            _ => self.get(index).map(Some),
        }
    }

    #[must_use]
    pub fn is_absent(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(ArgSlot::Absent) | None)
    }

    /// Takes the raw client stream at `index`, leaving the slot absent.
    pub fn stream(&mut self, index: usize) -> Option<IngestStream> {
        let slot = self.slots.get_mut(index)?;
        if !matches!(slot, ArgSlot::Stream(_)) {
            return None;
        }
        match std::mem::replace(slot, ArgSlot::Absent) {
            ArgSlot::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Takes the client stream at `index`, decoding each element into `T`.
    pub fn stream_of<T: DeserializeOwned>(
        &mut self,
        index: usize,
    ) -> Option<impl Stream<Item = Result<T, OperationError>> + Send + 'static> {
        let converter = self.converter;
        self.stream(index).map(move |stream| {
            stream.map(move |element| {
                converter
                    .deserialize_element(element)
                    .map_err(|e| OperationError::InvalidArgument {
                        index,
                        reason: e.to_string(),
                    })
            })
        })
    }

    /// Cancellation token of the request.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    #[must_use]
    pub fn converter(&self) -> DynamicConverter {
        self.converter
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    use super::*;

    fn args(slots: Vec<ArgSlot>) -> Args {
        Args::new(slots, DynamicConverter::new(), CancellationToken::new())
    }

    #[test]
    fn values_decode_on_demand() {
        let args = args(vec![
            ArgSlot::Encoded(Element::from(5)),
            ArgSlot::Encoded(Element::from("five")),
            ArgSlot::Absent,
        ]);
        assert_eq!(args.get::<i64>(0).unwrap(), 5);
        assert_eq!(args.get::<String>(1).unwrap(), "five");
        assert!(matches!(
            args.get::<i64>(1),
            Err(OperationError::InvalidArgument { index: 1, .. })
        ));
        assert!(args.get::<i64>(2).is_err());
        assert_eq!(args.optional::<i64>(2).unwrap(), None);
        assert_eq!(args.optional::<i64>(9).unwrap(), None);
    }

    #[tokio::test]
    async fn stream_slot_is_taken_once_and_decoded() {
        let (tx, rx) = mpsc::channel(4);
        let mut args = args(vec![ArgSlot::Stream(IngestStream::new("s", rx))]);
        tx.send(Element::from(10)).await.unwrap();
        tx.send(Element::from(20)).await.unwrap();
        drop(tx);

        let stream = args.stream_of::<i64>(0).unwrap();
        assert!(args.stream(0).is_none());
        assert!(args.is_absent(0));

        let values: Vec<i64> = stream.map(Result::unwrap).collect().await;
        assert_eq!(values, vec![10, 20]);
    }

    #[test]
    fn converter_slots_map_to_argument_slots() {
        assert!(matches!(
            ArgSlot::from_encoded(EncodedArg::Value(Element::from(1))),
            ArgSlot::Encoded(_)
        ));
        assert!(matches!(ArgSlot::from_encoded(EncodedArg::Missing), ArgSlot::Absent));
        assert!(matches!(
            ArgSlot::from_encoded(EncodedArg::StreamId(Some("x".into()))),
            ArgSlot::Absent
        ));
        assert!(matches!(
            ArgSlot::from_encoded(EncodedArg::Cancellation),
            ArgSlot::Cancellation
        ));
    }
}
