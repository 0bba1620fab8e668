//! Client-pushed stream plumbing for ingest operations.
//!
//! A stream is opened when `ingest_init` announces its correlation id, fed by
//! `ingest_data` messages and closed by `ingest_complete`. The receiving half
//! is taken exactly once, by the handler that reconciles the matching
//! argument slot.

use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::Stream;
use tether_core::Element;
use tokio::sync::mpsc;
use tracing::debug;

/// The receiving half of a client-pushed stream.
#[derive(Debug)]
pub struct IngestStream {
    id: String,
    rx: mpsc::Receiver<Element>,
}

impl IngestStream {
    #[must_use]
    pub fn new(id: impl Into<String>, rx: mpsc::Receiver<Element>) -> Self {
        Self { id: id.into(), rx }
    }

    /// Correlation id the client pushes this stream under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next_element(&mut self) -> Option<Element> {
        self.rx.recv().await
    }
}

impl Stream for IngestStream {
    type Item = Element;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Element>> {
        self.rx.poll_recv(cx)
    }
}

/// Lookup of open client streams by correlation id.
pub trait StreamSource: Send + Sync {
    /// Takes the receiving half of the stream. Returns `None` if the stream
    /// is unknown or was already taken.
    fn take_stream(&self, id: &str) -> Option<IngestStream>;
}

/// A source with no open streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStreams;

impl StreamSource for NoStreams {
    fn take_stream(&self, _id: &str) -> Option<IngestStream> {
        None
    }
}

struct OpenStream {
    /// `None` once the client completed the stream.
    tx: Option<mpsc::Sender<Element>>,
    /// `None` once the handler took the stream.
    rx: Option<mpsc::Receiver<Element>>,
}

/// Per-connection registry of client streams.
///
/// An entry lives until both halves are gone: completed by the client and
/// taken by the handler. A stream completed before it was taken still
/// yields its buffered elements.
#[derive(Default)]
pub struct IngestStreamRegistry {
    streams: DashMap<String, OpenStream>,
}

impl IngestStreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a bounded stream under `id`. Returns `false` if the id is in use.
    pub fn open(&self, id: &str, capacity: usize) -> bool {
        match self.streams.entry(id.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                slot.insert(OpenStream {
                    tx: Some(tx),
                    rx: Some(rx),
                });
                debug!(stream_id = id, capacity, "ingest stream opened");
                true
            }
        }
    }

    /// Sending half for pushing client data, while the stream is open.
    #[must_use]
    pub fn sender(&self, id: &str) -> Option<mpsc::Sender<Element>> {
        self.streams.get(id).and_then(|s| s.tx.clone())
    }

    /// Completes the stream; the consumer sees end-of-stream once buffered
    /// elements are drained. Returns `false` if the stream was not open.
    pub fn close(&self, id: &str) -> bool {
        let Some(mut entry) = self.streams.get_mut(id) else {
            return false;
        };
        let was_open = entry.tx.take().is_some();
        let taken = entry.rx.is_none();
        drop(entry);
        if taken {
            self.streams.remove_if(id, |_, s| s.tx.is_none() && s.rx.is_none());
        }
        if was_open {
            debug!(stream_id = id, "ingest stream closed");
        }
        was_open
    }

    /// Drops the stream whatever its state. Returns `false` if unknown.
    pub fn discard(&self, id: &str) -> bool {
        self.streams.remove(id).is_some()
    }

    /// Drops every stream. Consumers already holding a stream see it end.
    pub fn clear(&self) {
        self.streams.clear();
    }

    #[must_use]
    pub fn is_open(&self, id: &str) -> bool {
        self.streams.get(id).is_some_and(|s| s.tx.is_some())
    }

    /// Number of tracked streams, open or awaiting their consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl StreamSource for IngestStreamRegistry {
    fn take_stream(&self, id: &str) -> Option<IngestStream> {
        let mut entry = self.streams.get_mut(id)?;
        let rx = entry.rx.take()?;
        let completed = entry.tx.is_none();
        drop(entry);
        if completed {
            self.streams.remove_if(id, |_, s| s.tx.is_none() && s.rx.is_none());
        }
        Some(IngestStream::new(id, rx))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn pushed_elements_arrive_in_order_then_end() {
        let registry = IngestStreamRegistry::new();
        assert!(registry.open("s1", 8));
        assert!(!registry.open("s1", 8), "second open of the same id is rejected");

        let tx = registry.sender("s1").unwrap();
        tx.send(Element::from(1)).await.unwrap();
        tx.send(Element::from(2)).await.unwrap();
        drop(tx);

        let stream = registry.take_stream("s1").unwrap();
        assert_eq!(stream.id(), "s1");
        assert!(registry.take_stream("s1").is_none(), "receiver is taken once");

        assert!(registry.close("s1"));
        let items: Vec<Element> = stream.collect().await;
        assert_eq!(items, vec![Element::from(1), Element::from(2)]);
    }

    #[tokio::test]
    async fn unknown_streams_are_absent() {
        let registry = IngestStreamRegistry::new();
        assert!(registry.take_stream("nope").is_none());
        assert!(registry.sender("nope").is_none());
        assert!(!registry.close("nope"));
        assert!(NoStreams.take_stream("anything").is_none());
    }

    #[tokio::test]
    async fn completed_streams_keep_their_buffer_until_taken() {
        let registry = IngestStreamRegistry::new();
        registry.open("s1", 4);
        let tx = registry.sender("s1").unwrap();
        tx.send(Element::from("a")).await.unwrap();
        drop(tx);

        assert!(registry.close("s1"));
        assert!(!registry.is_open("s1"));
        assert!(registry.sender("s1").is_none());
        assert_eq!(registry.len(), 1);

        let items: Vec<Element> = registry.take_stream("s1").unwrap().collect().await;
        assert_eq!(items, vec![Element::from("a")]);
        assert!(registry.is_empty());
    }

    #[test]
    fn discard_drops_untaken_streams() {
        let registry = IngestStreamRegistry::new();
        registry.open("s1", 4);
        assert!(registry.discard("s1"));
        assert!(!registry.discard("s1"));
        assert!(registry.open("s1", 4), "id is reusable after discard");
    }

    #[tokio::test]
    async fn concurrent_open_and_take_never_panics() {
        let registry = Arc::new(IngestStreamRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let reg = Arc::clone(&registry);
            let id = format!("s{}", (i / 2) % 4);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    reg.open(&id, 4);
                    None
                } else {
                    reg.take_stream(&id).map(|s| s.id().to_string())
                }
            }));
        }
        let mut taken = Vec::new();
        for task in tasks {
            if let Some(id) = task.await.unwrap() {
                taken.push(id);
            }
        }
        taken.sort();
        let before = taken.len();
        taken.dedup();
        assert_eq!(before, taken.len(), "each stream is taken at most once");
        assert_eq!(registry.len(), 4);
    }
}
