//! Event-source handles exposed by contracts as subscription properties.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tether_core::{DynamicConverter, Element};
use tracing::warn;

use super::observer::Observer;

/// Identifies one attached handler within a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    handlers: RwLock<Vec<(HandlerId, Handler<T>)>>,
    next_id: AtomicU64,
}

/// Multicast event source.
///
/// Emission iterates a snapshot of the handler list, so handlers added or
/// removed during an emission take effect from the next one. Clones share
/// the same handler list.
pub struct Subscription<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Subscription<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Subscription<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Delivers `value` to every attached handler. Returns how many handlers
    /// received it.
    pub fn emit(&self, value: T) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &snapshot {
            handler(&value);
        }
        snapshot.len()
    }

    pub fn add_handler(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns the number of handlers still attached.
    pub fn remove_handler(&self, id: HandlerId) -> usize {
        let mut handlers = self.inner.handlers.write();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len()
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handlers", &self.inner.handlers.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Type-erased handle
// ---------------------------------------------------------------------------

/// Forwards encoded events into an observer's channel.
#[derive(Clone)]
pub struct EventSink {
    observer: Arc<Observer<Element>>,
    converter: DynamicConverter,
}

impl EventSink {
    #[must_use]
    pub fn new(observer: Arc<Observer<Element>>, converter: DynamicConverter) -> Self {
        Self { observer, converter }
    }

    /// Encodes and writes one event. Failures are logged, never raised.
    pub fn forward<T: Serialize + ?Sized>(&self, value: &T) {
        match self.converter.serialize_to_element(value) {
            Ok(element) => {
                self.observer.write(element);
            }
            Err(err) => warn!(error = %err, "subscription event could not be encoded"),
        }
    }
}

/// A subscription with its event type erased, as the dispatch core sees it.
pub trait SubscriptionHandle: Send + Sync {
    fn attach(&self, sink: EventSink) -> HandlerId;

    /// Returns the number of handlers still attached.
    fn detach(&self, id: HandlerId) -> usize;

    fn handler_count(&self) -> usize;
}

impl<T: Serialize + Send + Sync + 'static> SubscriptionHandle for Subscription<T> {
    fn attach(&self, sink: EventSink) -> HandlerId {
        self.add_handler(move |value: &T| sink.forward(value))
    }

    fn detach(&self, id: HandlerId) -> usize {
        self.remove_handler(id)
    }

    fn handler_count(&self) -> usize {
        Subscription::handler_count(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::StreamExt;

    use super::*;

    #[test]
    fn emit_reaches_every_handler() {
        let source = Subscription::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = Arc::clone(&total);
            source.add_handler(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }
        assert_eq!(source.emit(2), 3);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn removed_handlers_stop_receiving() {
        let source = Subscription::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = source.add_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let other = source.add_handler(|_| {});

        source.emit(1);
        assert_eq!(source.remove_handler(id), 1);
        source.emit(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(source.clone().remove_handler(other), 0);
    }

    #[test]
    fn handler_added_during_emit_misses_that_emission() {
        let source = Subscription::<u32>::new();
        let late_hits = Arc::new(AtomicUsize::new(0));
        let (src, hits) = (source.clone(), Arc::clone(&late_hits));
        source.add_handler(move |_| {
            let hits = Arc::clone(&hits);
            src.add_handler(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(source.emit(0), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn erased_handle_forwards_encoded_events() {
        let source = Subscription::<String>::new();
        let handle: Arc<dyn SubscriptionHandle> = Arc::new(source.clone());
        let observer = Arc::new(Observer::new());
        let mut events = observer.take_stream().unwrap();

        let id = handle.attach(EventSink::new(Arc::clone(&observer), DynamicConverter::new()));
        source.emit("hello".to_string());
        assert_eq!(events.next().await, Some(Element::from("hello")));

        assert_eq!(handle.detach(id), 0);
        assert_eq!(source.emit("ignored".to_string()), 0);
    }
}
