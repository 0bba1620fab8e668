//! Live subscription descriptors, keyed by client, contract and operation.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::Stream;
use tracing::debug;

use super::event::{EventSink, HandlerId, SubscriptionHandle};
use crate::service::blueprint::AuthorizeData;
use crate::service::operation::OperationError;

/// Identifies one live subscription source.
///
/// `client_id` is the principal id for operations requiring authorization
/// and the empty string otherwise, so anonymous subscribers share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub client_id: String,
    pub contract: String,
    pub operation: String,
}

impl SubscriptionKey {
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        contract: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            contract: contract.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.client_id, self.contract, self.operation)
    }
}

/// The event source behind one live subscription, shared by every
/// subscriber with the same key.
///
/// The source itself may back several descriptors (one per authorized
/// client), so the descriptor counts its own handlers.
pub struct SubscriptionDescriptor {
    key: SubscriptionKey,
    subscription: Arc<dyn SubscriptionHandle>,
    authorization: AuthorizeData,
    handlers: AtomicUsize,
}

impl SubscriptionDescriptor {
    #[must_use]
    pub fn new(
        key: SubscriptionKey,
        subscription: Arc<dyn SubscriptionHandle>,
        authorization: AuthorizeData,
    ) -> Self {
        Self {
            key,
            subscription,
            authorization,
            handlers: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    #[must_use]
    pub fn subscription(&self) -> &Arc<dyn SubscriptionHandle> {
        &self.subscription
    }

    #[must_use]
    pub fn authorization(&self) -> &AuthorizeData {
        &self.authorization
    }

    /// Subscribers attached through this descriptor.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.load(Ordering::Acquire)
    }

    fn detach(&self, handler: HandlerId) -> usize {
        self.subscription.detach(handler);
        let previous = self
            .handlers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("key", &self.key)
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// LiveSubscriptionRegistry
// ---------------------------------------------------------------------------

type OperationMap = HashMap<String, Arc<SubscriptionDescriptor>>;
type ContractMap = HashMap<String, OperationMap>;

/// Three-level map client -> contract -> operation -> descriptor.
///
/// Empty branches are pruned on removal. [`attach`](Self::attach) and
/// [`release`](Self::release) hold the client's shard lock across the
/// lookup and the handler change, so a descriptor is never removed while a
/// concurrent subscriber is attaching to it.
#[derive(Default)]
pub struct LiveSubscriptionRegistry {
    clients: DashMap<String, ContractMap>,
}

impl LiveSubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `descriptor` unless one already exists for its key. Returns the
    /// descriptor now registered under the key.
    pub fn register_handler(&self, descriptor: SubscriptionDescriptor) -> Arc<SubscriptionDescriptor> {
        let key = descriptor.key.clone();
        let mut client = self.clients.entry(key.client_id).or_default();
        let registered = client
            .entry(key.contract)
            .or_default()
            .entry(key.operation)
            .or_insert_with(|| Arc::new(descriptor));
        Arc::clone(registered)
    }

    #[must_use]
    pub fn get_handler(&self, key: &SubscriptionKey) -> Option<Arc<SubscriptionDescriptor>> {
        self.clients
            .get(&key.client_id)?
            .get(&key.contract)?
            .get(&key.operation)
            .cloned()
    }

    /// Removes the descriptor for `key`, pruning empty branches.
    pub fn remove_handler(&self, key: &SubscriptionKey) -> Option<Arc<SubscriptionDescriptor>> {
        let mut client = self.clients.get_mut(&key.client_id)?;
        let mut removed = None;
        if let Some(operations) = client.get_mut(&key.contract) {
            removed = operations.remove(&key.operation);
            if operations.is_empty() {
                client.remove(&key.contract);
            }
        }
        let empty = client.is_empty();
        drop(client);
        if empty {
            self.clients.remove_if(&key.client_id, |_, contracts| contracts.is_empty());
        }
        removed
    }

    /// Looks up or lazily creates the descriptor for `key`, then attaches
    /// `sink` to its event source.
    ///
    /// # Errors
    ///
    /// Returns the error of `create`; nothing is left registered.
    pub fn attach<F>(
        &self,
        key: &SubscriptionKey,
        create: F,
        sink: EventSink,
    ) -> Result<(Arc<SubscriptionDescriptor>, HandlerId), OperationError>
    where
        F: FnOnce() -> Result<SubscriptionDescriptor, OperationError>,
    {
        let mut client = self.clients.entry(key.client_id.clone()).or_default();
        let operations = client.entry(key.contract.clone()).or_default();

        let descriptor = if let Some(existing) = operations.get(&key.operation) {
            Arc::clone(existing)
        } else {
            match create() {
                Ok(created) => {
                    let created = Arc::new(created);
                    operations.insert(key.operation.clone(), Arc::clone(&created));
                    debug!(subscription = %key, "subscription source created");
                    created
                }
                Err(err) => {
                    if operations.is_empty() {
                        client.remove(&key.contract);
                    }
                    let empty = client.is_empty();
                    drop(client);
                    if empty {
                        self.clients.remove_if(&key.client_id, |_, contracts| contracts.is_empty());
                    }
                    return Err(err);
                }
            }
        };

        let handler = descriptor.subscription.attach(sink);
        descriptor.handlers.fetch_add(1, Ordering::AcqRel);
        drop(client);
        Ok((descriptor, handler))
    }

    /// Detaches `handler` and removes the descriptor once its last handler
    /// is gone. Returns `true` if the descriptor was removed.
    pub fn release(&self, descriptor: &Arc<SubscriptionDescriptor>, handler: HandlerId) -> bool {
        let key = &descriptor.key;
        let Some(mut client) = self.clients.get_mut(&key.client_id) else {
            descriptor.detach(handler);
            return false;
        };
        if descriptor.detach(handler) > 0 {
            return false;
        }

        let mut removed = false;
        if let Some(operations) = client.get_mut(&key.contract) {
            if operations
                .get(&key.operation)
                .is_some_and(|current| Arc::ptr_eq(current, descriptor))
            {
                operations.remove(&key.operation);
                removed = true;
            }
            if operations.is_empty() {
                client.remove(&key.contract);
            }
        }
        let empty = client.is_empty();
        drop(client);
        if empty {
            self.clients.remove_if(&key.client_id, |_, contracts| contracts.is_empty());
        }
        if removed {
            debug!(subscription = %key, "last subscriber left; source removed");
        }
        removed
    }

    /// Number of live descriptors across all clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients
            .iter()
            .map(|client| client.values().map(HashMap::len).sum::<usize>())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl fmt::Debug for LiveSubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSubscriptionRegistry")
            .field("clients", &self.clients.len())
            .field("descriptors", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// One attached subscriber. Dropping the lease releases it.
pub struct SubscriptionLease {
    registry: Arc<LiveSubscriptionRegistry>,
    descriptor: Arc<SubscriptionDescriptor>,
    handler: HandlerId,
}

impl SubscriptionLease {
    #[must_use]
    pub fn new(
        registry: Arc<LiveSubscriptionRegistry>,
        descriptor: Arc<SubscriptionDescriptor>,
        handler: HandlerId,
    ) -> Self {
        Self {
            registry,
            descriptor,
            handler,
        }
    }
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        self.registry.release(&self.descriptor, self.handler);
    }
}

impl fmt::Debug for SubscriptionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionLease")
            .field("key", &self.descriptor.key)
            .field("handler", &self.handler)
            .finish()
    }
}

/// Event stream that keeps its subscriber attached until dropped.
pub struct LeasedStream<S> {
    inner: S,
    _lease: SubscriptionLease,
}

impl<S> LeasedStream<S> {
    #[must_use]
    pub fn new(inner: S, lease: SubscriptionLease) -> Self {
        Self { inner, _lease: lease }
    }
}

impl<S: Stream + Unpin> Stream for LeasedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tether_core::{DynamicConverter, Element};

    use super::*;
    use crate::subscription::{Observer, Subscription};

    fn sink() -> (EventSink, Arc<Observer<Element>>) {
        let observer = Arc::new(Observer::new());
        (
            EventSink::new(Arc::clone(&observer), DynamicConverter::new()),
            observer,
        )
    }

    fn descriptor(key: &SubscriptionKey, source: &Subscription<u64>) -> SubscriptionDescriptor {
        SubscriptionDescriptor::new(key.clone(), Arc::new(source.clone()), AuthorizeData::default())
    }

    #[test]
    fn register_get_remove_prunes_branches() {
        let registry = LiveSubscriptionRegistry::new();
        let source = Subscription::<u64>::new();
        let a = SubscriptionKey::new("", "feed", "ticks");
        let b = SubscriptionKey::new("", "feed", "tocks");

        let first = registry.register_handler(descriptor(&a, &source));
        let again = registry.register_handler(descriptor(&a, &source));
        assert!(Arc::ptr_eq(&first, &again));
        registry.register_handler(descriptor(&b, &source));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove_handler(&a).is_some());
        assert!(registry.get_handler(&a).is_none());
        assert_eq!(registry.client_count(), 1);
        assert!(registry.remove_handler(&b).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove_handler(&b).is_none());
    }

    #[tokio::test]
    async fn two_subscribers_share_one_descriptor() {
        let registry = Arc::new(LiveSubscriptionRegistry::new());
        let source = Subscription::<u64>::new();
        let key = SubscriptionKey::new("", "feed", "ticks");

        let (sink_a, observer_a) = sink();
        let (sink_b, observer_b) = sink();
        let (first, handler_a) = registry
            .attach(&key, || Ok(descriptor(&key, &source)), sink_a)
            .unwrap();
        let (second, handler_b) = registry
            .attach(&key, || panic!("descriptor must be reused"), sink_b)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.emit(7), 2);

        let mut events_a = observer_a.take_stream().unwrap();
        let mut events_b = observer_b.take_stream().unwrap();
        assert_eq!(events_a.next().await, Some(Element::from(7)));
        assert_eq!(events_b.next().await, Some(Element::from(7)));

        assert!(!registry.release(&first, handler_a));
        assert!(registry.get_handler(&key).is_some());
        assert!(registry.release(&second, handler_b));
        assert!(registry.is_empty());
        assert_eq!(source.emit(8), 0);
    }

    #[test]
    fn failed_creation_leaves_nothing_behind() {
        let registry = LiveSubscriptionRegistry::new();
        let key = SubscriptionKey::new("alice", "feed", "ticks");
        let (sink, _observer) = sink();
        let err = registry
            .attach(&key, || Err(OperationError::Unauthorized), sink)
            .unwrap_err();
        assert!(matches!(err, OperationError::Unauthorized));
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_the_lease_releases_the_subscriber() {
        let registry = Arc::new(LiveSubscriptionRegistry::new());
        let source = Subscription::<u64>::new();
        let key = SubscriptionKey::new("", "feed", "ticks");
        let (sink, observer) = sink();
        let (descriptor, handler) = registry
            .attach(&key, || Ok(descriptor(&key, &source)), sink)
            .unwrap();

        let events = observer.take_stream().unwrap();
        let stream = LeasedStream::new(
            events,
            SubscriptionLease::new(Arc::clone(&registry), descriptor, handler),
        );
        assert_eq!(source.handler_count(), 1);
        drop(stream);
        assert_eq!(source.handler_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn clients_sharing_a_source_are_released_independently() {
        let registry = Arc::new(LiveSubscriptionRegistry::new());
        let source = Subscription::<u64>::new();
        let carol = SubscriptionKey::new("carol", "feed", "secure_ticks");
        let dave = SubscriptionKey::new("dave", "feed", "secure_ticks");

        let (sink_c, _observer_c) = sink();
        let (sink_d, _observer_d) = sink();
        let (for_carol, handler_c) = registry
            .attach(&carol, || Ok(descriptor(&carol, &source)), sink_c)
            .unwrap();
        let (for_dave, handler_d) = registry
            .attach(&dave, || Ok(descriptor(&dave, &source)), sink_d)
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(source.handler_count(), 2);
        assert_eq!(for_carol.handler_count(), 1);

        assert!(registry.release(&for_carol, handler_c));
        assert!(registry.get_handler(&carol).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(source.handler_count(), 1);

        assert!(registry.release(&for_dave, handler_d));
        assert!(registry.is_empty());
        assert_eq!(source.handler_count(), 0);
    }

    #[test]
    fn concurrent_subscribers_settle_to_an_empty_registry() {
        let registry = Arc::new(LiveSubscriptionRegistry::new());
        let source = Subscription::<u64>::new();
        let key = SubscriptionKey::new("", "feed", "ticks");

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let (registry, source, key) = (Arc::clone(&registry), source.clone(), key.clone());
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (sink, _observer) = sink();
                        let (descriptor, handler) = registry
                            .attach(&key, || Ok(descriptor(&key, &source)), sink)
                            .unwrap();
                        registry.release(&descriptor, handler);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.is_empty());
        assert_eq!(source.handler_count(), 0);
    }
}
