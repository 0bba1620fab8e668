//! Event-driven subscriptions.
//!
//! - [`event`]: `Subscription<T>` event sources and their type-erased handle
//! - [`observer`]: Push-to-pull bridge feeding one consumer stream
//! - [`registry`]: Live descriptors shared by subscribers of the same key

pub mod event;
pub mod observer;
pub mod registry;

pub use event::{EventSink, HandlerId, Subscription, SubscriptionHandle};
pub use observer::{Observer, ObserverStream};
pub use registry::{
    LeasedStream, LiveSubscriptionRegistry, SubscriptionDescriptor, SubscriptionKey,
    SubscriptionLease,
};
