//! Bridge from push-style event handlers to a pull-style stream.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Unbounded channel whose write side never fails the caller.
///
/// Writes after the consumer went away are dropped and counted; the event
/// source that emitted them is unaffected.
pub struct Observer<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T: Send + 'static> Observer<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queues one value. Returns `false` if the consumer is gone.
    pub fn write(&self, value: T) -> bool {
        if self.tx.send(value).is_ok() {
            return true;
        }
        debug!("subscription consumer is gone; event dropped");
        metrics::counter!("tether_subscription_events_dropped_total").increment(1);
        false
    }

    /// The consuming stream. Only the first call returns `Some`.
    pub fn take_stream(&self) -> Option<ObserverStream<T>> {
        self.rx.lock().take().map(|rx| ObserverStream { rx })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T: Send + 'static> Default for Observer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Single-consumer stream over an [`Observer`]'s channel.
#[derive(Debug)]
pub struct ObserverStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Stream for ObserverStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn writes_are_delivered_in_order() {
        let observer = Observer::new();
        let mut stream = observer.take_stream().unwrap();
        assert!(observer.take_stream().is_none());

        assert!(observer.write(1));
        assert!(observer.write(2));
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
    }

    #[test]
    fn writes_after_consumer_drop_are_swallowed() {
        let observer = Observer::new();
        drop(observer.take_stream());
        assert!(observer.is_closed());
        assert!(!observer.write("late"));
    }
}
