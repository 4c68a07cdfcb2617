//! Per-deal pub/sub and cancellation.
//!
//! Every live deal owns a [`DealHandler`]: a stateful bus carrying the
//! deal's state updates, and the cancellation token a user-issued cancel
//! trips. The provider keeps one more [`StatefulBus`] for broadcasting
//! newly accepted deals.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::ProviderDealState;

/// A latest-value-cached broadcast bus.
///
/// New subscribers immediately receive the most recently published value;
/// from then on they see every published value, in publish order. Each
/// subscriber has its own unbounded queue so a slow consumer cannot stall
/// the publisher or the other subscribers.
pub struct StatefulBus<T: Clone> {
    inner: Mutex<BusInner<T>>,
}

struct BusInner<T> {
    cached: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// A handle on a [`StatefulBus`] subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// The next published value, or `None` once the bus is closed and
    /// everything already published has been consumed.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl<T> futures::Stream for Subscription<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T: Clone> StatefulBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                cached: None,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock().expect("bus lock is never poisoned");
        if inner.closed {
            return;
        }
        inner.cached = Some(value.clone());
        // Dead subscribers are dropped on the way through.
        inner
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("bus lock is never poisoned");
        if !inner.closed {
            if let Some(cached) = &inner.cached {
                // A fresh subscriber always starts from the current state.
                let _ = tx.send(cached.clone());
            }
            inner.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Close the bus: existing subscriptions end after draining what was
    /// already published, later subscriptions end immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("bus lock is never poisoned");
        inner.closed = true;
        inner.subscribers.clear();
        inner.cached = None;
    }
}

impl<T: Clone> Default for StatefulBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-deal execution handle: state update bus plus cancel signal.
pub struct DealHandler {
    pub deal_uuid: Uuid,
    bus: StatefulBus<ProviderDealState>,
    cancel: CancellationToken,
}

impl DealHandler {
    pub fn new(deal_uuid: Uuid) -> Self {
        Self {
            deal_uuid,
            bus: StatefulBus::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<ProviderDealState> {
        self.bus.subscribe()
    }

    pub(crate) fn publish(&self, deal: ProviderDealState) {
        self.bus.publish(deal);
    }

    /// Token tripped when the user cancels the deal. Deliberately separate
    /// from the daemon's shutdown token: a cancelled deal still gets to
    /// persist its terminal state.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn trigger_cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn close(&self) {
        self.bus.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscribers_get_the_cached_state_first() {
        let bus = StatefulBus::new();
        bus.publish(1u64);
        bus.publish(2u64);

        let mut sub = bus.subscribe();
        assert_eq!(sub.next().await, Some(2));

        bus.publish(3u64);
        assert_eq!(sub.next().await, Some(3));
    }

    #[tokio::test]
    async fn updates_arrive_in_publish_order() {
        let bus = StatefulBus::new();
        let mut sub = bus.subscribe();

        for i in 0..10u64 {
            bus.publish(i);
        }
        for i in 0..10u64 {
            assert_eq!(sub.next().await, Some(i));
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_update() {
        let bus = StatefulBus::new();
        bus.publish("first".to_string());

        let mut early = bus.subscribe();
        bus.publish("second".to_string());
        let mut late = bus.subscribe();

        assert_eq!(early.next().await.as_deref(), Some("first"));
        assert_eq!(early.next().await.as_deref(), Some("second"));
        // The late subscriber starts from the latest value only.
        assert_eq!(late.next().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn subscription_works_as_a_stream() {
        use futures::StreamExt;

        let bus = StatefulBus::new();
        let sub = bus.subscribe();
        for i in 0..4u64 {
            bus.publish(i);
        }
        bus.close();

        let collected: Vec<u64> = sub.collect().await;
        assert_eq!(collected, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = StatefulBus::new();
        let mut sub = bus.subscribe();
        bus.publish(7u64);
        bus.close();

        // What was published before the close still drains.
        assert_eq!(sub.next().await, Some(7));
        assert_eq!(sub.next().await, None);

        // Subscriptions taken after the close end immediately.
        let mut dead = bus.subscribe();
        assert_eq!(dead.next().await, None);
    }

    #[test]
    fn handler_cancel_trips_its_token() {
        let handler = DealHandler::new(Uuid::new_v4());
        let token = handler.cancel_token();
        assert!(!token.is_cancelled());
        handler.trigger_cancel();
        assert!(token.is_cancelled());
    }
}
