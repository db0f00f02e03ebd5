//! Subscriber registry with unsubscribe-on-drop handles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use super::types::SignalingEvent;

#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    senders: Mutex<BTreeMap<u64, mpsc::UnboundedSender<SignalingEvent>>>,
    closed: AtomicBool,
}

impl Subscribers {
    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut senders = self.lock();
        // After close the sender is dropped here, so `recv` ends at once.
        if !self.closed.load(Ordering::Acquire) {
            senders.insert(id, tx);
        }
        drop(senders);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver to every live subscriber, pruning the ones that went away.
    pub(crate) fn publish(&self, event: SignalingEvent) {
        self.lock().retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every sender. Subscribers drain what is queued, then see `None`.
    pub(crate) fn close(&self) {
        let mut senders = self.lock();
        self.closed.store(true, Ordering::Release);
        senders.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, mpsc::UnboundedSender<SignalingEvent>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A registered listener. Dropping it (or calling [`unsubscribe`]) removes
/// it from the channel.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalingEvent>,
    registry: Weak<Subscribers>,
}

impl Subscription {
    /// Next event, or `None` once the connection task has exited and every
    /// queued event was received.
    pub async fn recv(&mut self) -> Option<SignalingEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::TransportState;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let registry = Arc::new(Subscribers::default());
        let mut a = registry.subscribe();
        let mut b = registry.subscribe();

        registry.publish(SignalingEvent::StateChanged(TransportState::Connecting));

        assert_eq!(
            a.recv().await,
            Some(SignalingEvent::StateChanged(TransportState::Connecting))
        );
        assert_eq!(
            b.recv().await,
            Some(SignalingEvent::StateChanged(TransportState::Connecting))
        );
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let registry = Arc::new(Subscribers::default());
        let a = registry.subscribe();
        let mut b = registry.subscribe();
        assert_eq!(registry.len(), 2);

        a.unsubscribe();
        assert_eq!(registry.len(), 1);

        registry.publish(SignalingEvent::StateChanged(TransportState::Active));
        assert_eq!(
            b.try_recv(),
            Some(SignalingEvent::StateChanged(TransportState::Active))
        );
    }

    #[tokio::test]
    async fn close_ends_current_and_later_subscriptions() {
        let registry = Arc::new(Subscribers::default());
        let mut early = registry.subscribe();

        registry.publish(SignalingEvent::StateChanged(TransportState::Closed));
        registry.close();
        assert_eq!(registry.len(), 0);

        assert_eq!(
            early.recv().await,
            Some(SignalingEvent::StateChanged(TransportState::Closed))
        );
        assert_eq!(early.recv().await, None);

        let mut late = registry.subscribe();
        assert_eq!(late.recv().await, None);
        registry.publish(SignalingEvent::StateChanged(TransportState::Active));
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let registry = Arc::new(Subscribers::default());
        let mut sub = registry.subscribe();
        drop(registry);
        assert_eq!(sub.try_recv(), None);
        drop(sub);
    }
}
