use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use carpool_types::{ChangeEvent, Scope};
use carpool_sync::Subscription;

/// Fans committed changes out to every open subscription.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<ChangeFeedInner>,
}

struct ChangeFeedInner {
    /// Every subscription sees every event and filters by its own scope
    broadcast_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(ChangeFeedInner { broadcast_tx }),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        debug!(entity = ?event.kind(), operation = ?event.operation(), "publishing change");
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Open a scoped subscription. Events published after this returns are
    /// delivered until the subscription's handle is released.
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        let mut rx = self.inner.broadcast_tx.subscribe();
        let (subscription, sink) = Subscription::channel(scope);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = sink.released() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(topic = %scope.topic(), skipped = n, "subscription lagged, changes dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if !sink.deliver(event).await {
                    break;
                }
            }
            debug!(handle = %sink.id(), topic = %scope.topic(), "subscription closed");
        });

        subscription
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.broadcast_tx.receiver_count()
    }
}
