use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use courier_types::events::FeedEvent;
use courier_types::models::AccountId;

/// Capacity of the broadcast ring. Slow listeners that fall further behind
/// than this skip ahead and log the gap.
const BROADCAST_CAPACITY: usize = 1024;

/// A feed event serialized once, shared by every listener.
#[derive(Debug, Clone)]
pub struct FeedFrame {
    /// Account the event belongs to. `None` reaches every listener.
    pub account_id: Option<AccountId>,
    pub json: Arc<str>,
}

/// A connected feed listener.
#[derive(Debug, Clone)]
pub struct Listener {
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
}

/// Manages connected listeners and broadcasts feed events.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every listener receives every frame and filters by its own subscription.
    broadcast_tx: broadcast::Sender<FeedFrame>,

    /// connection_id -> listener
    listeners: RwLock<HashMap<Uuid, Listener>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to feed frames. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedFrame> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected listeners.
    ///
    /// Returns how many receivers the frame reached. Having no listeners is
    /// not an error.
    pub fn broadcast(&self, event: &FeedEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize feed event: {}", e);
                return 0;
            }
        };

        let frame = FeedFrame {
            account_id: event.account_id().cloned(),
            json: json.into(),
        };

        match self.inner.broadcast_tx.send(frame) {
            Ok(n) => n,
            Err(_) => {
                debug!("Feed event dropped, no listeners connected");
                0
            }
        }
    }

    pub async fn register_listener(&self) -> Listener {
        let listener = Listener {
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
        };
        self.inner
            .listeners
            .write()
            .await
            .insert(listener.connection_id, listener.clone());
        listener
    }

    pub async fn unregister_listener(&self, connection_id: Uuid) {
        self.inner.listeners.write().await.remove(&connection_id);
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.listeners.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use courier_types::models::DeliveryStatus;

    use super::*;

    fn status_event(account: &str) -> FeedEvent {
        FeedEvent::MessageStatus {
            message_id: "m1".into(),
            account_id: AccountId::new(account),
            status: DeliveryStatus::Delivered,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        assert_eq!(dispatcher.broadcast(&status_event("acc_1")), 2);

        for rx in [&mut a, &mut b] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.account_id, Some(AccountId::new("acc_1")));
            let value: serde_json::Value = serde_json::from_str(&frame.json).unwrap();
            assert_eq!(value["type"], "MessageStatus");
            assert_eq!(value["data"]["status"], "delivered");
        }
    }

    #[tokio::test]
    async fn broadcast_without_listeners_is_a_no_op() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.broadcast(&status_event("acc_1")), 0);
    }

    #[tokio::test]
    async fn listener_registry_tracks_connections() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.register_listener().await;
        let second = dispatcher.register_listener().await;
        assert_eq!(dispatcher.listener_count().await, 2);

        dispatcher.unregister_listener(first.connection_id).await;
        assert_eq!(dispatcher.listener_count().await, 1);

        dispatcher.unregister_listener(second.connection_id).await;
        assert_eq!(dispatcher.listener_count().await, 0);
    }
}
