use std::sync::RwLock;

use tokio::sync::mpsc;

use slotkv_protocol::{Notification, CHANNEL_CAPACITY};

/// One subscriber: the operations it listens to and its channel.
struct Subscriber {
    ops: Vec<String>,
    sender: mpsc::Sender<Notification>,
}

/// Fan-out of `(op, key)` notifications published by a chain tail.
#[derive(Default)]
pub struct SubscriptionMap {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `ops`. An empty list subscribes to everything.
    pub fn subscribe(&self, ops: Vec<String>) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .write()
            .expect("router lock poisoned")
            .push(Subscriber { ops, sender: tx });
        rx
    }

    /// Deliver a notification to every matching subscriber.
    ///
    /// Closed subscribers are pruned. A subscriber whose channel is full
    /// misses the notification.
    pub fn notify(&self, op: &str, key: &str) {
        let mut subs = self.subscribers.write().expect("router lock poisoned");
        subs.retain(|sub| {
            if sub.sender.is_closed() {
                return false;
            }
            if sub.ops.is_empty() || sub.ops.iter().any(|o| o == op) {
                let _ = sub.sender.try_send(Notification {
                    op: op.to_string(),
                    key: key.to_string(),
                });
            }
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("router lock poisoned").len()
    }

    pub fn clear(&self) {
        self.subscribers.write().expect("router lock poisoned").clear();
    }
}

impl std::fmt::Debug for SubscriptionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMap")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_matching_ops() {
        let map = SubscriptionMap::new();
        let mut puts = map.subscribe(vec!["put".into()]);
        let mut all = map.subscribe(Vec::new());

        map.notify("put", "a");
        map.notify("remove", "b");

        assert_eq!(puts.recv().await.unwrap(), Notification { op: "put".into(), key: "a".into() });
        assert!(puts.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap().key, "a");
        assert_eq!(all.recv().await.unwrap().key, "b");
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let map = SubscriptionMap::new();
        let rx = map.subscribe(vec!["put".into()]);
        let _keep = map.subscribe(vec!["put".into()]);
        drop(rx);
        map.notify("put", "a");
        assert_eq!(map.subscriber_count(), 1);
    }
}
