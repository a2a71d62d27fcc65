//! # State-Change Notifier
//!
//! Process-local publish/subscribe registry for call state changes. A
//! subscriber registers interest in one call or in all updates and gets a
//! bounded channel; the processor publishes an event after each committed
//! transition.
//!
//! ## Delivery Semantics:
//! Best-effort fan-out. A subscriber whose buffer is full or whose receiver
//! is gone is dropped from the registry rather than back-pressuring the
//! publisher. No persistence, no replay: subscribers only see events
//! published after they register. Per-subscriber delivery follows publish
//! order; nothing is guaranteed across subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::store::models::{CallAiResult, CallState};

/// Events buffered per subscriber before it is considered too slow.
const SUBSCRIBER_BUFFER: usize = 64;

/// One committed call state transition, as pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct CallUpdate {
    pub call_id: String,
    pub state: CallState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_result: Option<CallAiResult>,
}

/// A live registration. Dropping the receiver ends the subscription; the
/// registry notices on the next publish.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<CallUpdate>,
}

struct SubscriberHandle {
    sender: mpsc::Sender<CallUpdate>,
    /// `None` subscribes to every call.
    call_id: Option<String>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<Uuid, SubscriberHandle>,
    all: HashSet<Uuid>,
    by_call: HashMap<String, HashSet<Uuid>>,
}

/// Subscription registry with best-effort fan-out.
pub struct Notifier {
    registry: RwLock<Registry>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Register a subscriber for one call, or for all updates when
    /// `call_id` is `None`.
    pub fn subscribe(&self, call_id: Option<String>) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();

        let mut registry = self.registry.write().unwrap();
        match &call_id {
            Some(call) => {
                registry.by_call.entry(call.clone()).or_default().insert(id);
            }
            None => {
                registry.all.insert(id);
            }
        }
        registry.subscribers.insert(id, SubscriberHandle { sender, call_id });
        debug!(subscriber = %id, "subscriber registered");

        Subscription { id, receiver }
    }

    /// Remove a subscriber from the registry. Safe to call twice.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut registry = self.registry.write().unwrap();
        remove_subscriber(&mut registry, id);
    }

    /// Current number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.read().unwrap().subscribers.len()
    }

    /// Deliver an event to every matching subscriber. Subscribers that are
    /// full or gone are evicted; each live subscriber receives one copy.
    pub fn publish(&self, event: &CallUpdate) {
        let mut dead = Vec::new();
        {
            let registry = self.registry.read().unwrap();
            let call_set = registry.by_call.get(&event.call_id);
            let targets = registry
                .all
                .iter()
                .chain(call_set.into_iter().flatten());

            for id in targets {
                let Some(handle) = registry.subscribers.get(id) else {
                    continue;
                };
                if handle.sender.try_send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.write().unwrap();
            for id in dead {
                debug!(subscriber = %id, "dropping slow or disconnected subscriber");
                remove_subscriber(&mut registry, id);
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(registry: &mut Registry, id: Uuid) {
    let Some(handle) = registry.subscribers.remove(&id) else {
        return;
    };
    match handle.call_id {
        Some(call) => {
            if let Some(set) = registry.by_call.get_mut(&call) {
                set.remove(&id);
                if set.is_empty() {
                    registry.by_call.remove(&call);
                }
            }
        }
        None => {
            registry.all.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(call_id: &str, state: CallState) -> CallUpdate {
        CallUpdate {
            call_id: call_id.to_string(),
            state,
            timestamp: Utc::now(),
            ai_result: None,
        }
    }

    #[tokio::test]
    async fn test_global_subscriber_sees_every_call() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(None);

        notifier.publish(&update("a", CallState::ProcessingAi));
        notifier.publish(&update("b", CallState::Completed));

        assert_eq!(sub.receiver.recv().await.unwrap().call_id, "a");
        assert_eq!(sub.receiver.recv().await.unwrap().call_id, "b");
    }

    #[tokio::test]
    async fn test_call_subscriber_is_filtered() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(Some("a".to_string()));

        notifier.publish(&update("b", CallState::ProcessingAi));
        notifier.publish(&update("a", CallState::Completed));

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.call_id, "a");
        assert_eq!(event.state, CallState::Completed);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delivery_follows_publish_order() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(Some("a".to_string()));

        for state in [
            CallState::ProcessingAi,
            CallState::Failed,
            CallState::ProcessingAi,
            CallState::Completed,
        ] {
            notifier.publish(&update("a", state));
        }

        let mut seen = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            seen.push(event.state);
        }
        assert_eq!(
            seen,
            vec![
                CallState::ProcessingAi,
                CallState::Failed,
                CallState::ProcessingAi,
                CallState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let notifier = Notifier::new();
        let _sub = notifier.subscribe(None);
        assert_eq!(notifier.subscriber_count(), 1);

        // Never drained; one publish past the buffer evicts it.
        for _ in 0..=SUBSCRIBER_BUFFER {
            notifier.publish(&update("a", CallState::ProcessingAi));
        }
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_evicted() {
        let notifier = Notifier::new();
        let sub = notifier.subscribe(Some("a".to_string()));
        drop(sub.receiver);

        notifier.publish(&update("a", CallState::Completed));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let notifier = Notifier::new();
        let mut sub = notifier.subscribe(None);
        notifier.unsubscribe(sub.id);

        notifier.publish(&update("a", CallState::Completed));
        assert!(sub.receiver.try_recv().is_err());
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
