// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted in-process message bus.
//!
//! Every message is written to the store before it is delivered. Delivery is
//! synchronous on the sender's call: the handler subscribed for
//! `to_agent_id` is invoked, or every broadcast listener (in registration
//! order) when the message has no recipient. Handlers that need to do async
//! work spawn it, so one sender's messages reach a recipient in send order.
//!
//! Reports carry the id of the directive they answer in `correlation_id`;
//! [`MessageBus::request`] uses that to await a reply.

pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use crate::error::BusError;
use crate::store::Store;

pub use types::{BusMessage, HistoryFilter, HistoryPage, MessageType};

/// Callback invoked for each delivered message.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Handle returned by [`MessageBus::on_broadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct BusInner {
    store: Arc<Store>,
    subscribers: RwLock<HashMap<String, MessageHandler>>,
    broadcast: RwLock<Vec<(ListenerId, MessageHandler)>>,
    pending: Mutex<HashMap<String, oneshot::Sender<BusMessage>>>,
    next_listener: AtomicU64,
}

/// Cheaply cloneable bus handle.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MessageBus {
    /// Create a bus persisting to `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                subscribers: RwLock::new(HashMap::new()),
                broadcast: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Persist and deliver a message.
    ///
    /// Assigns an id when the message has none. The message is delivered
    /// only after it has been persisted.
    #[instrument(skip(self, message), fields(kind = %message.message_type))]
    pub fn send(&self, mut message: BusMessage) -> Result<BusMessage, BusError> {
        if message.id.is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        self.inner.store.insert_message(&message)?;
        trace!(
            id = %message.id,
            from = ?message.from_agent_id,
            to = ?message.to_agent_id,
            "Message persisted"
        );

        if message.message_type == MessageType::Report {
            if let Some(correlation) = message.correlation_id.as_deref() {
                if let Some(waiter) = lock(&self.inner.pending).remove(correlation) {
                    let _ = waiter.send(message.clone());
                }
            }
        }

        match message.to_agent_id.as_deref() {
            Some(to) => {
                let handler = read(&self.inner.subscribers).get(to).cloned();
                match handler {
                    Some(handler) => handler(message.clone()),
                    None => debug!(to, "No subscriber for message; persisted only"),
                }
            }
            None => {
                let listeners: Vec<MessageHandler> = read(&self.inner.broadcast)
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                for listener in listeners {
                    listener(message.clone());
                }
            }
        }

        Ok(message)
    }

    /// Register the handler for an agent, replacing any previous one.
    pub fn subscribe(&self, agent_id: &str, handler: MessageHandler) {
        if write(&self.inner.subscribers)
            .insert(agent_id.to_string(), handler)
            .is_some()
        {
            warn!(agent_id, "Replaced existing bus subscription");
        }
    }

    /// Remove an agent's handler. Returns whether one was registered.
    pub fn unsubscribe(&self, agent_id: &str) -> bool {
        write(&self.inner.subscribers).remove(agent_id).is_some()
    }

    /// Whether an agent currently has a handler.
    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        read(&self.inner.subscribers).contains_key(agent_id)
    }

    /// Register a listener for broadcast messages.
    pub fn on_broadcast(&self, handler: MessageHandler) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        write(&self.inner.broadcast).push((id, handler));
        id
    }

    /// Remove a broadcast listener.
    pub fn off_broadcast(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.inner.broadcast);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Send `message` to `to` and wait for the report correlated with it.
    pub async fn request(
        &self,
        to: &str,
        mut message: BusMessage,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        message.to_agent_id = Some(to.to_string());
        if message.id.is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        let id = message.id.clone();

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        if let Err(e) = self.send(message) {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(BusError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Query persisted history.
    pub fn get_history(&self, filter: &HistoryFilter) -> Result<HistoryPage, BusError> {
        Ok(self.inner.store.history(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> MessageBus {
        MessageBus::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn collector() -> (MessageHandler, Arc<Mutex<Vec<BusMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg| sink.lock().unwrap().push(msg));
        (handler, seen)
    }

    #[test]
    fn test_send_assigns_id_and_persists() {
        let bus = bus();
        let sent = bus
            .send(BusMessage::directive(Some("lead"), "w1", "build it"))
            .unwrap();
        assert!(!sent.id.is_empty());

        let history = bus.get_history(&HistoryFilter::agent("w1")).unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].id, sent.id);
    }

    #[test]
    fn test_directed_delivery_preserves_order() {
        let bus = bus();
        let (handler, seen) = collector();
        bus.subscribe("w1", handler);

        for i in 0..10 {
            bus.send(BusMessage::directive(Some("lead"), "w1", format!("{}", i)))
                .unwrap();
        }
        bus.send(BusMessage::directive(Some("lead"), "w2", "other"))
            .unwrap();

        let contents: Vec<String> = seen.lock().unwrap().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn test_broadcast_reaches_listeners_in_order() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let first = bus.on_broadcast(Arc::new(move |_| a.lock().unwrap().push("first")));
        bus.on_broadcast(Arc::new(move |_| b.lock().unwrap().push("second")));

        bus.send(BusMessage::status("w1", "idle")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        assert!(bus.off_broadcast(first));
        bus.send(BusMessage::status("w1", "busy")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "second"]);
    }

    #[test]
    fn test_directed_message_skips_broadcast_listeners() {
        let bus = bus();
        let (handler, seen) = collector();
        bus.on_broadcast(handler);
        bus.send(BusMessage::directive(None, "w1", "x")).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = bus();
        let (handler, seen) = collector();
        bus.subscribe("w1", handler);
        assert!(bus.unsubscribe("w1"));
        assert!(!bus.is_subscribed("w1"));
        bus.send(BusMessage::directive(None, "w1", "x")).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_resolves_on_correlated_report() {
        let bus = bus();
        let replier = bus.clone();
        bus.subscribe(
            "w1",
            Arc::new(move |msg: BusMessage| {
                let bus = replier.clone();
                tokio::spawn(async move {
                    bus.send(BusMessage::report("w1", Some("lead"), "done", Some(&msg.id)))
                        .unwrap();
                });
            }),
        );

        let reply = bus
            .request(
                "w1",
                BusMessage::directive(Some("lead"), "w1", "task"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.content, "done");
        assert_eq!(reply.message_type, MessageType::Report);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let bus = bus();
        let err = bus
            .request(
                "nobody",
                BusMessage::directive(None, "nobody", "hello"),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(50)));
    }
}
