//! In-process broker.
//!
//! Routes messages between clients of the same process with MQTT semantics:
//! wildcard filters, retained messages replayed on subscribe, and last-will on
//! ungraceful drops. Used by same-process deployments and by the test suites.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::{topic_matches, PublishOptions, Transport, TransportEvent, Will};
use crate::error::TransportError;

struct ClientSlot {
    filters: Vec<String>,
    tx: UnboundedSender<TransportEvent>,
    will: Option<Will>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientSlot>,
    retained: BTreeMap<String, Vec<u8>>,
}

/// Shared in-memory broker; cloning yields another handle to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client; the receiver starts with [`TransportEvent::Connected`]
    pub fn connect(&self, client_id: impl Into<String>) -> (MemoryTransport, UnboundedReceiver<TransportEvent>) {
        self.connect_inner(client_id.into(), None)
    }

    /// Connect a client with a last-will message
    pub fn connect_with_will(
        &self,
        client_id: impl Into<String>,
        will: Will,
    ) -> (MemoryTransport, UnboundedReceiver<TransportEvent>) {
        self.connect_inner(client_id.into(), Some(will))
    }

    fn connect_inner(&self, client_id: String, will: Option<Will>) -> (MemoryTransport, UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        let previous = lock(&self.state).clients.insert(
            client_id.clone(),
            ClientSlot { filters: Vec::new(), tx, will },
        );
        if previous.is_some() {
            warn!("Client id {} reconnected, previous session dropped", client_id);
        }
        debug!("Memory broker client connected: {}", client_id);
        let transport = MemoryTransport { broker: self.clone(), client_id };
        (transport, rx)
    }

    /// Simulate a connection loss followed by a successful reconnect.
    ///
    /// The session is clean: all subscriptions of the client are gone.
    pub fn interrupt(&self, client_id: &str) {
        let mut state = lock(&self.state);
        if let Some(slot) = state.clients.get_mut(client_id) {
            slot.filters.clear();
            let _ = slot.tx.send(TransportEvent::Reconnecting);
            let _ = slot.tx.send(TransportEvent::Connected);
        }
    }

    /// Drop a client ungracefully, publishing its last-will
    pub fn kill(&self, client_id: &str) {
        let slot = lock(&self.state).clients.remove(client_id);
        if let Some(slot) = slot {
            let _ = slot.tx.send(TransportEvent::Disconnected);
            if let Some(will) = slot.will {
                self.route(&will.topic, will.payload, PublishOptions { retain: will.retain, ..Default::default() });
            }
        }
    }

    /// Currently retained payload of a topic
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.state).retained.get(topic).cloned()
    }

    /// Filters currently held by a client
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        lock(&self.state)
            .clients
            .get(client_id)
            .map(|slot| slot.filters.clone())
            .unwrap_or_default()
    }

    fn route(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) {
        let mut state = lock(&self.state);
        if options.retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }
        for slot in state.clients.values() {
            if slot.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = slot.tx.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

/// Client handle of a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
}

impl MemoryTransport {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<(), TransportError> {
        if !lock(&self.broker.state).clients.contains_key(&self.client_id) {
            return Err(TransportError::NotConnected);
        }
        self.broker.route(topic, payload, options);
        Ok(())
    }

    async fn subscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().unwrap_or_else(PoisonError::into_inner);
        let BrokerState { clients, retained } = &mut *state;
        let slot = clients.get_mut(&self.client_id).ok_or(TransportError::NotConnected)?;
        for filter in filters {
            if !slot.filters.contains(filter) {
                slot.filters.push(filter.clone());
            }
            for (topic, payload) in retained.iter() {
                if topic_matches(filter, topic) {
                    let _ = slot.tx.send(TransportEvent::Message {
                        topic: topic.clone(),
                        payload: payload.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        let mut state = lock(&self.broker.state);
        let slot = state.clients.get_mut(&self.client_id).ok_or(TransportError::NotConnected)?;
        slot.filters.retain(|f| !filters.contains(f));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let slot = lock(&self.broker.state).clients.remove(&self.client_id);
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(TransportEvent::Disconnected);
                debug!("Memory broker client disconnected: {}", self.client_id);
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn message(topic: &str, payload: &[u8]) -> TransportEvent {
        TransportEvent::Message { topic: topic.to_string(), payload: payload.to_vec() }
    }

    #[tokio::test]
    async fn test_routing_and_retained_replay() {
        let broker = MemoryBroker::new();
        let (publisher, _pub_rx) = broker.connect("pub");
        let (subscriber, mut sub_rx) = broker.connect("sub");
        assert_eq!(drain(&mut sub_rx), vec![TransportEvent::Connected]);

        publisher.publish("a/b/info", b"retained".to_vec(), PublishOptions::retained()).await.unwrap();
        publisher.publish("a/b/live", b"lost".to_vec(), PublishOptions::default()).await.unwrap();

        subscriber.subscribe(&["a/+/info".to_string(), "a/b/live".to_string()]).await.unwrap();
        assert_eq!(drain(&mut sub_rx), vec![message("a/b/info", b"retained")]);

        publisher.publish("a/b/live", b"seen".to_vec(), PublishOptions::default()).await.unwrap();
        assert_eq!(drain(&mut sub_rx), vec![message("a/b/live", b"seen")]);

        publisher.publish("a/b/info", Vec::new(), PublishOptions::retained()).await.unwrap();
        assert!(broker.retained("a/b/info").is_none());

        subscriber.unsubscribe(&["a/b/live".to_string()]).await.unwrap();
        publisher.publish("a/b/live", b"gone".to_vec(), PublishOptions::default()).await.unwrap();
        assert_eq!(drain(&mut sub_rx), vec![message("a/b/info", b"")]);
    }

    #[tokio::test]
    async fn test_will_and_interrupt() {
        let broker = MemoryBroker::new();
        let will = Will { topic: "p/agent/__agentInfo__".to_string(), payload: b"offline".to_vec(), retain: true };
        let (agent, mut agent_rx) = broker.connect_with_will("agent", will);
        let (watcher, mut watcher_rx) = broker.connect("watcher");
        watcher.subscribe(&["p/+/__agentInfo__".to_string()]).await.unwrap();
        agent.subscribe(&["p/agent/x".to_string()]).await.unwrap();

        broker.interrupt("agent");
        assert!(broker.subscriptions("agent").is_empty());
        assert_eq!(
            drain(&mut agent_rx),
            vec![TransportEvent::Connected, TransportEvent::Reconnecting, TransportEvent::Connected]
        );

        broker.kill("agent");
        assert_eq!(drain(&mut agent_rx), vec![TransportEvent::Disconnected]);
        assert_eq!(broker.retained("p/agent/__agentInfo__"), Some(b"offline".to_vec()));
        assert_eq!(
            drain(&mut watcher_rx),
            vec![TransportEvent::Connected, message("p/agent/__agentInfo__", b"offline")]
        );
        assert!(matches!(
            agent.publish("x", Vec::new(), PublishOptions::default()).await,
            Err(TransportError::NotConnected)
        ));
    }
}
