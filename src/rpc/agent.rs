//! Agent: the dispatcher side of the protocol.
//!
//! Turns transport messages into registry calls and publishes the replies.
//! The subscription set follows the instance population: static topics of every
//! class are always held, member topics of an instance are added when it is
//! created and dropped when it is deleted.

use futures_util::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{Adapter, CallRequest};
use crate::error::{RpcError, RpcResult};
use crate::rpc::common::{
    unique_function_names, AgentIdentity, AgentInfo, AgentStatus, CallbackMessage, ClassInfo, Envelope, ParsedTopic,
    CREATE, CREATE_NAMED, DELETE, GET_NAMED, LOCAL_SENDER_PREFIX,
};
use crate::setting::AgentConfig;
use crate::transport::{PublishOptions, Transport, TransportEvent};

/// Connection state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Ending,
}

/// Dispatcher binding one registry to one transport
pub struct Agent {
    config: AgentConfig,
    adapter: Arc<dyn Adapter>,
    transport: Arc<dyn Transport>,
    /// Live instances per class, as seen through this agent
    instances: Mutex<BTreeMap<String, BTreeSet<String>>>,
    /// Topics currently subscribed
    subscriptions: Mutex<BTreeSet<String>>,
    state: watch::Sender<AgentState>,
    callbacks: Mutex<Option<UnboundedReceiver<CallbackMessage>>>,
}

impl Agent {
    pub fn new(config: AgentConfig, adapter: Arc<dyn Adapter>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        adapter.on_callback(Arc::new(move |message: &CallbackMessage| {
            // Same-process callers consume their own callbacks
            if message.sender.starts_with(LOCAL_SENDER_PREFIX) {
                return;
            }
            if callback_tx.send(message.clone()).is_err() {
                debug!("Agent stopped, dropped callback for {}", message.id);
            }
        }));

        let (state, _) = watch::channel(AgentState::Disconnected);
        Arc::new(Self {
            config,
            adapter,
            transport,
            instances: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
            state,
            callbacks: Mutex::new(Some(callback_rx)),
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.config.identity
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Topics currently subscribed, sorted
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.iter().cloned().collect()
    }

    /// Live instance ids of a class, sorted
    pub async fn instances(&self, class_name: &str) -> Vec<String> {
        self.instances
            .lock()
            .await
            .get(class_name)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Agent {} state: {:?} -> {:?}", self.identity().base_topic(), previous, state);
        }
    }

    /// Wait until the agent reaches `target`
    pub async fn wait_until_state(&self, target: AgentState, timeout: Duration) -> RpcResult<()> {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .map(|waited| waited.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                method: format!("wait for {:?}", target),
            }),
        }
    }

    /// Drive the agent from the transport's event stream.
    ///
    /// The returned task ends when the transport reports `Disconnected` or its
    /// event stream closes.
    pub fn serve(self: &Arc<Self>, mut events: UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            let Some(mut callbacks) = agent.callbacks.lock().await.take() else {
                error!("Agent {} is already being served", agent.identity().base_topic());
                return;
            };
            agent.set_state(AgentState::Connecting);
            info!("Agent {} started", agent.identity().base_topic());

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(TransportEvent::Connected) => agent.on_connected().await,
                        Some(TransportEvent::Reconnecting) => {
                            warn!("Agent {} lost its connection, reconnecting", agent.identity().base_topic());
                            agent.set_state(AgentState::Reconnecting);
                        }
                        Some(TransportEvent::Message { topic, payload }) => agent.handle_message(&topic, &payload).await,
                        Some(TransportEvent::Disconnected) | None => break,
                    },
                    Some(message) = callbacks.recv() => agent.forward_callback(message).await,
                }
            }

            agent.set_state(AgentState::Disconnected);
            info!("Agent {} stopped", agent.identity().base_topic());
        })
    }

    fn static_topics(&self, class_name: &str) -> Vec<String> {
        unique_function_names(&self.adapter.static_functions(class_name))
            .iter()
            .map(|function| self.identity().static_topic(class_name, function))
            .collect()
    }

    fn instance_topics(&self, class_name: &str, instance_id: &str) -> Vec<String> {
        unique_function_names(&self.adapter.member_functions(class_name))
            .iter()
            .map(|function| self.identity().instance_topic(class_name, instance_id, function))
            .collect()
    }

    async fn subscribe(&self, topics: Vec<String>) {
        if topics.is_empty() {
            return;
        }
        match self.transport.subscribe(&topics).await {
            Ok(()) => {
                debug!("Subscribed to {} topics", topics.len());
                self.subscriptions.lock().await.extend(topics);
            }
            Err(e) => error!("Failed to subscribe: {}", e),
        }
    }

    async fn unsubscribe(&self, topics: Vec<String>) {
        if topics.is_empty() {
            return;
        }
        if let Err(e) = self.transport.unsubscribe(&topics).await {
            warn!("Failed to unsubscribe: {}", e);
        }
        let mut subscriptions = self.subscriptions.lock().await;
        for topic in &topics {
            subscriptions.remove(topic);
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) {
        if let Err(e) = self.transport.publish(topic, payload, options).await {
            error!("Failed to publish to {}: {}", topic, e);
        }
    }

    async fn class_info(&self, class_name: &str) -> ClassInfo {
        ClassInfo {
            class_name: class_name.to_string(),
            instances: self.instances(class_name).await,
            member_functions: self.adapter.member_functions(class_name),
            static_functions: self.adapter.static_functions(class_name),
        }
    }

    async fn publish_class_info(&self, class_name: &str) {
        let info = self.class_info(class_name).await;
        match serde_json::to_vec(&info) {
            Ok(payload) => {
                let topic = self.identity().class_info_topic(class_name);
                self.publish(&topic, payload, PublishOptions::retained()).await;
            }
            Err(e) => error!("Failed to serialize class info of {}: {}", class_name, e),
        }
    }

    /// (Re-)establish every subscription and announce classes and presence
    async fn on_connected(&self) {
        if self.state() == AgentState::Ending {
            return;
        }
        let classes = self.adapter.classes();
        let live = self.instances.lock().await.clone();

        let mut topics = Vec::new();
        for class_name in &classes {
            topics.extend(self.static_topics(class_name));
            for instance_id in live.get(class_name).into_iter().flatten() {
                topics.extend(self.instance_topics(class_name, instance_id));
            }
        }
        // A reconnect starts from a clean session
        self.subscriptions.lock().await.clear();
        self.subscribe(topics).await;

        join_all(classes.iter().map(|class_name| self.publish_class_info(class_name))).await;
        self.publish(
            &self.identity().agent_info_topic(),
            AgentInfo::new(AgentStatus::Online).to_bytes(),
            PublishOptions::retained(),
        )
        .await;

        self.set_state(AgentState::Connected);
        info!("Agent {} online with {} classes", self.identity().base_topic(), classes.len());
    }

    /// Handle one inbound message; failures are logged and never escape
    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let parsed = match ParsedTopic::parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropped message: {}", e);
                return;
            }
        };
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropped message on {}: invalid envelope: {}", topic, e);
                return;
            }
        };

        let outcome = self.adapter.call(CallRequest {
            sender: envelope.sender.clone(),
            class_name: parsed.class_name.clone(),
            target_id: parsed.target_id().to_string(),
            method: parsed.method.clone(),
            data: envelope.data.clone(),
        });

        match &outcome {
            Ok(value) if parsed.is_static() => match parsed.method.as_str() {
                CREATE | CREATE_NAMED | GET_NAMED => {
                    if let Some(instance_id) = value.as_str() {
                        self.track_instance(&parsed.class_name, instance_id).await;
                    }
                }
                DELETE if *value == Value::Bool(true) => {
                    if let Some(instance_id) = envelope.data.get("_1").and_then(Value::as_str) {
                        self.untrack_instance(&parsed.class_name, instance_id).await;
                    }
                }
                _ => {}
            },
            Ok(_) => {}
            Err(message) => debug!("Call {} on {} failed: {}", parsed.method, parsed.target_id(), message),
        }

        if envelope.sender.is_empty() || envelope.sender.starts_with(LOCAL_SENDER_PREFIX) {
            debug!("No reply destination for call on {}", topic);
            return;
        }
        match serde_json::to_vec(&envelope.reply(&outcome)) {
            Ok(reply) => self.publish(&envelope.sender, reply, PublishOptions::reliable()).await,
            Err(e) => error!("Failed to serialize reply for {}: {}", topic, e),
        }
    }

    async fn track_instance(&self, class_name: &str, instance_id: &str) {
        let inserted = self
            .instances
            .lock()
            .await
            .entry(class_name.to_string())
            .or_default()
            .insert(instance_id.to_string());
        if inserted {
            info!("Tracking instance {} of class {}", instance_id, class_name);
            self.subscribe(self.instance_topics(class_name, instance_id)).await;
            self.publish_class_info(class_name).await;
        }
    }

    async fn untrack_instance(&self, class_name: &str, instance_id: &str) {
        let removed = self
            .instances
            .lock()
            .await
            .get_mut(class_name)
            .is_some_and(|ids| ids.remove(instance_id));
        if removed {
            info!("Dropped instance {} of class {}", instance_id, class_name);
            self.unsubscribe(self.instance_topics(class_name, instance_id)).await;
            self.publish_class_info(class_name).await;
        }
    }

    /// Publish callback data to the caller that registered the token
    async fn forward_callback(&self, message: CallbackMessage) {
        match serde_json::to_vec(&message) {
            Ok(payload) => self.publish(&message.sender, payload, PublishOptions::reliable()).await,
            Err(e) => error!("Failed to serialize callback {}: {}", message.id, e),
        }
    }

    /// Shut down: announce offline (or clear every retained topic when
    /// `unregister` is set), disconnect and wait until disconnected.
    ///
    /// Concurrent calls all wait for the same disconnection.
    pub async fn end(&self, unregister: bool) -> RpcResult<()> {
        let mut initiated = false;
        let mut idle = false;
        self.state.send_if_modified(|state| match state {
            AgentState::Disconnected => {
                idle = true;
                false
            }
            AgentState::Ending => false,
            _ => {
                *state = AgentState::Ending;
                initiated = true;
                true
            }
        });
        if idle {
            return Ok(());
        }

        if initiated {
            info!("Ending agent {}", self.identity().base_topic());
            if unregister {
                let classes = self.adapter.classes();
                join_all(classes.iter().map(|class_name| {
                    let topic = self.identity().class_info_topic(class_name);
                    async move { self.publish(&topic, Vec::new(), PublishOptions::retained()).await }
                }))
                .await;
                self.publish(&self.identity().agent_info_topic(), Vec::new(), PublishOptions::retained())
                    .await;
            } else {
                self.publish(
                    &self.identity().agent_info_topic(),
                    AgentInfo::new(AgentStatus::Offline).to_bytes(),
                    PublishOptions::retained(),
                )
                .await;
            }
            if let Err(e) = self.transport.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        }

        self.wait_until_state(AgentState::Disconnected, self.config.end_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ClassBuilder, ClassRegistry, Invocation};
    use crate::transport::MemoryBroker;
    use serde_json::json;

    fn setup() -> (MemoryBroker, Arc<Agent>, UnboundedReceiver<TransportEvent>) {
        let registry = ClassRegistry::new();
        registry.register(
            ClassBuilder::new("Counter", |_: &Invocation| Ok(0i64))
                .member("increment", |n: &mut i64, _| {
                    *n += 1;
                    Ok(json!(*n))
                })
                .member("get", |n: &mut i64, _| Ok(json!(*n))),
        );
        let identity = AgentIdentity::new("test", "agent");
        let broker = MemoryBroker::new();
        let (transport, events) = broker.connect_with_will(identity.client_id(), identity.offline_will());
        let agent = Agent::new(AgentConfig::new(identity), Arc::new(registry), Arc::new(transport));
        (broker, agent, events)
    }

    #[tokio::test]
    async fn test_connect_publishes_class_info_and_presence() {
        let (broker, agent, events) = setup();
        assert_eq!(agent.state(), AgentState::Disconnected);
        let _task = agent.serve(events);
        agent.wait_until_state(AgentState::Connected, Duration::from_secs(1)).await.unwrap();

        let info: ClassInfo =
            serde_json::from_slice(&broker.retained("test/agent/Counter/__static__/__info__").unwrap()).unwrap();
        assert_eq!(info.member_functions, vec!["increment", "get"]);
        assert!(info.static_functions.contains(&CREATE.to_string()));

        let presence: AgentInfo =
            serde_json::from_slice(&broker.retained("test/agent/__agentInfo__").unwrap()).unwrap();
        assert_eq!(presence.status, AgentStatus::Online);
        assert_eq!(agent.subscriptions().await.len(), 4);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (broker, agent, events) = setup();
        // Never served: nothing to wait for
        agent.end(false).await.unwrap();

        let _task = agent.serve(events);
        agent.wait_until_state(AgentState::Connected, Duration::from_secs(1)).await.unwrap();
        let (a, b) = tokio::join!(agent.end(false), agent.end(false));
        a.unwrap();
        b.unwrap();
        assert_eq!(agent.state(), AgentState::Disconnected);

        let presence: AgentInfo =
            serde_json::from_slice(&broker.retained("test/agent/__agentInfo__").unwrap()).unwrap();
        assert_eq!(presence.status, AgentStatus::Offline);
        agent.end(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_clears_retained_topics() {
        let (broker, agent, events) = setup();
        let _task = agent.serve(events);
        agent.wait_until_state(AgentState::Connected, Duration::from_secs(1)).await.unwrap();
        agent.end(true).await.unwrap();
        assert!(broker.retained("test/agent/__agentInfo__").is_none());
        assert!(broker.retained("test/agent/Counter/__static__/__info__").is_none());
    }
}
