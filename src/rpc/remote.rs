//! Networked caller and discovery client.
//!
//! A [`RemoteClient`] owns a private reply topic and watches the retained
//! presence and class info topics of its domain. Calls are published to the
//! agent's topics and correlated with their replies through the local bus.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RpcError, RpcResult};
use crate::event::EventBus;
use crate::rpc::common::{
    AgentInfo, AgentStatus, ClassInfo, Data, Envelope, Inbound, ParsedTopic, AGENT_INFO, CREATE, CREATE_NAMED, DELETE,
    END_TIMEOUT, GET_NAMED, INFO_METHOD, MAX_SAFE_INTEGER, PROMISE_MARKER, RESULT_KEY, STATIC_MARKER,
};
use crate::rpc::marshal::{pack_values, pack_values_from, slot_key, subscription_event, Arg, Marshaler};
use crate::rpc::proxy::{new_proxy_id, reply_error, stub_names, CallOutcome, DeferredResults};
use crate::setting::ClientConfig;
use crate::transport::{PublishOptions, Transport, TransportEvent};

/// Capacity of the discovery event channel
const EVENT_CAPACITY: usize = 256;

/// Discovery notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// An agent of the domain went online or offline
    Agent { agent: String, status: AgentStatus },
    /// The instance list of a class changed
    Class { agent: String, class_name: String, instances: Vec<String> },
}

struct Shared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    marshaler: Marshaler,
    deferred: DeferredResults,
    reply_topic: String,
    invoke_id: AtomicU64,
    agents: DashMap<String, AgentStatus>,
    /// Class info keyed by (agent, class)
    classes: DashMap<(String, String), ClassInfo>,
    /// Bumped on every class info change
    catalog: watch::Sender<u64>,
    events: broadcast::Sender<RemoteEvent>,
}

impl Shared {
    fn bus(&self) -> &Arc<EventBus> {
        self.marshaler.bus()
    }

    fn filters(&self) -> Vec<String> {
        let prefix = self.config.identity.topic_prefix();
        vec![
            self.reply_topic.clone(),
            format!("{}/+/{}", prefix, AGENT_INFO),
            format!("{}/+/+/{}/{}", prefix, STATIC_MARKER, INFO_METHOD),
        ]
    }

    fn notify(&self, event: RemoteEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.reply_topic {
            match serde_json::from_slice::<Inbound>(payload) {
                Ok(inbound) if inbound.id.starts_with(PROMISE_MARKER) => {
                    self.deferred.deliver(self.bus(), &inbound.id, inbound.data)
                }
                Ok(inbound) => {
                    self.bus().emit(&inbound.id, inbound.data);
                }
                Err(e) => warn!("Dropped reply: {}", e),
            }
            return;
        }

        let levels: Vec<&str> = topic.split('/').collect();
        if let [_, agent, AGENT_INFO] = levels.as_slice() {
            self.on_presence(agent, payload);
            return;
        }
        match ParsedTopic::parse(topic) {
            Ok(parsed) if parsed.is_static() && parsed.method == INFO_METHOD => {
                self.on_class_info(parsed.agent_id, parsed.class_name, payload)
            }
            _ => debug!("Ignored message on {}", topic),
        }
    }

    fn on_presence(&self, agent: &str, payload: &[u8]) {
        if payload.is_empty() {
            debug!("Agent {} unregistered", agent);
            if let Some((_, AgentStatus::Online)) = self.agents.remove(agent) {
                info!("Agent {} is {:?}", agent, AgentStatus::Offline);
                self.notify(RemoteEvent::Agent { agent: agent.to_string(), status: AgentStatus::Offline });
            }
            return;
        }
        match serde_json::from_slice::<AgentInfo>(payload) {
            Ok(info) => {
                let previous = self.agents.insert(agent.to_string(), info.status);
                if previous != Some(info.status) {
                    info!("Agent {} is {:?}", agent, info.status);
                    self.notify(RemoteEvent::Agent { agent: agent.to_string(), status: info.status });
                }
            }
            Err(e) => warn!("Invalid presence of agent {}: {}", agent, e),
        }
    }

    fn on_class_info(&self, agent: String, class_name: String, payload: &[u8]) {
        let key = (agent, class_name);
        if payload.is_empty() {
            let removed = self.classes.remove(&key);
            self.catalog.send_modify(|version| *version += 1);
            if removed.is_some_and(|(_, info)| !info.instances.is_empty()) {
                let (agent, class_name) = key;
                self.notify(RemoteEvent::Class { agent, class_name, instances: Vec::new() });
            }
            return;
        }
        let info: ClassInfo = match serde_json::from_slice(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!("Invalid class info of {}/{}: {}", key.0, key.1, e);
                return;
            }
        };
        let instances = info.instances.clone();
        let previous = self.classes.insert(key.clone(), info);
        self.catalog.send_modify(|version| *version += 1);
        if previous.map(|p| p.instances) != Some(instances.clone()) {
            let (agent, class_name) = key;
            self.notify(RemoteEvent::Class { agent, class_name, instances });
        }
    }

    fn next_call_id(&self, target_id: &str, method: &str) -> String {
        let invoke_id = self.invoke_id.fetch_add(1, Ordering::Relaxed) % MAX_SAFE_INTEGER;
        format!("{}-{}-{}", target_id, method, invoke_id)
    }

    /// Publish one call and wait for its reply data
    async fn request(&self, class_name: &str, target_id: &str, method: &str, data: Data) -> RpcResult<Data> {
        let identity = &self.config.identity;
        let topic = if target_id == class_name {
            identity.static_topic(class_name, method)
        } else {
            identity.instance_topic(class_name, target_id, method)
        };
        let id = self.next_call_id(target_id, method);
        let envelope = Envelope::new(self.reply_topic.clone(), target_id, method, data).with_id(id.clone());
        let payload = serde_json::to_vec(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.bus().register_once(&id, move |data| {
            let _ = tx.send(data);
        });
        if let Err(e) = self.transport.publish(&topic, payload, PublishOptions::reliable()).await {
            self.bus().remove_all(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.bus().remove_all(&id);
                Err(RpcError::Timeout {
                    timeout_ms: self.config.timeout.as_millis() as u64,
                    method: method.to_string(),
                })
            }
        }
    }

    async fn request_value(&self, class_name: &str, method: &str, data: Data) -> RpcResult<Value> {
        let reply = self.request(class_name, class_name, method, data).await?;
        match reply_error(&reply) {
            Some(error) => Err(error),
            None => Ok(reply.get(RESULT_KEY).cloned().unwrap_or(Value::Null)),
        }
    }

    /// Class info of the bound agent, waiting up to the call timeout for it to arrive
    async fn class_info(&self, class_name: &str) -> RpcResult<ClassInfo> {
        let key = (self.config.identity.agent_id().to_string(), class_name.to_string());
        let mut catalog = self.catalog.subscribe();
        let lookup = async {
            loop {
                if let Some(info) = self.classes.get(&key) {
                    return Some(info.clone());
                }
                if catalog.changed().await.is_err() {
                    return None;
                }
            }
        };
        match tokio::time::timeout(self.config.timeout, lookup).await {
            Ok(Some(info)) => Ok(info),
            _ => Err(RpcError::UnknownClass(class_name.to_string())),
        }
    }
}

/// Caller and discovery client bound to one agent of a domain
pub struct RemoteClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteClient {
    /// Attach to the transport and wait until the discovery subscriptions are in place
    pub async fn connect(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        mut events: UnboundedReceiver<TransportEvent>,
    ) -> RpcResult<Self> {
        let reply_topic = format!("{}/__client__/{}", config.identity.topic_prefix(), Uuid::new_v4().simple());
        let (catalog, _) = watch::channel(0);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let timeout = config.timeout;
        let shared = Arc::new(Shared {
            config,
            transport,
            marshaler: Marshaler::new(Arc::new(EventBus::new())),
            deferred: DeferredResults::new(),
            reply_topic,
            invoke_id: AtomicU64::new(0),
            agents: DashMap::new(),
            classes: DashMap::new(),
            catalog,
            events: event_tx,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = shared.clone();
        let task = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Connected => {
                        match worker.transport.subscribe(&worker.filters()).await {
                            Ok(()) => info!("Remote client listening on {}", worker.reply_topic),
                            Err(e) => error!("Failed to subscribe: {}", e),
                        }
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                    }
                    TransportEvent::Reconnecting => warn!("Remote client lost its connection, reconnecting"),
                    TransportEvent::Message { topic, payload } => worker.on_message(&topic, &payload),
                    TransportEvent::Disconnected => break,
                }
            }
            debug!("Remote client {} stopped", worker.reply_topic);
        });

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => Ok(Self { shared, task: Mutex::new(Some(task)) }),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                task.abort();
                Err(RpcError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                    method: "connect".to_string(),
                })
            }
        }
    }

    /// Topic replies are delivered to
    pub fn reply_topic(&self) -> &str {
        &self.shared.reply_topic
    }

    /// Subscribe to discovery notifications
    pub fn events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.shared.events.subscribe()
    }

    /// Last known presence of every agent of the domain
    pub fn agents(&self) -> Vec<(String, AgentStatus)> {
        let mut agents: Vec<(String, AgentStatus)> = self
            .shared
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        agents.sort();
        agents
    }

    /// Classes the bound agent announced
    pub fn available_classes(&self) -> Vec<String> {
        let agent = self.shared.config.identity.agent_id();
        let mut classes: Vec<String> = self
            .shared
            .classes
            .iter()
            .filter(|entry| entry.key().0 == agent)
            .map(|entry| entry.key().1.clone())
            .collect();
        classes.sort();
        classes
    }

    /// Instances of a class on the bound agent, per its latest class info
    pub async fn get_available_instances(&self, class_name: &str) -> RpcResult<Vec<String>> {
        Ok(self.shared.class_info(class_name).await?.instances)
    }

    async fn proxy_for(&self, class_name: &str, value: Value) -> RpcResult<RemoteProxy> {
        let instance_id = value
            .as_str()
            .ok_or_else(|| RpcError::InvalidReply(format!("expected an instance id, got {}", value)))?;
        let info = self.shared.class_info(class_name).await?;
        let proxy_id = new_proxy_id();
        debug!("Remote proxy {} bound to {}/{}", proxy_id, class_name, instance_id);
        Ok(RemoteProxy {
            shared: self.shared.clone(),
            class_name: class_name.to_string(),
            instance_id: instance_id.to_string(),
            proxy_id,
            functions: stub_names(&info.member_functions),
            subscriptions: StdMutex::new(Vec::new()),
        })
    }

    /// Create an anonymous instance
    pub async fn create(&self, class_name: &str, args: Vec<Value>) -> RpcResult<RemoteProxy> {
        let value = self.shared.request_value(class_name, CREATE, pack_values(args)).await?;
        self.proxy_for(class_name, value).await
    }

    /// Create a named instance, or attach to it if it already exists
    pub async fn create_named(&self, class_name: &str, instance: &str, args: Vec<Value>) -> RpcResult<RemoteProxy> {
        let mut data = pack_values_from(args, 2);
        data.insert(slot_key(1), Value::String(instance.to_string()));
        let value = self.shared.request_value(class_name, CREATE_NAMED, data).await?;
        self.proxy_for(class_name, value).await
    }

    /// Attach to an existing named instance
    pub async fn get_instance(&self, class_name: &str, instance: &str) -> RpcResult<RemoteProxy> {
        let data = pack_values(vec![Value::String(instance.to_string())]);
        let value = self.shared.request_value(class_name, GET_NAMED, data).await?;
        self.proxy_for(class_name, value).await
    }

    /// Delete an instance, returns whether it existed
    pub async fn delete(&self, class_name: &str, instance: &str) -> RpcResult<bool> {
        let data = pack_values(vec![Value::String(instance.to_string())]);
        let value = self.shared.request_value(class_name, DELETE, data).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Call a static function and return `data.r` as is
    pub async fn call_static(&self, class_name: &str, function: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.shared.request_value(class_name, function, pack_values(args)).await
    }

    /// Disconnect and wait for the event loop to stop
    pub async fn end(&self) -> RpcResult<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = self.shared.transport.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        match tokio::time::timeout(END_TIMEOUT, task).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RpcError::Timeout {
                timeout_ms: END_TIMEOUT.as_millis() as u64,
                method: "end".to_string(),
            }),
        }
    }
}

/// Stub object addressing one remote instance
pub struct RemoteProxy {
    shared: Arc<Shared>,
    class_name: String,
    instance_id: String,
    proxy_id: String,
    functions: Vec<String>,
    subscriptions: StdMutex<Vec<String>>,
}

impl RemoteProxy {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Invoke the stub `function`
    pub async fn call(&self, function: &str, args: Vec<Arg>) -> RpcResult<CallOutcome> {
        if !self.functions.iter().any(|f| f == function) {
            return Err(RpcError::UnknownFunction {
                class_name: self.class_name.clone(),
                function: function.to_string(),
            });
        }
        let packed = self.shared.marshaler.pack(&self.proxy_id, function, args);
        if !packed.subscriptions.is_empty() {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            for token in packed.subscriptions {
                if !subscriptions.contains(&token) {
                    subscriptions.push(token);
                }
            }
        }
        let reply = self
            .shared
            .request(&self.class_name, &self.instance_id, function, packed.data)
            .await?;
        self.shared.deferred.resolve(self.shared.bus(), &reply)
    }

    /// Invoke `function` with plain values and wait for its final value
    pub async fn call_values(&self, function: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.call(function, args.into_iter().map(Arg::Value).collect())
            .await?
            .resolve()
            .await
    }

    /// Drop the local listeners of every subscription to `event`
    pub fn unsubscribe_event(&self, event: &str) -> usize {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        subscriptions.retain(|token| {
            if subscription_event(token) == Some(event) {
                removed += self.shared.bus().remove_all(token);
                false
            } else {
                true
            }
        });
        removed
    }
}
