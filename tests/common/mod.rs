#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use topic_rpc::rpc::common::AgentIdentity;
use topic_rpc::{
    Agent, AgentConfig, AgentState, ClassBuilder, ClassRegistry, ClientConfig, Emitter, EventTarget, Invocation,
    MemoryBroker, RemoteClient,
};

pub const PREFIX: &str = "test.vrpc";
pub const AGENT_ID: &str = "rustTestAgent";
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Unique member names of `Foo`, in registration order
pub const FOO_FUNCTIONS: [&str; 11] = [
    "echo",
    "on",
    "removeAllListeners",
    "increment",
    "getValue",
    "callMeBack",
    "waitAndEcho",
    "failLater",
    "fail",
    "settleNow",
    "add",
];

pub struct Foo {
    value: i64,
    emitter: Emitter,
}

pub struct Bar {
    name: String,
}

pub fn registry() -> ClassRegistry {
    let registry = ClassRegistry::new();
    registry.register(
        ClassBuilder::new("Foo", |inv: &Invocation| {
            let value = inv.args().first().and_then(Value::as_i64).unwrap_or(0);
            Ok(Foo { value, emitter: Emitter::default() })
        })
        .member("echo", |foo: &mut Foo, inv| {
            let value = inv.arg(0)?.clone();
            foo.emitter.emit("echo", vec![value.clone()]);
            Ok(value)
        })
        .member("on", |foo: &mut Foo, inv| {
            foo.emitter.on(inv.arg_str(0)?, inv.callback(1)?);
            Ok(Value::Null)
        })
        .member("removeAllListeners", |foo: &mut Foo, inv| {
            Ok(json!(foo.emitter.remove_all_listeners(inv.arg_str(0)?)))
        })
        .member("increment", |foo: &mut Foo, _| {
            foo.value += 1;
            foo.emitter.emit("changed", vec![json!(foo.value)]);
            Ok(json!(foo.value))
        })
        .member("getValue", |foo: &mut Foo, _| Ok(json!(foo.value)))
        .member("callMeBack", |foo: &mut Foo, inv| {
            inv.callback(0)?.fire(vec![json!(foo.value), json!("done")]);
            Ok(Value::Null)
        })
        .member("waitAndEcho", |_, inv| {
            let value = inv.arg(0)?.clone();
            let deferred = inv.defer();
            let placeholder = deferred.placeholder();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                deferred.resolve(value);
            });
            Ok(placeholder)
        })
        .member("failLater", |_, inv| {
            let reason = inv.arg_str(0)?.to_string();
            let deferred = inv.defer();
            let placeholder = deferred.placeholder();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                deferred.reject(reason);
            });
            Ok(placeholder)
        })
        .member("fail", |_, inv| Err(format!("Failed on purpose: {}", inv.arg_str(0).unwrap_or("?"))))
        .member("settleNow", |_, inv| {
            let value = inv.arg(0)?.clone();
            let deferred = inv.defer();
            let placeholder = deferred.placeholder();
            deferred.resolve(value);
            Ok(placeholder)
        })
        .member("add-numbernumber", |_, inv| {
            Ok(json!(inv.arg(0)?.as_f64().unwrap_or(0.0) + inv.arg(1)?.as_f64().unwrap_or(0.0)))
        })
        .member("add-stringstring", |_, inv| Ok(json!(format!("{}{}", inv.arg_str(0)?, inv.arg_str(1)?))))
        .static_fn("staticEcho", |inv| Ok(inv.arg(0)?.clone())),
    );
    registry.register(
        ClassBuilder::new("Bar", |inv: &Invocation| Ok(Bar { name: inv.arg_str(0)?.to_string() }))
            .member("name", |bar: &mut Bar, _| Ok(json!(bar.name)))
            .member("rename", |bar: &mut Bar, inv| {
                bar.name = inv.arg_str(0)?.to_string();
                Ok(Value::Null)
            }),
    );
    registry
}

pub fn identity() -> AgentIdentity {
    AgentIdentity::new(PREFIX, AGENT_ID)
}

/// Agent serving [`registry`] on the broker, already connected
pub async fn start_agent(broker: &MemoryBroker) -> Arc<Agent> {
    let identity = identity();
    let (transport, events) = broker.connect_with_will(identity.client_id(), identity.offline_will());
    let agent = Agent::new(AgentConfig::new(identity), Arc::new(registry()), Arc::new(transport));
    let _task = agent.serve(events);
    agent
        .wait_until_state(AgentState::Connected, TIMEOUT)
        .await
        .expect("agent connects");
    agent
}

pub async fn connect_client(broker: &MemoryBroker, client_id: &str) -> RemoteClient {
    let (transport, events) = broker.connect(client_id);
    let mut config = ClientConfig::new(identity());
    config.timeout = TIMEOUT;
    let client = RemoteClient::connect(config, Arc::new(transport), events)
        .await
        .expect("client connects");
    // Retained presence and class info are replayed on subscribe
    client
        .get_available_instances("Foo")
        .await
        .expect("class info of Foo");
    client
}

/// Event target forwarding every re-emitted event into a channel
pub struct Recorder {
    tx: UnboundedSender<(String, Vec<Value>)>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<(String, Vec<Value>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventTarget for Recorder {
    fn emit_event(&self, event: &str, args: Vec<Value>) {
        let _ = self.tx.send((event.to_string(), args));
    }
}

pub async fn next_event(rx: &mut UnboundedReceiver<(String, Vec<Value>)>) -> (String, Vec<Value>) {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("event in time")
        .expect("recorder alive")
}
