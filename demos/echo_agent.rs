//! Echo Agent Demo - an agent and a caller talking through a ZeroMQ broker
//!
//! This example shows how to:
//! - Register a class with member and static functions
//! - Start a broker, an agent and a remote client
//! - Create an instance and call it
//! - Subscribe to events emitted by the instance
//! - Receive a deferred result

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use topic_rpc::logger::init_logger;
use topic_rpc::{
    Agent, AgentConfig, AgentState, Arg, ClassBuilder, ClassRegistry, ClientConfig, Emitter, EventBus, EventTarget,
    RemoteClient, Settings, ZmqBroker, ZmqTransport,
};

#[derive(Default)]
struct Echo {
    emitter: Emitter,
}

fn registry() -> ClassRegistry {
    let registry = ClassRegistry::new();
    registry.register(
        ClassBuilder::new("Echo", |_| Ok(Echo::default()))
            .member("echo", |echo: &mut Echo, inv| {
                let value = inv.arg(0)?.clone();
                echo.emitter.emit("echo", vec![value.clone()]);
                Ok(value)
            })
            .member("on", |echo: &mut Echo, inv| {
                echo.emitter.on(inv.arg_str(0)?, inv.callback(1)?);
                Ok(Value::Null)
            })
            .member("slowEcho", |_, inv| {
                let value = inv.arg(0)?.clone();
                let deferred = inv.defer();
                let placeholder = deferred.placeholder();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(200));
                    deferred.resolve(value);
                });
                Ok(placeholder)
            })
            .static_fn("time", |_| Ok(json!(chrono::Utc::now().to_rfc3339()))),
    );
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::from_file(path)?,
        None => Settings::new(),
    };
    settings.set("agent.id", topic_rpc::setting::SettingValue::String("echoAgent".to_string()));
    init_logger(&settings);

    println!("=== Echo Agent Demo ===\n");

    let frontend = settings.get_string("zmq.frontend").unwrap_or_default();
    let backend = settings.get_string("zmq.backend").unwrap_or_default();
    let _broker = ZmqBroker::start(&frontend, &backend)?;
    println!("✓ Broker listening on {} / {}\n", frontend, backend);

    // Give the broker sockets time to bind
    tokio::time::sleep(Duration::from_millis(200)).await;

    let agent_config = AgentConfig::from_settings(&settings);
    let (transport, events) = ZmqTransport::connect(&frontend, &backend)?;
    let agent = Agent::new(agent_config.clone(), Arc::new(registry()), Arc::new(transport));
    let _agent_task = agent.serve(events);
    agent
        .wait_until_state(AgentState::Connected, Duration::from_secs(5))
        .await?;
    println!("✓ Agent {} online\n", agent.identity().base_topic());

    // ZMQ subscriptions propagate asynchronously
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (transport, events) = ZmqTransport::connect(&frontend, &backend)?;
    let client = RemoteClient::connect(ClientConfig::from_settings(&settings), Arc::new(transport), events).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("Server time: {}", client.call_static("Echo", "time", vec![]).await?);

    let echo = client.create("Echo", vec![]).await?;
    println!("Created instance {} with functions {:?}", echo.instance_id(), echo.functions());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let events = Arc::new(EventBus::new());
    events.register(
        "echo",
        Arc::new(|data: &topic_rpc::rpc::common::Data| println!("  event echo: {:?}", data.get("_1"))),
    );
    let target: Arc<dyn EventTarget> = events.clone();
    echo.call("on", vec![Arg::value("echo"), Arg::subscription(target, "echo")])
        .await?;

    for value in [json!(5), json!("hello"), json!({"nested": [1, 2, 3]})] {
        let reply = echo.call_values("echo", vec![value]).await?;
        println!("echo -> {}", reply);
    }

    let slow = echo.call("slowEcho", vec![Arg::value("patience")]).await?;
    println!("slowEcho pending: {}", slow.is_pending());
    println!("slowEcho -> {}", slow.resolve().await?);

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.end().await?;
    agent.end(true).await?;
    println!("\n✓ Demo finished");
    Ok(())
}
