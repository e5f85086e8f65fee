//! Topic RPC - remote method invocation over a publish/subscribe transport
//!
//! This crate lets a process expose objects to remote callers without an
//! interface compiler:
//!
//! - Topic hierarchy and JSON envelope shared by both sides
//! - Argument marshaling with callback and event subscription bridging
//! - Agent dispatcher driven by transport events
//! - Same-process and networked proxies with deferred results
//! - In-memory and ZeroMQ transports
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use topic_rpc::{Agent, AgentConfig, AgentIdentity, AgentState, ClassBuilder, ClassRegistry, MemoryBroker};
//! use topic_rpc::{ClientConfig, RemoteClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), topic_rpc::RpcError> {
//!     let registry = ClassRegistry::new();
//!     registry.register(
//!         ClassBuilder::new("Greeter", |_| Ok(()))
//!             .member("greet", |_, inv| Ok(json!(format!("hello {}", inv.arg_str(0)?)))),
//!     );
//!
//!     let identity = AgentIdentity::new("vrpc", "greeter");
//!     let broker = MemoryBroker::new();
//!     let (transport, events) = broker.connect_with_will(identity.client_id(), identity.offline_will());
//!     let agent = Agent::new(AgentConfig::new(identity.clone()), Arc::new(registry), Arc::new(transport));
//!     let _task = agent.serve(events);
//!     agent.wait_until_state(AgentState::Connected, Duration::from_secs(1)).await?;
//!
//!     let (transport, events) = broker.connect("caller");
//!     let client = RemoteClient::connect(ClientConfig::new(identity), Arc::new(transport), events).await?;
//!     let greeter = client.create("Greeter", vec![]).await?;
//!     let reply = greeter.call_values("greet", vec![json!("world")]).await?;
//!     assert_eq!(reply, json!("hello world"));
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod error;
pub mod event;
pub mod logger;
pub mod rpc;
pub mod setting;
pub mod transport;

// Re-export commonly used types
pub use adapter::{Adapter, CallRequest, ClassBuilder, ClassRegistry, Emitter, Invocation};
pub use error::{RpcError, RpcResult, TransportError};
pub use event::{EventBus, EventTarget};
pub use rpc::common::{AgentIdentity, AgentStatus, ClassInfo, Envelope};
pub use rpc::{Agent, AgentState, Arg, CallOutcome, LocalCaller, LocalProxy, RemoteClient, RemoteEvent, RemoteProxy};
pub use setting::{AgentConfig, ClientConfig, Settings};
pub use transport::{MemoryBroker, Transport, TransportEvent, ZmqBroker, ZmqTransport};
