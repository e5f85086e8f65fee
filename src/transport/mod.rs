//! Publish/subscribe transport abstraction.
//!
//! The RPC core needs exactly four things from a transport: publish, subscribe,
//! unsubscribe and a stream of inbound events. Connection handling, retained
//! storage and last-will live behind this seam.

pub mod memory;
pub mod zmq;

use async_trait::async_trait;

use crate::error::TransportError;

pub use self::memory::{MemoryBroker, MemoryTransport};
pub use self::zmq::{ZmqBroker, ZmqTransport};

/// Delivery quality requested for a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

/// Options of a single publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    /// Broker keeps the last message per topic and hands it to late subscribers.
    /// An empty retained payload clears the topic.
    pub retain: bool,
}

impl PublishOptions {
    /// At-least-once, not retained: used for replies
    pub fn reliable() -> Self {
        Self { qos: QoS::AtLeastOnce, retain: false }
    }

    /// At-least-once and retained: used for class and agent info
    pub fn retained() -> Self {
        Self { qos: QoS::AtLeastOnce, retain: true }
    }
}

/// Message the broker publishes on behalf of a client that drops ungracefully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// What a transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// Connection lost, the transport is trying again
    Reconnecting,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Transport client operations required by agents and callers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<(), TransportError>;

    /// Subscribe to topics or MQTT-style filters (`+` one level, `#` the rest)
    async fn subscribe(&self, filters: &[String]) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filters: &[String]) -> Result<(), TransportError>;

    /// Graceful disconnect; the owner receives [`TransportEvent::Disconnected`]
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// MQTT-style filter matching
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Literal part of a filter before its first wildcard level
pub fn filter_prefix(filter: &str) -> &str {
    let mut offset = 0;
    for level in filter.split('/') {
        if level == "+" || level == "#" {
            return &filter[..offset];
        }
        offset += level.len() + 1;
    }
    filter
}
