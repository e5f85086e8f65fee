//! Token keyed event bus.
//!
//! Correlates asynchronous payloads (replies, callback invocations, deferred
//! results) with whoever waits for them. A handler is either consumed by the
//! first matching event or kept until it is unregistered.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::rpc::common::Data;
use crate::rpc::marshal::pack_values;

/// Type alias for persistent event handler functions
pub type EventHandler = Arc<dyn Fn(&Data) + Send + Sync>;

/// Type alias for handlers consumed by their first event
pub type OnceHandler = Box<dyn FnOnce(Data) + Send>;

/// A wrapper that allows us to identify handlers for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

enum Handler {
    // Mutex only to make the bus Sync; a one-shot handler is taken out exactly once
    Once(Mutex<OnceHandler>),
    Persistent(EventHandler),
}

/// Something a subscription argument re-emits remote events on
pub trait EventTarget: Send + Sync {
    fn emit_event(&self, event: &str, args: Vec<Value>);
}

/// Event bus distributing payloads by token
#[derive(Default)]
pub struct EventBus {
    /// Map of token to handlers, in registration order
    handlers: DashMap<String, Vec<(HandlerId, Handler)>>,
    /// Counter for generating unique handler IDs
    handler_counter: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a new unique handler ID
    fn generate_handler_id(&self) -> HandlerId {
        HandlerId(self.handler_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn insert(&self, token: &str, handler: Handler) -> HandlerId {
        let handler_id = self.generate_handler_id();
        self.handlers
            .entry(token.to_string())
            .or_default()
            .push((handler_id, handler));
        handler_id
    }

    /// Register a handler that fires on every event of this token
    pub fn register(&self, token: &str, handler: EventHandler) -> HandlerId {
        self.insert(token, Handler::Persistent(handler))
    }

    /// Register a handler that fires on the next event of this token only
    pub fn register_once<F>(&self, token: &str, handler: F) -> HandlerId
    where
        F: FnOnce(Data) + Send + 'static,
    {
        self.insert(token, Handler::Once(Mutex::new(Box::new(handler))))
    }

    /// Unregister one handler, returns whether it was still registered
    pub fn unregister(&self, token: &str, handler_id: HandlerId) -> bool {
        let removed = match self.handlers.get_mut(token) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != handler_id);
                before != list.len()
            }
            None => false,
        };
        self.handlers.remove_if(token, |_, list| list.is_empty());
        removed
    }

    /// Remove every handler of a token
    pub fn remove_all(&self, token: &str) -> usize {
        self.handlers.remove(token).map(|(_, list)| list.len()).unwrap_or(0)
    }

    /// Number of handlers currently waiting on a token
    pub fn listener_count(&self, token: &str) -> usize {
        self.handlers.get(token).map(|list| list.len()).unwrap_or(0)
    }

    /// Tokens that currently have at least one handler
    pub fn tokens(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Deliver a payload to the token's handlers, returns how many fired.
    ///
    /// One-shot handlers are detached before any handler runs, so a handler may
    /// register or emit on the bus itself.
    pub fn emit(&self, token: &str, data: Data) -> usize {
        let mut due: Vec<Handler> = Vec::new();
        if let Some(mut list) = self.handlers.get_mut(token) {
            for (id, handler) in std::mem::take(&mut *list) {
                match handler {
                    Handler::Once(f) => due.push(Handler::Once(f)),
                    Handler::Persistent(h) => {
                        due.push(Handler::Persistent(h.clone()));
                        list.push((id, Handler::Persistent(h)));
                    }
                }
            }
        }
        self.handlers.remove_if(token, |_, list| list.is_empty());

        if due.is_empty() {
            debug!("Unhandled event on token: {}", token);
            return 0;
        }

        let fired = due.len();
        for handler in due {
            match handler {
                Handler::Once(f) => {
                    let f = f.into_inner().unwrap_or_else(PoisonError::into_inner);
                    f(data.clone())
                }
                Handler::Persistent(h) => h(&data),
            }
        }
        fired
    }
}

impl EventTarget for EventBus {
    fn emit_event(&self, event: &str, args: Vec<Value>) {
        self.emit(event, pack_values(args));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Data {
        let mut data = Data::new();
        data.insert("_1".to_string(), value);
        data
    }

    #[test]
    fn test_once_handler_fires_once() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        bus.register_once("tok", move |d| sink.lock().unwrap().push(d["_1"].clone()));

        assert_eq!(bus.emit("tok", data(json!(1))), 1);
        assert_eq!(bus.emit("tok", data(json!(2))), 0);
        assert_eq!(*hits.lock().unwrap(), vec![json!(1)]);
        assert!(bus.tokens().is_empty());
    }

    #[test]
    fn test_persistent_handler_fires_until_unregistered() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let sink = hits.clone();
        let id = bus.register("sub", Arc::new(move |_: &Data| *sink.lock().unwrap() += 1));

        bus.emit("sub", Data::new());
        bus.emit("sub", Data::new());
        assert_eq!(bus.listener_count("sub"), 1);
        assert!(bus.unregister("sub", id));
        assert!(!bus.unregister("sub", id));
        bus.emit("sub", Data::new());
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn test_handler_may_reenter_bus() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        bus.register_once("first", move |_| {
            let sink = sink.clone();
            inner.register_once("second", move |d| sink.lock().unwrap().push(d["_1"].clone()));
            inner.emit("second", data(json!("nested")));
        });
        assert_eq!(bus.emit("first", Data::new()), 1);
        assert_eq!(*hits.lock().unwrap(), vec![json!("nested")]);
    }

    #[test]
    fn test_tokens_do_not_interfere() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        for token in ["a", "b"] {
            let sink = hits.clone();
            bus.register_once(token, move |_| sink.lock().unwrap().push(token));
        }
        bus.emit("b", Data::new());
        assert_eq!(*hits.lock().unwrap(), vec!["b"]);
        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.remove_all("a"), 1);
        assert_eq!(bus.emit("a", Data::new()), 0);
    }

    #[test]
    fn test_event_target_packs_positional_args() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        bus.register_once("echo", move |d| *sink.lock().unwrap() = Some(d));
        bus.emit_event("echo", vec![json!(6), json!("x")]);
        let d = seen.lock().unwrap().take().unwrap();
        assert_eq!(d["_1"], json!(6));
        assert_eq!(d["_2"], json!("x"));
    }
}
