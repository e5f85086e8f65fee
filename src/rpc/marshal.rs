//! Argument marshaling
//!
//! Positional arguments travel as `_1`, `_2`, ... in the envelope's data. Plain
//! values copy through. Callables and event subscriptions cannot cross the
//! wire, so they are replaced by tokens and bridged through the local
//! [`EventBus`]:
//!
//! * a callback becomes `__f__{proxyId}-{function}-{argIndex}-{invokeId}` with a
//!   one-shot listener: "call me once with the outcome";
//! * a subscription becomes `__f__{proxyId}-{function}-{argIndex}-{event}` with a
//!   persistent listener: "notify me every time this happens".

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::event::{EventBus, EventTarget};
use crate::rpc::common::{Data, FUNCTION_MARKER, MAX_SAFE_INTEGER};

/// Callable argument, invoked at most once with the remote positional values
pub type CallbackFn = Box<dyn FnOnce(Vec<Value>) + Send>;

/// One positional argument of a remote call
pub enum Arg {
    Value(Value),
    Callback(CallbackFn),
    /// Re-emit every remote `event` on `target` under the same name
    Subscription { target: Arc<dyn EventTarget>, event: String },
}

impl Arg {
    pub fn value(value: impl Into<Value>) -> Self {
        Arg::Value(value.into())
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Vec<Value>) + Send + 'static,
    {
        Arg::Callback(Box::new(f))
    }

    pub fn subscription(target: Arc<dyn EventTarget>, event: impl Into<String>) -> Self {
        Arg::Subscription { target, event: event.into() }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Callback(_) => f.write_str("Callback"),
            Arg::Subscription { event, .. } => f.debug_struct("Subscription").field("event", event).finish(),
        }
    }
}

/// Result of packing: positional data plus the persistent tokens it registered
#[derive(Debug, Default)]
pub struct Packed {
    pub data: Data,
    pub subscriptions: Vec<String>,
}

/// Key of a 1-based positional slot
pub fn slot_key(slot: usize) -> String {
    format!("_{}", slot)
}

/// Pack plain values into slots `_1..`
pub fn pack_values(values: Vec<Value>) -> Data {
    pack_values_from(values, 1)
}

/// Pack plain values into consecutive slots starting at `first_slot`
pub fn pack_values_from(values: Vec<Value>, first_slot: usize) -> Data {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| (slot_key(index + first_slot), value))
        .collect()
}

fn slot_index(key: &str) -> Option<u64> {
    key.strip_prefix('_')?.parse().ok()
}

/// Positional values of a payload: all `_`-prefixed keys in ascending slot order
pub fn unpack(data: &Data) -> Vec<Value> {
    let mut keys: Vec<&String> = data.keys().filter(|k| k.starts_with('_')).collect();
    keys.sort_by(|a, b| match (slot_index(a), slot_index(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    });
    keys.into_iter().map(|k| data[k.as_str()].clone()).collect()
}

/// Token of a one-shot callback argument
pub fn callback_token(proxy_id: &str, function: &str, arg_index: usize, invoke_id: u64) -> String {
    format!("{}{}-{}-{}-{}", FUNCTION_MARKER, proxy_id, function, arg_index, invoke_id)
}

/// Token of a persistent subscription argument
pub fn subscription_token(proxy_id: &str, function: &str, arg_index: usize, event: &str) -> String {
    format!("{}{}-{}-{}-{}", FUNCTION_MARKER, proxy_id, function, arg_index, event)
}

/// Event name of a subscription token; stub names and proxy ids carry no `-`,
/// so everything after the third separator is the event
pub fn subscription_event(token: &str) -> Option<&str> {
    token.strip_prefix(FUNCTION_MARKER)?.splitn(4, '-').nth(3)
}

/// Packs call arguments and wires their tokens into the event bus
pub struct Marshaler {
    bus: Arc<EventBus>,
    invoke_id: AtomicU64,
}

impl Marshaler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, invoke_id: AtomicU64::new(0) }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn next_invoke_id(&self) -> u64 {
        self.invoke_id.fetch_add(1, Ordering::Relaxed) % MAX_SAFE_INTEGER
    }

    /// Pack arguments into `_1..`, registering listeners before anything is sent
    pub fn pack(&self, proxy_id: &str, function: &str, args: Vec<Arg>) -> Packed {
        let mut packed = Packed::default();
        for (index, arg) in args.into_iter().enumerate() {
            let value = match arg {
                Arg::Value(value) => value,
                Arg::Callback(callback) => {
                    let token = callback_token(proxy_id, function, index, self.next_invoke_id());
                    self.bus.register_once(&token, move |data| callback(unpack(&data)));
                    Value::String(token)
                }
                Arg::Subscription { target, event } => {
                    let token = subscription_token(proxy_id, function, index, &event);
                    if self.bus.remove_all(&token) > 0 {
                        debug!("Replaced subscription listener: {}", token);
                    }
                    self.bus.register(
                        &token,
                        Arc::new(move |data: &Data| target.emit_event(&event, unpack(data))),
                    );
                    packed.subscriptions.push(token.clone());
                    Value::String(token)
                }
            };
            packed.data.insert(slot_key(index + 1), value);
        }
        packed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn token_of(packed: &Packed, slot: usize) -> String {
        packed.data[&slot_key(slot)].as_str().unwrap().to_string()
    }

    #[test]
    fn test_plain_values_round_trip() {
        let bus = Arc::new(EventBus::new());
        let marshaler = Marshaler::new(bus);
        let values = vec![json!(5), json!("Hello"), json!(false), json!([1, 2, 3]), json!({"key1": "inner", "key2": 2})];
        let args = values.iter().cloned().map(Arg::from).collect();
        let packed = marshaler.pack("p1", "fn", args);
        assert_eq!(packed.data["_1"], json!(5));
        assert_eq!(packed.data["_4"], json!([1, 2, 3]));
        assert_eq!(unpack(&packed.data), values);
    }

    #[test]
    fn test_unpack_orders_slots_numerically() {
        let values: Vec<Value> = (1..=12).map(|i| json!(i)).collect();
        let mut data = pack_values(values.clone());
        data.insert("r".to_string(), json!("ignored"));
        assert_eq!(unpack(&data), values);

        let data = pack_values_from(vec![json!("a")], 2);
        assert!(data.contains_key("_2"));
    }

    #[test]
    fn test_callback_fires_once_with_positional_args() {
        let bus = Arc::new(EventBus::new());
        let marshaler = Marshaler::new(bus.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let packed = marshaler.pack(
            "ab12",
            "compute",
            vec![Arg::value(1), Arg::callback(move |args| sink.lock().unwrap().push(args))],
        );
        let token = token_of(&packed, 2);
        assert_eq!(token, "__f__ab12-compute-1-0");
        assert!(packed.subscriptions.is_empty());

        let payload = pack_values(vec![json!("done"), json!(42)]);
        assert_eq!(bus.emit(&token, payload.clone()), 1);
        assert_eq!(bus.emit(&token, payload), 0);
        assert_eq!(*seen.lock().unwrap(), vec![vec![json!("done"), json!(42)]]);
    }

    #[test]
    fn test_callback_tokens_are_unique() {
        let bus = Arc::new(EventBus::new());
        let marshaler = Arc::new(Marshaler::new(bus.clone()));
        let fired = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let marshaler = marshaler.clone();
                let fired = fired.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|call| {
                            let fired = fired.clone();
                            let packed = marshaler.pack(
                                "p",
                                "echo",
                                vec![Arg::callback(move |_| fired.lock().unwrap().push((worker, call)))],
                            );
                            token_of(&packed, 1)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let tokens: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<&String> = tokens.iter().collect();
        assert_eq!(unique.len(), 200);

        for token in &tokens {
            assert_eq!(bus.emit(token, Data::new()), 1);
            assert_eq!(bus.emit(token, Data::new()), 0);
        }
        assert_eq!(fired.lock().unwrap().len(), 200);
    }

    #[test]
    fn test_subscription_is_persistent() {
        let bus = Arc::new(EventBus::new());
        let marshaler = Marshaler::new(bus.clone());
        let target = Arc::new(EventBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        target.register("echo", Arc::new(move |d: &Data| sink.lock().unwrap().push(unpack(d))));

        let packed = marshaler.pack("p", "on", vec![Arg::value("echo"), Arg::subscription(target.clone(), "echo")]);
        let token = token_of(&packed, 2);
        assert_eq!(token, "__f__p-on-1-echo");
        assert_eq!(packed.subscriptions, vec![token.clone()]);

        for i in 0..3 {
            assert_eq!(bus.emit(&token, pack_values(vec![json!(i)])), 1);
        }
        assert_eq!(*events.lock().unwrap(), vec![vec![json!(0)], vec![json!(1)], vec![json!(2)]]);

        // Subscribing again replaces rather than doubles the listener
        marshaler.pack("p", "on", vec![Arg::value("echo"), Arg::subscription(target, "echo")]);
        assert_eq!(bus.listener_count(&token), 1);
    }

    #[test]
    fn test_subscription_event_keeps_dashes() {
        assert_eq!(subscription_event("__f__p-on-1-echo"), Some("echo"));
        assert_eq!(subscription_event(&subscription_token("ab12", "on", 1, "a-echo")), Some("a-echo"));
        assert_eq!(subscription_event("__f__p-on-1"), None);
        assert_eq!(subscription_event("p-on-1-echo"), None);
    }
}
