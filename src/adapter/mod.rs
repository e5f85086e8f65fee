//! Registry capability ("adapter").
//!
//! The protocol core only needs a handle that executes a call given class,
//! target and method names, lists the callable functions per class and reports
//! asynchronous callback data. [`ClassRegistry`] is the stock implementation
//! built from closures; anything else implementing [`Adapter`] works the same.

mod registry;

use serde_json::Value;
use std::cell::RefCell;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use crate::rpc::common::{CallbackMessage, Data, ERROR_KEY, FUNCTION_MARKER, PROMISE_MARKER, RESULT_KEY};
use crate::rpc::marshal::{pack_values, unpack};

pub use registry::{ClassBuilder, ClassRegistry};

/// One call handed to the registry
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    /// Reply topic of the caller, needed to route later callback data
    pub sender: String,
    pub class_name: String,
    /// Class name for static calls, instance id otherwise
    pub target_id: String,
    pub method: String,
    pub data: Data,
}

impl CallRequest {
    pub fn is_static(&self) -> bool {
        self.target_id == self.class_name
    }
}

/// Receives callback invocations and deferred results produced by the registry
pub type CallbackHandler = Arc<dyn Fn(&CallbackMessage) + Send + Sync>;

/// Dynamic dispatch over string names
pub trait Adapter: Send + Sync {
    /// Execute a call; `Err` carries the message sent back as `data.e`
    fn call(&self, request: CallRequest) -> Result<Value, String>;

    fn classes(&self) -> Vec<String>;

    /// Member function names, possibly with `-signature` suffixes
    fn member_functions(&self, class_name: &str) -> Vec<String>;

    /// Static function names, including the reserved lifecycle methods
    fn static_functions(&self, class_name: &str) -> Vec<String>;

    /// Register a handler for asynchronous callback data
    fn on_callback(&self, handler: CallbackHandler);
}

thread_local! {
    /// Callback data raised on this thread while a [`HeldCallbacks`] guard is alive
    static HELD: RefCell<Option<Vec<(CallbackSink, CallbackMessage)>>> = const { RefCell::new(None) };
}

/// Fan-out of callback data to every registered [`CallbackHandler`]
#[derive(Clone, Default)]
pub struct CallbackSink {
    handlers: Arc<RwLock<Vec<CallbackHandler>>>,
}

impl CallbackSink {
    pub fn add(&self, handler: CallbackHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Hand `message` to the handlers, or queue it while this thread holds callbacks
    pub fn dispatch(&self, message: &CallbackMessage) {
        let queued = HELD.with(|held| match held.borrow_mut().as_mut() {
            Some(queue) => {
                queue.push((self.clone(), message.clone()));
                true
            }
            None => false,
        });
        if !queued {
            self.deliver(message);
        }
    }

    fn deliver(&self, message: &CallbackMessage) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            handler(message);
        }
    }

    /// Queue dispatches made on this thread until the guard drops.
    ///
    /// Registered code runs with its instance locked; callback handlers may call
    /// back into that instance and must only run once the lock is released.
    pub(crate) fn hold() -> HeldCallbacks {
        let outermost = HELD.with(|held| {
            let mut held = held.borrow_mut();
            if held.is_none() {
                *held = Some(Vec::new());
                true
            } else {
                false
            }
        });
        HeldCallbacks { outermost }
    }
}

/// Guard of [`CallbackSink::hold`]; the outermost guard flushes the queue
pub(crate) struct HeldCallbacks {
    outermost: bool,
}

impl Drop for HeldCallbacks {
    fn drop(&mut self) {
        if !self.outermost {
            return;
        }
        let queued = HELD.with(|held| held.borrow_mut().take()).unwrap_or_default();
        for (sink, message) in queued {
            sink.deliver(&message);
        }
    }
}

/// A callback or subscription token received as an argument
#[derive(Clone)]
pub struct Callback {
    sender: String,
    token: String,
    sink: CallbackSink,
}

impl Callback {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Send positional values to the caller that owns the token
    pub fn fire(&self, args: Vec<Value>) {
        self.sink.dispatch(&CallbackMessage {
            sender: self.sender.clone(),
            id: self.token.clone(),
            data: pack_values(args),
        });
    }
}

/// A result promised by a `__p__` placeholder
#[derive(Clone)]
pub struct Deferred {
    sender: String,
    token: String,
    sink: CallbackSink,
}

impl Deferred {
    /// Placeholder to return from the method in place of the result
    pub fn placeholder(&self) -> Value {
        Value::String(self.token.clone())
    }

    pub fn resolve(self, value: Value) {
        self.settle(RESULT_KEY, value);
    }

    pub fn reject(self, message: impl Into<String>) {
        self.settle(ERROR_KEY, Value::String(message.into()));
    }

    fn settle(self, key: &str, value: Value) {
        let mut data = Data::new();
        data.insert(key.to_string(), value);
        self.sink.dispatch(&CallbackMessage { sender: self.sender, id: self.token, data });
    }
}

/// Arguments and context of one invocation as seen by registered code
pub struct Invocation {
    sender: String,
    args: Vec<Value>,
    sink: CallbackSink,
}

impl Invocation {
    pub(crate) fn new(sender: String, args: Vec<Value>, sink: CallbackSink) -> Self {
        Self { sender, args, sink }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Result<&Value, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("Missing argument at position {}", index + 1))
    }

    pub fn arg_str(&self, index: usize) -> Result<&str, String> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| format!("Argument at position {} must be a string", index + 1))
    }

    /// Bridge the token passed at `index` back to the caller
    pub fn callback(&self, index: usize) -> Result<Callback, String> {
        let token = self.arg_str(index)?;
        if !token.starts_with(FUNCTION_MARKER) {
            return Err(format!("Argument at position {} is not a callback", index + 1));
        }
        Ok(Callback {
            sender: self.sender.clone(),
            token: token.to_string(),
            sink: self.sink.clone(),
        })
    }

    /// Promise a result that is delivered later
    pub fn defer(&self) -> Deferred {
        Deferred {
            sender: self.sender.clone(),
            token: format!("{}{}", PROMISE_MARKER, Uuid::new_v4().simple()),
            sink: self.sink.clone(),
        }
    }
}

/// Event listeners keyed by event name, for registered classes that emit events
#[derive(Clone, Default)]
pub struct Emitter {
    listeners: Vec<(String, Callback)>,
}

impl Emitter {
    /// Add a listener; the same token on the same event is kept once
    pub fn on(&mut self, event: impl Into<String>, callback: Callback) {
        let event = event.into();
        if !self.listeners.iter().any(|(e, c)| *e == event && c.token == callback.token) {
            self.listeners.push((event, callback));
        }
    }

    pub fn remove_all_listeners(&mut self, event: &str) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|(e, _)| e != event);
        before - self.listeners.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.iter().filter(|(e, _)| e == event).count()
    }

    /// Fire every listener of `event`, returns how many were notified
    pub fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        let mut notified = 0;
        for (_, callback) in self.listeners.iter().filter(|(e, _)| e == event) {
            callback.fire(args.clone());
            notified += 1;
        }
        notified
    }
}

/// Positional values of a registry request
pub(crate) fn request_args(request: &CallRequest) -> Vec<Value> {
    unpack(&request.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_sink() -> (CallbackSink, Arc<Mutex<Vec<CallbackMessage>>>) {
        let sink = CallbackSink::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = seen.clone();
        sink.add(Arc::new(move |m: &CallbackMessage| store.lock().unwrap().push(m.clone())));
        (sink, seen)
    }

    #[test]
    fn test_callback_and_deferred_messages() {
        let (sink, seen) = recording_sink();
        let invocation = Invocation::new(
            "reply/topic".to_string(),
            vec![json!("__f__p-fn-0-3"), json!(5)],
            sink,
        );
        assert!(invocation.callback(1).is_err());
        assert_eq!(invocation.arg(1).unwrap(), &json!(5));
        assert!(invocation.arg(2).is_err());

        invocation.callback(0).unwrap().fire(vec![json!("x")]);
        let deferred = invocation.defer();
        assert!(crate::rpc::common::is_placeholder(&deferred.placeholder()));
        deferred.clone().resolve(json!(7));
        deferred.reject("late");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].id, "__f__p-fn-0-3");
        assert_eq!(seen[0].sender, "reply/topic");
        assert_eq!(seen[0].data["_1"], json!("x"));
        assert_eq!(seen[1].data["r"], json!(7));
        assert_eq!(seen[2].data["e"], json!("late"));
    }

    #[test]
    fn test_held_callbacks_flush_on_release() {
        let (sink, seen) = recording_sink();
        let invocation = Invocation::new("s".to_string(), vec![json!("__f__p-fn-0-1")], sink);
        {
            let _held = CallbackSink::hold();
            let _nested = CallbackSink::hold();
            invocation.callback(0).unwrap().fire(vec![json!(1)]);
            assert!(seen.lock().unwrap().is_empty());
        }
        assert_eq!(seen.lock().unwrap().len(), 1);

        // Nothing held any more: straight through
        invocation.callback(0).unwrap().fire(vec![json!(2)]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_emitter_dedupes_tokens() {
        let (sink, seen) = recording_sink();
        let invocation = Invocation::new("s".to_string(), vec![json!("__f__p-on-1-echo")], sink);
        let mut emitter = Emitter::default();
        emitter.on("echo", invocation.callback(0).unwrap());
        emitter.on("echo", invocation.callback(0).unwrap());
        assert_eq!(emitter.listener_count("echo"), 1);

        assert_eq!(emitter.emit("echo", vec![json!(1)]), 1);
        assert_eq!(emitter.emit("other", vec![json!(1)]), 0);
        assert_eq!(emitter.remove_all_listeners("echo"), 1);
        assert_eq!(emitter.emit("echo", vec![json!(2)]), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
