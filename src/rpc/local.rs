//! Same-process caller.
//!
//! Talks to an [`Adapter`] directly instead of over a transport. Replies are
//! available as soon as the registry returns; callback data comes back through
//! the adapter's callback handler and is routed onto this caller's bus.

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::adapter::{Adapter, CallRequest};
use crate::error::{RpcError, RpcResult};
use crate::event::EventBus;
use crate::rpc::common::{
    CallbackMessage, Data, Envelope, CREATE, CREATE_NAMED, DELETE, GET_NAMED, LOCAL_SENDER_PREFIX, PROMISE_MARKER,
    RESULT_KEY,
};
use crate::rpc::marshal::{pack_values, pack_values_from, slot_key, subscription_event, Arg, Marshaler};
use crate::rpc::proxy::{new_proxy_id, reply_error, resolve_reply, stub_names, CallOutcome, DeferredResults};

/// Proxy factory bound to one registry in the same process
#[derive(Clone)]
pub struct LocalCaller {
    adapter: Arc<dyn Adapter>,
    marshaler: Arc<Marshaler>,
    sender: String,
    deferred: Arc<DeferredResults>,
}

impl LocalCaller {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        let bus = Arc::new(EventBus::new());
        let sender = format!("{}/{}", LOCAL_SENDER_PREFIX, Uuid::new_v4().simple());
        let deferred = Arc::new(DeferredResults::new());

        let own_sender = sender.clone();
        let handler_bus = bus.clone();
        let handler_deferred = deferred.clone();
        adapter.on_callback(Arc::new(move |message: &CallbackMessage| {
            if message.sender != own_sender {
                return;
            }
            if message.id.starts_with(PROMISE_MARKER) {
                handler_deferred.deliver(&handler_bus, &message.id, message.data.clone());
            } else {
                handler_bus.emit(&message.id, message.data.clone());
            }
        }));

        Self {
            adapter,
            marshaler: Arc::new(Marshaler::new(bus)),
            sender,
            deferred,
        }
    }

    /// Sender marker stamped on every request of this caller
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.marshaler.bus()
    }

    /// Run one call through the registry and return the reply data
    fn invoke(&self, class_name: &str, target_id: &str, method: &str, data: Data) -> Data {
        let envelope = Envelope::new(self.sender.clone(), target_id, method, data);
        let outcome = self.adapter.call(CallRequest {
            sender: envelope.sender.clone(),
            class_name: class_name.to_string(),
            target_id: envelope.target_id.clone(),
            method: envelope.method.clone(),
            data: envelope.data.clone(),
        });
        envelope.reply(&outcome).data
    }

    fn invoke_static(&self, class_name: &str, method: &str, data: Data) -> RpcResult<Value> {
        let reply = self.invoke(class_name, class_name, method, data);
        match resolve_reply(self.bus(), &reply)? {
            CallOutcome::Ready(value) => Ok(value),
            CallOutcome::Pending(pending) => Err(RpcError::InvalidReply(format!(
                "{} on {} returned a deferred result",
                method,
                pending.token()
            ))),
        }
    }

    fn instance_from(&self, class_name: &str, value: Value) -> RpcResult<LocalProxy> {
        let instance_id = value
            .as_str()
            .ok_or_else(|| RpcError::InvalidReply(format!("expected an instance id, got {}", value)))?;
        Ok(self.create_proxy(class_name, instance_id))
    }

    /// Create an anonymous instance
    pub fn create(&self, class_name: &str, args: Vec<Value>) -> RpcResult<LocalProxy> {
        let value = self.invoke_static(class_name, CREATE, pack_values(args))?;
        self.instance_from(class_name, value)
    }

    /// Create a named instance, or attach to it if it already exists
    pub fn create_named(&self, class_name: &str, instance: &str, args: Vec<Value>) -> RpcResult<LocalProxy> {
        let mut data = pack_values_from(args, 2);
        data.insert(slot_key(1), Value::String(instance.to_string()));
        let value = self.invoke_static(class_name, CREATE_NAMED, data)?;
        self.instance_from(class_name, value)
    }

    /// Attach to an existing named instance
    pub fn get_instance(&self, class_name: &str, instance: &str) -> RpcResult<LocalProxy> {
        let value = self.invoke_static(class_name, GET_NAMED, pack_values(vec![Value::String(instance.to_string())]))?;
        self.instance_from(class_name, value)
    }

    /// Delete an instance, returns whether it existed
    pub fn delete(&self, class_name: &str, instance: &str) -> RpcResult<bool> {
        let value = self.invoke_static(class_name, DELETE, pack_values(vec![Value::String(instance.to_string())]))?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Call a static function and return `data.r` as is
    pub fn call_static(&self, class_name: &str, function: &str, args: Vec<Value>) -> RpcResult<Value> {
        let reply = self.invoke(class_name, class_name, function, pack_values(args));
        match reply_error(&reply) {
            Some(error) => Err(error),
            None => Ok(reply.get(RESULT_KEY).cloned().unwrap_or(Value::Null)),
        }
    }

    fn create_proxy(&self, class_name: &str, instance_id: &str) -> LocalProxy {
        let functions = stub_names(&self.adapter.member_functions(class_name));
        let proxy_id = new_proxy_id();
        debug!("Local proxy {} bound to {}/{}", proxy_id, class_name, instance_id);
        LocalProxy {
            caller: self.clone(),
            class_name: class_name.to_string(),
            instance_id: instance_id.to_string(),
            proxy_id,
            functions,
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

/// Stub object addressing one instance through a [`LocalCaller`]
pub struct LocalProxy {
    caller: LocalCaller,
    class_name: String,
    instance_id: String,
    proxy_id: String,
    functions: Vec<String>,
    subscriptions: Mutex<Vec<String>>,
}

impl LocalProxy {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Names of the generated stubs
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Invoke the stub `function`
    pub fn call(&self, function: &str, args: Vec<Arg>) -> RpcResult<CallOutcome> {
        if !self.functions.iter().any(|f| f == function) {
            return Err(RpcError::UnknownFunction {
                class_name: self.class_name.clone(),
                function: function.to_string(),
            });
        }
        let packed = self.caller.marshaler.pack(&self.proxy_id, function, args);
        if !packed.subscriptions.is_empty() {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            for token in packed.subscriptions {
                if !subscriptions.contains(&token) {
                    subscriptions.push(token);
                }
            }
        }

        let reply = self
            .caller
            .invoke(&self.class_name, &self.instance_id, function, packed.data);
        self.caller.deferred.resolve(self.caller.bus(), &reply)
    }

    /// Invoke `function` with plain values and return its immediate result
    pub fn call_values(&self, function: &str, args: Vec<Value>) -> RpcResult<Value> {
        match self.call(function, args.into_iter().map(Arg::Value).collect())? {
            CallOutcome::Ready(value) => Ok(value),
            CallOutcome::Pending(pending) => pending.blocking_wait(),
        }
    }

    /// Drop the local listeners of every subscription to `event`
    pub fn unsubscribe_event(&self, event: &str) -> usize {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        subscriptions.retain(|token| {
            if subscription_event(token) == Some(event) {
                removed += self.caller.bus().remove_all(token);
                false
            } else {
                true
            }
        });
        removed
    }
}
