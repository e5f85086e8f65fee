//! Client-side pieces shared by the local and the remote caller.
//!
//! Every reply is one of three things: an error (`data.e`), a placeholder for a
//! result that arrives later (`data.r == "__p__..."`), or the result itself.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};
use crate::event::EventBus;
use crate::rpc::common::{is_placeholder, unique_function_names, Data, ERROR_KEY, RESULT_KEY};

/// Outcome of a successful call
#[derive(Debug)]
pub enum CallOutcome {
    /// The reply carried the result
    Ready(Value),
    /// The reply carried a placeholder; the result follows on the bus
    Pending(PendingResult),
}

impl CallOutcome {
    /// Wait for the final value regardless of the branch taken
    pub async fn resolve(self) -> RpcResult<Value> {
        match self {
            CallOutcome::Ready(value) => Ok(value),
            CallOutcome::Pending(pending) => pending.wait().await,
        }
    }

    /// The value, if it was delivered with the reply
    pub fn ready(self) -> Option<Value> {
        match self {
            CallOutcome::Ready(value) => Some(value),
            CallOutcome::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CallOutcome::Pending(_))
    }
}

/// Handle of a deferred result, completed by a later `{r}` or `{e}` on its token
#[derive(Debug)]
pub struct PendingResult {
    token: String,
    rx: oneshot::Receiver<Result<Value, String>>,
}

impl PendingResult {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn wait(self) -> RpcResult<Value> {
        settle(self.rx.await)
    }

    /// Wait at most `timeout`; the protocol itself never times out a deferred result
    pub async fn wait_timeout(self, timeout: Duration) -> RpcResult<Value> {
        let token = self.token.clone();
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(received) => settle(received),
            Err(_) => Err(RpcError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                method: token,
            }),
        }
    }

    /// Block the current thread until the result arrives. Must not be called
    /// from within an async runtime.
    pub fn blocking_wait(self) -> RpcResult<Value> {
        settle(self.rx.blocking_recv())
    }
}

fn settle(received: Result<Result<Value, String>, oneshot::error::RecvError>) -> RpcResult<Value> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(RpcError::RemoteInvocation(message)),
        Err(_) => Err(RpcError::Closed),
    }
}

fn error_message(value: &Value) -> String {
    match value {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    }
}

/// The remote failure carried by reply data, if any
pub(crate) fn reply_error(data: &Data) -> Option<RpcError> {
    data.get(ERROR_KEY).map(|error| RpcError::RemoteInvocation(error_message(error)))
}

/// Interpret reply data: error, deferred or immediate.
///
/// For a deferred result a one-shot listener keyed by the placeholder is
/// registered on `bus` before this returns.
pub fn resolve_reply(bus: &EventBus, data: &Data) -> RpcResult<CallOutcome> {
    if let Some(error) = reply_error(data) {
        return Err(error);
    }
    let result = data.get(RESULT_KEY).cloned().unwrap_or(Value::Null);
    if !is_placeholder(&result) {
        return Ok(CallOutcome::Ready(result));
    }

    let token = result.as_str().unwrap_or_default().to_string();
    let (tx, rx) = oneshot::channel();
    bus.register_once(&token, move |data| {
        let outcome = match data.get(ERROR_KEY) {
            Some(error) => Err(error_message(error)),
            None => Ok(data.get(RESULT_KEY).cloned().unwrap_or(Value::Null)),
        };
        if tx.send(outcome).is_err() {
            debug!("Deferred result dropped, handle no longer awaited");
        }
    });
    Ok(CallOutcome::Pending(PendingResult { token, rx }))
}

/// How long a deferred result is kept while its placeholder reply is outstanding
const SETTLED_TTL: Duration = Duration::from_secs(60);

/// Deferred results of one caller.
///
/// A result may be settled before the caller has seen the placeholder reply
/// and registered its listener. Such results are kept here until
/// [`DeferredResults::resolve`] picks them up. Delivery and registration for a
/// token are serialized on the token's map entry.
#[derive(Default)]
pub struct DeferredResults {
    settled: DashMap<String, (Instant, Data)>,
}

impl DeferredResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the result for `token`, keeping it if nobody listens yet
    pub fn deliver(&self, bus: &EventBus, token: &str, data: Data) {
        let stashed = match self.settled.entry(token.to_string()) {
            Entry::Occupied(_) => {
                warn!("Dropped duplicate deferred result: {}", token);
                false
            }
            Entry::Vacant(slot) => {
                if bus.emit(token, data.clone()) == 0 {
                    debug!("Deferred result settled ahead of its reply: {}", token);
                    slot.insert((Instant::now(), data));
                    true
                } else {
                    false
                }
            }
        };
        if stashed {
            self.settled.retain(|_, (at, _)| at.elapsed() < SETTLED_TTL);
        }
    }

    /// [`resolve_reply`], also picking up a result delivered ahead of the reply
    pub fn resolve(&self, bus: &EventBus, reply: &Data) -> RpcResult<CallOutcome> {
        let token = match reply.get(RESULT_KEY) {
            Some(result) if reply_error(reply).is_none() && is_placeholder(result) => {
                result.as_str().unwrap_or_default().to_string()
            }
            _ => return resolve_reply(bus, reply),
        };
        let early = match self.settled.entry(token.clone()) {
            Entry::Occupied(slot) => slot.remove().1,
            // Registered while the entry is held, so `deliver` finds the listener
            Entry::Vacant(_slot) => return resolve_reply(bus, reply),
        };
        let outcome = resolve_reply(bus, reply)?;
        bus.emit(&token, early);
        Ok(outcome)
    }

    /// Number of results waiting for their reply
    pub fn len(&self) -> usize {
        self.settled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settled.is_empty()
    }
}

/// Stub names generated for a class: signature suffixes stripped, first occurrence wins
pub fn stub_names<S: AsRef<str>>(member_functions: &[S]) -> Vec<String> {
    unique_function_names(member_functions)
}

/// Random id of one proxy object, independent of the instance it addresses
pub fn new_proxy_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(key: &str, value: Value) -> Data {
        let mut data = Data::new();
        data.insert("_1".to_string(), json!(1));
        data.insert(key.to_string(), value);
        data
    }

    #[tokio::test]
    async fn test_immediate_and_error_replies() {
        let bus = EventBus::new();
        let outcome = resolve_reply(&bus, &reply("r", json!(5))).unwrap();
        assert!(!outcome.is_pending());
        assert_eq!(outcome.resolve().await.unwrap(), json!(5));

        match resolve_reply(&bus, &reply("e", json!("no such method"))) {
            Err(RpcError::RemoteInvocation(message)) => assert_eq!(message, "no such method"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(bus.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_resolves_on_matching_event() {
        let bus = EventBus::new();
        let outcome = resolve_reply(&bus, &reply("r", json!("__p__tok123"))).unwrap();
        let CallOutcome::Pending(pending) = outcome else {
            panic!("expected a pending result");
        };
        assert_eq!(pending.token(), "__p__tok123");

        // Unrelated tokens leave the handle untouched
        assert_eq!(bus.emit("__p__other", reply("r", json!(0))), 0);
        assert_eq!(bus.emit("__p__tok123", reply("r", json!("X"))), 1);
        assert_eq!(pending.wait().await.unwrap(), json!("X"));
    }

    #[tokio::test]
    async fn test_deferred_rejects_on_error_event() {
        let bus = EventBus::new();
        let outcome = resolve_reply(&bus, &reply("r", json!("__p__tok"))).unwrap();
        bus.emit("__p__tok", reply("e", json!("failed later")));
        match outcome.resolve().await {
            Err(RpcError::RemoteInvocation(message)) => assert_eq!(message, "failed later"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deferred_wait_timeout() {
        let bus = EventBus::new();
        let CallOutcome::Pending(pending) = resolve_reply(&bus, &reply("r", json!("__p__never"))).unwrap() else {
            panic!("expected a pending result");
        };
        let err = pending.wait_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_result_delivered_before_reply_is_kept() {
        let bus = EventBus::new();
        let deferred = DeferredResults::new();
        deferred.deliver(&bus, "__p__early", reply("r", json!("first")));
        assert_eq!(deferred.len(), 1);

        let outcome = deferred.resolve(&bus, &reply("r", json!("__p__early"))).unwrap();
        assert!(deferred.is_empty());
        assert_eq!(outcome.resolve().await.unwrap(), json!("first"));
        assert!(bus.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_result_delivered_after_reply_goes_to_listener() {
        let bus = EventBus::new();
        let deferred = DeferredResults::new();
        let outcome = deferred.resolve(&bus, &reply("r", json!("__p__late"))).unwrap();
        deferred.deliver(&bus, "__p__late", reply("e", json!("rejected")));
        assert!(deferred.is_empty());
        match outcome.resolve().await {
            Err(RpcError::RemoteInvocation(message)) => assert_eq!(message, "rejected"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_deliver_races_resolve_across_threads() {
        for round in 0..200 {
            let bus = std::sync::Arc::new(EventBus::new());
            let deferred = std::sync::Arc::new(DeferredResults::new());
            let token = format!("__p__race{}", round);
            let settle = {
                let (bus, deferred, token) = (bus.clone(), deferred.clone(), token.clone());
                std::thread::spawn(move || deferred.deliver(&bus, &token, reply("r", json!(round))))
            };
            let outcome = deferred.resolve(&bus, &reply("r", json!(token))).unwrap();
            settle.join().unwrap();
            let CallOutcome::Pending(pending) = outcome else {
                panic!("expected a pending result");
            };
            assert_eq!(pending.blocking_wait().unwrap(), json!(round));
            assert!(deferred.is_empty());
        }
    }

    #[test]
    fn test_stub_names_and_proxy_ids() {
        let names = stub_names(&["foo-(int)", "echo", "foo-(string,string)"]);
        assert_eq!(names, vec!["foo", "echo"]);
        assert_ne!(new_proxy_id(), new_proxy_id());
        assert_eq!(new_proxy_id().len(), 8);
    }
}
