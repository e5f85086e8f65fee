//! Common constants and types for RPC communication
//!
//! This module is the wire contract shared by agents and callers: the topic
//! hierarchy `prefix/agentId/className/{instanceId|__static__}/method`, the JSON
//! envelope, the class and agent info payloads and the reserved markers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{RpcError, RpcResult};
use crate::transport::Will;

/// Default topic prefix (the "domain")
pub const DEFAULT_TOPIC_PREFIX: &str = "vrpc";

/// Marker replacing the instance id for static context
pub const STATIC_MARKER: &str = "__static__";

/// Method name of the retained class info message
pub const INFO_METHOD: &str = "__info__";

/// Last topic token of the retained agent presence message
pub const AGENT_INFO: &str = "__agentInfo__";

/// Anonymous instance creation
pub const CREATE: &str = "__create__";

/// Named instance creation, `_1` carries the instance name
pub const CREATE_NAMED: &str = "__createNamed__";

/// Attach to an existing named instance, `_1` carries the instance name
pub const GET_NAMED: &str = "__getNamed__";

/// Instance deletion, `_1` carries the instance id
pub const DELETE: &str = "__delete__";

/// Prefix of callback and subscription tokens
pub const FUNCTION_MARKER: &str = "__f__";

/// Prefix of deferred-result placeholders in `data.r`
pub const PROMISE_MARKER: &str = "__p__";

/// Sender prefix used by same-process callers; never published
pub const LOCAL_SENDER_PREFIX: &str = "__local__";

/// Key of the result in reply data
pub const RESULT_KEY: &str = "r";

/// Key of the error message in reply data
pub const ERROR_KEY: &str = "e";

/// One-shot invoke counters wrap at the largest integer a JSON double represents exactly
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Default timeout for request-response calls (30 seconds)
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time `Agent::end` waits for the transport to go down
pub const END_TIMEOUT: Duration = Duration::from_secs(5);

/// Positional data: `_1`, `_2`, ... plus `r`/`e` on replies
pub type Data = serde_json::Map<String, Value>;

/// Address of one agent: topic prefix plus agent id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    topic_prefix: String,
    agent_id: String,
    base_topic: String,
}

impl AgentIdentity {
    pub fn new(topic_prefix: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let topic_prefix = topic_prefix.into();
        let agent_id = agent_id.into();
        let base_topic = format!("{}/{}", topic_prefix, agent_id);
        Self { topic_prefix, agent_id, base_topic }
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// `prefix/agentId`
    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// `prefix/agentId/class/__static__/function`
    pub fn static_topic(&self, class_name: &str, function: &str) -> String {
        format!("{}/{}/{}/{}", self.base_topic, class_name, STATIC_MARKER, function)
    }

    /// `prefix/agentId/class/instance/function`
    pub fn instance_topic(&self, class_name: &str, instance_id: &str, function: &str) -> String {
        format!("{}/{}/{}/{}", self.base_topic, class_name, instance_id, function)
    }

    /// Retained class info topic
    pub fn class_info_topic(&self, class_name: &str) -> String {
        self.static_topic(class_name, INFO_METHOD)
    }

    /// Retained presence topic
    pub fn agent_info_topic(&self) -> String {
        format!("{}/{}", self.base_topic, AGENT_INFO)
    }

    /// Last-will announcing this agent offline
    pub fn offline_will(&self) -> Will {
        Will {
            topic: self.agent_info_topic(),
            payload: AgentInfo::new(AgentStatus::Offline).to_bytes(),
            retain: true,
        }
    }

    /// Stable transport client id derived from prefix and agent id
    pub fn client_id(&self) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.topic_prefix.as_bytes());
        hasher.update(self.agent_id.as_bytes());
        format!("vrpca{:08x}", hasher.finalize())
    }
}

/// The message exchanged for calls and replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Reply topic owned by the caller
    pub sender: String,
    /// Class name for static calls, instance id otherwise
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub method: String,
    /// Correlation id, echoed on the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Data,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, target_id: impl Into<String>, method: impl Into<String>, data: Data) -> Self {
        Self {
            sender: sender.into(),
            target_id: target_id.into(),
            method: method.into(),
            id: None,
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build the reply: same addressing, request data plus `r` or `e`
    pub fn reply(&self, outcome: &Result<Value, String>) -> Envelope {
        let mut reply = self.clone();
        match outcome {
            Ok(value) => {
                reply.data.insert(RESULT_KEY.to_string(), value.clone());
            }
            Err(message) => {
                reply.data.insert(ERROR_KEY.to_string(), Value::String(message.clone()));
            }
        }
        reply
    }
}

/// Asynchronous data pushed to a caller: callback invocations and deferred results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub sender: String,
    /// The token the data belongs to
    pub id: String,
    #[serde(default)]
    pub data: Data,
}

/// Anything arriving on a caller's reply topic: `{id, data}`
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    pub id: String,
    #[serde(default)]
    pub data: Data,
}

/// Retained class metadata published by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub member_functions: Vec<String>,
    #[serde(default)]
    pub static_functions: Vec<String>,
}

/// Presence state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// Retained presence payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub status: AgentStatus,
}

impl AgentInfo {
    pub fn new(status: AgentStatus) -> Self {
        Self { status }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A validated `prefix/agentId/class/instanceOrStatic/method` topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub prefix: String,
    pub agent_id: String,
    pub class_name: String,
    /// `None` for static context
    pub instance_id: Option<String>,
    pub method: String,
}

impl ParsedTopic {
    pub fn parse(topic: &str) -> RpcResult<Self> {
        let tokens: Vec<&str> = topic.split('/').collect();
        let [prefix, agent_id, class_name, instance, method] = tokens.as_slice() else {
            return Err(RpcError::MalformedTopic(topic.to_string()));
        };
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(RpcError::MalformedTopic(topic.to_string()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            agent_id: agent_id.to_string(),
            class_name: class_name.to_string(),
            instance_id: (*instance != STATIC_MARKER).then(|| instance.to_string()),
            method: method.to_string(),
        })
    }

    /// Class name in static context, instance id otherwise
    pub fn target_id(&self) -> &str {
        self.instance_id.as_deref().unwrap_or(&self.class_name)
    }

    pub fn is_static(&self) -> bool {
        self.instance_id.is_none()
    }
}

/// Strip a `-signature` suffix: `foo-(int)` becomes `foo`
pub fn strip_signature(name: &str) -> &str {
    match name.find('-') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// Signature-stripped function names, deduplicated by first occurrence
pub fn unique_function_names<S: AsRef<str>>(functions: &[S]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(functions.len());
    for function in functions {
        let name = strip_signature(function.as_ref());
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// JSON type signature of positional arguments, e.g. `-numberstring`
pub fn json_signature(args: &[Value]) -> String {
    if args.is_empty() {
        return String::new();
    }
    let mut signature = String::from("-");
    for arg in args {
        signature.push_str(match arg {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        });
    }
    signature
}

/// Whether a reply value is a deferred-result placeholder
pub fn is_placeholder(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.starts_with(PROMISE_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_topics() {
        let identity = AgentIdentity::new("test.vrpc", "nodeJsTestAgent");
        assert_eq!(identity.base_topic(), "test.vrpc/nodeJsTestAgent");
        assert_eq!(identity.static_topic("Foo", CREATE), "test.vrpc/nodeJsTestAgent/Foo/__static__/__create__");
        assert_eq!(identity.instance_topic("Foo", "foo-1", "echo"), "test.vrpc/nodeJsTestAgent/Foo/foo-1/echo");
        assert_eq!(identity.class_info_topic("Bar"), "test.vrpc/nodeJsTestAgent/Bar/__static__/__info__");
        assert_eq!(identity.agent_info_topic(), "test.vrpc/nodeJsTestAgent/__agentInfo__");
        assert_eq!(identity.client_id(), AgentIdentity::new("test.vrpc", "nodeJsTestAgent").client_id());
        assert_ne!(identity.client_id(), AgentIdentity::new("test.vrpc", "other").client_id());
    }

    #[test]
    fn test_parse_topic() {
        let topic = ParsedTopic::parse("vrpc/agent/Foo/__static__/__create__").unwrap();
        assert!(topic.is_static());
        assert_eq!(topic.target_id(), "Foo");
        assert_eq!(topic.method, "__create__");

        let topic = ParsedTopic::parse("vrpc/agent/Foo/foo-1/echo").unwrap();
        assert_eq!(topic.target_id(), "foo-1");
        assert_eq!(topic.class_name, "Foo");

        for bad in ["vrpc/agent/Foo/echo", "vrpc/agent/Foo/foo-1/echo/extra", "", "a//b/c/d"] {
            assert!(matches!(ParsedTopic::parse(bad), Err(RpcError::MalformedTopic(_))), "{}", bad);
        }
    }

    #[test]
    fn test_envelope_wire_format() {
        let mut data = Data::new();
        data.insert("_1".to_string(), json!(5));
        let envelope = Envelope::new("vrpc/__client__/abc", "foo-1", "echo", data).with_id("foo-1-echo-0");
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["targetId"], "foo-1");
        assert_eq!(wire["data"]["_1"], 5);

        let ok = envelope.reply(&Ok(json!(5)));
        assert_eq!(ok.data["r"], 5);
        assert_eq!(ok.id.as_deref(), Some("foo-1-echo-0"));
        let err = envelope.reply(&Err("no such method".to_string()));
        assert_eq!(err.data["e"], "no such method");
        assert!(!err.data.contains_key("r"));
    }

    #[test]
    fn test_class_info_wire_format() {
        let info = ClassInfo {
            class_name: "Foo".to_string(),
            instances: vec!["foo-1".to_string()],
            member_functions: vec!["echo".to_string()],
            static_functions: vec![CREATE.to_string()],
        };
        let wire = serde_json::to_value(&info).unwrap();
        assert_eq!(wire["class"], "Foo");
        assert_eq!(wire["memberFunctions"], json!(["echo"]));
        assert_eq!(wire["staticFunctions"], json!(["__create__"]));

        let presence: AgentInfo = serde_json::from_slice(&AgentInfo::new(AgentStatus::Online).to_bytes()).unwrap();
        assert_eq!(presence.status, AgentStatus::Online);
    }

    #[test]
    fn test_overload_names_collapse() {
        let names = unique_function_names(&["foo-(int)", "bar", "foo-(string,string)", "-odd"]);
        assert_eq!(names, vec!["foo", "bar", "-odd"]);
    }

    #[test]
    fn test_json_signature() {
        assert_eq!(json_signature(&[]), "");
        assert_eq!(json_signature(&[json!(1), json!("a"), json!([1])]), "-numberstringarray");
        assert!(is_placeholder(&json!("__p__tok123")));
        assert!(!is_placeholder(&json!(5)));
    }
}
