//! Settings for agents and clients.
//!
//! A flat key/value store seeded with defaults and optionally overlaid by a JSON
//! file. Typed views ([`AgentConfig`], [`ClientConfig`]) are derived from it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{RpcError, RpcResult};
use crate::rpc::common::{AgentIdentity, DEFAULT_TOPIC_PREFIX, END_TIMEOUT, RPC_TIMEOUT};

/// Default settings
fn default_settings() -> HashMap<String, SettingValue> {
    let mut settings = HashMap::new();

    // Agent settings
    settings.insert("agent.topic_prefix".to_string(), SettingValue::String(DEFAULT_TOPIC_PREFIX.to_string()));
    settings.insert("agent.id".to_string(), SettingValue::String(default_agent_id()));
    settings.insert("agent.end_timeout_ms".to_string(), SettingValue::Int(END_TIMEOUT.as_millis() as i64));

    // Client settings
    settings.insert("client.timeout_ms".to_string(), SettingValue::Int(RPC_TIMEOUT.as_millis() as i64));

    // ZMQ broker endpoints
    settings.insert("zmq.frontend".to_string(), SettingValue::String("tcp://127.0.0.1:2014".to_string()));
    settings.insert("zmq.backend".to_string(), SettingValue::String("tcp://127.0.0.1:4102".to_string()));

    // Log settings
    settings.insert("log.level".to_string(), SettingValue::Int(20)); // INFO level
    settings.insert("log.console".to_string(), SettingValue::Bool(true));
    settings.insert("log.file".to_string(), SettingValue::Bool(false));

    settings
}

fn default_agent_id() -> String {
    format!("agent-{}", std::process::id())
}

/// Setting value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl SettingValue {
    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            SettingValue::Float(f) => Some(*f),
            SettingValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Settings container
pub struct Settings {
    settings: RwLock<HashMap<String, SettingValue>>,
}

impl Settings {
    /// Create new Settings holding the defaults only
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(default_settings()),
        }
    }

    /// Create Settings from defaults overlaid with the given JSON file.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn from_file(path: impl AsRef<Path>) -> RpcResult<Self> {
        let settings = Self::new();
        let path = path.as_ref();
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| RpcError::InvalidState(format!("cannot read {}: {}", path.display(), e)))?;
            let overlay: HashMap<String, SettingValue> = serde_json::from_str(&content)?;
            settings.update(overlay);
        }
        Ok(settings)
    }

    /// Get a setting value
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.settings.read().ok()?.get(key).cloned()
    }

    /// Get a string setting
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    /// Get an integer setting
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_int())
    }

    /// Get a float setting
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_float())
    }

    /// Get a bool setting
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Set a setting value
    pub fn set(&self, key: impl Into<String>, value: SettingValue) {
        if let Ok(mut settings) = self.settings.write() {
            settings.insert(key.into(), value);
        }
    }

    /// Update settings from a map
    pub fn update(&self, new_settings: HashMap<String, SettingValue>) {
        if let Ok(mut settings) = self.settings.write() {
            settings.extend(new_settings);
        }
    }

    /// Save settings to file
    pub fn save(&self, path: impl AsRef<Path>) -> RpcResult<()> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let json = {
            let settings = self
                .settings
                .read()
                .map_err(|e| RpcError::InvalidState(e.to_string()))?;
            serde_json::to_string_pretty(&*settings)?
        };
        fs::write(&path, json)
            .map_err(|e| RpcError::InvalidState(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn duration_ms(&self, key: &str, fallback: Duration) -> Duration {
        self.get_int(key)
            .filter(|ms| *ms >= 0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(fallback)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent side configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Topic prefix and agent id
    pub identity: AgentIdentity,
    /// How long `end()` waits for the transport to report disconnection
    pub end_timeout: Duration,
}

impl AgentConfig {
    pub fn new(identity: AgentIdentity) -> Self {
        Self { identity, end_timeout: END_TIMEOUT }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let prefix = settings
            .get_string("agent.topic_prefix")
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        let agent_id = settings.get_string("agent.id").unwrap_or_else(default_agent_id);
        Self {
            identity: AgentIdentity::new(prefix, agent_id),
            end_timeout: settings.duration_ms("agent.end_timeout_ms", END_TIMEOUT),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(AgentIdentity::new(DEFAULT_TOPIC_PREFIX, default_agent_id()))
    }
}

/// Remote client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Agent the client talks to
    pub identity: AgentIdentity,
    /// Timeout applied to each call's reply
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(identity: AgentIdentity) -> Self {
        Self { identity, timeout: RPC_TIMEOUT }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let agent = AgentConfig::from_settings(settings);
        Self {
            identity: agent.identity,
            timeout: settings.duration_ms("client.timeout_ms", RPC_TIMEOUT),
        }
    }
}
