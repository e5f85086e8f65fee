//! Error types shared by the dispatcher, the proxies and the transports.

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client is not (or no longer) connected to its broker
    #[error("transport is not connected")]
    NotConnected,
    /// The transport's worker has shut down
    #[error("transport channel closed")]
    Closed,
    /// ZeroMQ socket error
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
    /// Any other I/O level failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors surfaced by the RPC layer
#[derive(Debug, Error)]
pub enum RpcError {
    /// Topic does not have the `prefix/agent/class/instance/method` shape
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    /// The remote registry reported a failure via `data.e`
    #[error("remote invocation failed: {0}")]
    RemoteInvocation(String),

    /// No reply arrived in time
    #[error("timeout of {timeout_ms}ms reached for call: {method}")]
    Timeout { timeout_ms: u64, method: String },

    /// Class is not known to the registry or to the discovery cache
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// Function is not part of the proxy's stub set
    #[error("unknown function '{function}' on class '{class_name}'")]
    UnknownFunction { class_name: String, function: String },

    /// Reply did not contain a usable result
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// Operation not possible in the current connection state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The pending result's producer went away before resolving it
    #[error("result channel closed before completion")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias used across the crate
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RpcError::Timeout { timeout_ms: 500, method: "echo".to_string() };
        assert_eq!(err.to_string(), "timeout of 500ms reached for call: echo");

        let err: RpcError = TransportError::NotConnected.into();
        assert_eq!(err.to_string(), "transport is not connected");

        let err = RpcError::RemoteInvocation("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }
}
