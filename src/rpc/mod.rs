//! RPC layer — wire envelope, connection state, configuration.
//!
//! The node speaks JSON-RPC 2.0 over WebSocket with the `call` envelope:
//! `{"method":"call","params":[api, method, args],"jsonrpc":"2.0","id":n}`.
//! Responses correlate by `id` and carry either `result` or `error`.

pub mod batch;
pub mod connection;
pub mod pool;
pub mod retry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::network;
use crate::rpc::retry::LinearBackoff;

// ─── Outbound frames ─────────────────────────────────────────────────────────

/// Framed request sent to the node.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub method: &'static str,
    /// `(api, method, args)` — serializes as a JSON array.
    pub params: (String, String, Vec<Value>),
    pub jsonrpc: &'static str,
    pub id: u64,
}

impl RpcRequest {
    pub fn call(id: u64, api: &str, method: &str, args: Vec<Value>) -> Self {
        Self {
            method: "call",
            params: (api.to_string(), method.to_string(), args),
            jsonrpc: "2.0",
            id,
        }
    }
}

// ─── Inbound frames ──────────────────────────────────────────────────────────

/// Raw response frame from the node.
///
/// Frames without an `id` (broadcast notices) are not correlated and are
/// ignored by the connection manager.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// The `error` member of a response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcErrorBody {
    pub fn to_message(&self) -> String {
        match (&self.message, self.code) {
            (Some(msg), Some(code)) => format!("{} (code {})", msg, code),
            (Some(msg), None) => msg.clone(),
            (None, Some(code)) => format!("node error code {}", code),
            (None, None) => "node returned an error without a message".to_string(),
        }
    }
}

// ─── Connection state ────────────────────────────────────────────────────────

/// Lifecycle state of one connection. Stored in an atomic so callers can
/// observe it without contending with the background task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Configuration for one node connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    /// Bound on transport readiness for one connect attempt.
    pub handshake_timeout: Duration,
    /// Bound on each in-flight request; matches the handshake timeout.
    pub request_timeout: Duration,
    /// Interval between keepalive probes while connected.
    pub keepalive_interval: Duration,
    /// Whether a dropped (previously established) connection reconnects.
    pub reconnect: bool,
    /// Linear schedule for reconnect attempts.
    pub reconnect_backoff: LinearBackoff,
    /// `(api, method)` of the lightweight keepalive probe call.
    pub probe: (String, String),
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: network::DEFAULT_NODE_URLS[0].to_string(),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect: true,
            reconnect_backoff: LinearBackoff::reconnect(),
            probe: (
                "database".to_string(),
                "get_dynamic_global_properties".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let req = RpcRequest::call(7, "database", "get_objects", vec![json!(["1.3.0"])]);
        let frame = serde_json::to_value(&req).unwrap();
        assert_eq!(
            frame,
            json!({
                "method": "call",
                "params": ["database", "get_objects", [["1.3.0"]]],
                "jsonrpc": "2.0",
                "id": 7,
            })
        );
    }

    #[test]
    fn test_response_with_result() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"id":3,"jsonrpc":"2.0","result":[{"id":"1.3.0"}]}"#).unwrap();
        assert_eq!(resp.id, Some(3));
        assert!(resp.result.is_some());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_response_with_error() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"id":4,"error":{"code":-32000,"message":"method not found"}}"#,
        )
        .unwrap();
        let body = resp.error.unwrap();
        assert_eq!(body.to_message(), "method not found (code -32000)");
    }

    #[test]
    fn test_notice_frame_has_no_id() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"method":"notice","params":[1,[]]}"#).unwrap();
        assert_eq!(resp.id, None);
    }

    #[test]
    fn test_connection_state_roundtrip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closing,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
        assert_eq!(ConnectionState::from(200), ConnectionState::Disconnected);
    }
}
