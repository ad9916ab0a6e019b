//! HTTP/WebSocket wire format for the gateway
//!
//! Client -> Server (JSON bodies):
//!   POST /services          { "service_name": "build", "instance_id": "w1", "host": "localhost", "port": 9001, "metadata": { "capabilities": ["build"] } }
//!   POST /publish           { "topic": "alerts", "payload": { "sev": "high" }, "priority": "critical", "ttl_secs": 30 }
//!   POST /tasks             { "task_id": "t1", "task_type": "build", "payload": {} }
//!   POST /tasks/t1/complete { "instance_id": "w1", "result": { "ok": true } }
//!
//! Server -> Client:
//!   errors:           { "error": "instance already registered: build/w1" }
//!   WebSocket pushes: { "event": "message", "data": { "id": 7, "topic": "alerts", ... } }

use crate::error::{Error, Result};
use crate::types::{Message, MessageId, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverQuery {
    pub healthy_only: Option<bool>,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub ttl_secs: Option<f64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl PublishRequest {
    /// The requested TTL. Negative or non-finite values are rejected.
    pub fn ttl(&self) -> Result<Option<Duration>> {
        self.ttl_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| Error::invalid_request(format!("ttl_secs {}: {}", secs, e)))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: MessageId,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTaskRequest {
    /// Generated by the gateway when omitted.
    #[serde(default)]
    pub task_id: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub preferred_instance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTaskResponse {
    pub task_id: String,
    /// `None` means the task was queued.
    pub assigned_instance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    pub instance_id: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailTaskRequest {
    pub instance_id: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Error body returned with every non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Server-pushed event (no request correlation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Sent once when a topic stream opens.
    pub fn subscribed(topic: &str) -> Self {
        Self::new(
            "subscribed",
            serde_json::json!({
                "topic": topic,
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
    }

    /// A delivered broker message.
    pub fn message(message: &Message) -> Self {
        Self::new(
            "message",
            serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
        )
    }

    pub fn pong() -> Self {
        Self::new("pong", serde_json::json!({}))
    }
}
