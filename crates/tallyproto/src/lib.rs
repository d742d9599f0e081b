//! tallyproto - Wire types for the tally billing MQTT topics
//!
//! This crate defines the JSON messages exchanged between the tally agent
//! and the billing broker: usage reports, key-status pushes, the key-list
//! request, and the heartbeat/ping control messages. All timestamps on the
//! wire are unsigned milliseconds since the Unix epoch.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// MQTT topics the agent speaks on.
pub mod topics {
    /// Usage reports, client to broker.
    pub const REPORT: &str = "billing/report";
    /// Key-status pushes, broker to client.
    pub const KEYS_UPDATE: &str = "billing/keys/update";
    /// Key-list request, client to broker.
    pub const KEYS_REQUEST: &str = "billing/keys/request";
    /// Periodic liveness publish, client to broker.
    pub const HEARTBEAT: &str = "billing/heartbeat";
    /// Connection probe, client to broker.
    pub const PING: &str = "billing/ping";
}

/// Errors decoding an inbound payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One unit of billable consumption, as queued by callers.
///
/// `api_key` is expected to be non-empty; `usage` is in caller-defined cost
/// units. The record carries no timestamp: the drainer stamps the wire
/// message at publish time, so a retried record gets a fresh stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub api_key: String,
    /// Conventionally "llm", "tts" or "asr"; arbitrary tags are accepted.
    pub module: String,
    pub model: String,
    pub usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl UsageRecord {
    pub fn new(api_key: &str, module: &str, model: &str, usage: u64) -> Self {
        Self {
            api_key: api_key.to_string(),
            module: module.to_string(),
            model: model.to_string(),
            usage,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Wire form of a [`UsageRecord`] as published to `billing/report`.
///
/// `metadata` is omitted from the JSON entirely when the record has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMessage {
    pub api_key: String,
    pub module: String,
    pub model: String,
    pub usage: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl UsageMessage {
    /// Stamp a record for publish. `timestamp` is ms since the epoch.
    pub fn from_record(record: &UsageRecord, timestamp: u64) -> Self {
        Self {
            api_key: record.api_key.clone(),
            module: record.module.clone(),
            model: record.model.clone(),
            usage: record.usage,
            timestamp,
            metadata: record.metadata.clone(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Key status as pushed by the broker.
///
/// Unrecognized status strings decode to [`KeyStatus::Unknown`] so a newer
/// broker cannot wedge the update stream; the store ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Ok,
    Blocked,
    #[serde(other)]
    Unknown,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Ok => "ok",
            KeyStatus::Blocked => "blocked",
            KeyStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry of a [`KeyUpdateMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyUpdate {
    pub key: String,
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KeyUpdate {
    /// The block reason, or "" when the broker sent none.
    pub fn reason_str(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

/// Key-status push received on `billing/keys/update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyUpdateMessage {
    pub timestamp: u64,
    #[serde(default)]
    pub updates: Vec<KeyUpdate>,
}

impl KeyUpdateMessage {
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Key-list request published to `billing/keys/request` after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysRequestMessage {
    pub timestamp: u64,
}

impl KeysRequestMessage {
    pub fn now() -> Self {
        Self {
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Control messages published to `billing/heartbeat` and `billing/ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Heartbeat { timestamp: u64 },
    Ping { timestamp: u64 },
}

impl ControlMessage {
    pub fn heartbeat() -> Self {
        ControlMessage::Heartbeat {
            timestamp: now_millis(),
        }
    }

    pub fn ping() -> Self {
        ControlMessage::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Mask an API key for log output.
///
/// Keys longer than 8 characters keep their first 8 and get one `*` per
/// remaining character; shorter keys are masked entirely.
pub fn mask_api_key(key: &str) -> String {
    let len = key.chars().count();
    if len > 8 {
        let head: String = key.chars().take(8).collect();
        format!("{}{}", head, "*".repeat(len - 8))
    } else {
        "*".repeat(len)
    }
}
