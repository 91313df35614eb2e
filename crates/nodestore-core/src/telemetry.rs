//! Telemetry records handed over by the protocol layer.
//!
//! Each record is a typed struct; [`TelemetryEvent`] tags them for the
//! buffered writer. JSON uses a `kind` tag and base64 for raw payloads.

use serde::{Deserialize, Serialize};

use crate::desired::base64_bytes;

/// A decoded signalling message (radio side) or user-plane/network log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// RFC3339 timestamp; normalised to UTC milliseconds on insert.
    pub timestamp: String,
    pub protocol: String,
    pub message_type: String,
    pub direction: String,
    #[serde(default)]
    pub local_address: String,
    #[serde(default)]
    pub remote_address: String,
    #[serde(default, with = "base64_bytes")]
    pub raw: Vec<u8>,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberLogEntry {
    pub timestamp: String,
    pub level: String,
    pub imsi: String,
    pub event: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub level: String,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub details: String,
}

/// One user-plane flow observed for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReportEntry {
    /// IMSI of the subscriber that owns the flow.
    pub subscriber_id: String,
    pub source_ip: String,
    pub destination_ip: String,
    #[serde(default)]
    pub source_port: u16,
    #[serde(default)]
    pub destination_port: u16,
    /// IP protocol number.
    pub protocol: u8,
    #[serde(default)]
    pub packets: u64,
    #[serde(default)]
    pub bytes: u64,
    pub start_time: String,
    pub end_time: String,
}

/// A stored row: surrogate ID plus the record as inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recorded<T> {
    pub id: i64,
    #[serde(flatten)]
    pub record: T,
}

/// Anything the buffered writer can persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Radio(ProtocolEvent),
    Network(ProtocolEvent),
    Subscriber(SubscriberLogEntry),
    Flow(FlowReportEntry),
}

impl TelemetryEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Radio(_) => "radio",
            Self::Network(_) => "network",
            Self::Subscriber(_) => "subscriber",
            Self::Flow(_) => "flow",
        }
    }
}
