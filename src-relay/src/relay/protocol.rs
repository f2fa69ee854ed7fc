// Relay protocol - shared structs for extension <-> relay communication
// Uses length-prefixed JSON frames over stdio or a Unix socket

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::FrameError;
use super::peer::PeerIdentity;

/// Exclusive upper bound on a frame body, in bytes
pub const MAX_FRAME_SIZE: usize = 1_000_000;

/// Size of the little-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Category used when a session message does not name one
pub const DEFAULT_CATEGORY: &str = "default";

/// Whether a length prefix describes a frame the relay will accept
pub fn is_valid_frame_len(len: usize) -> bool {
    len > 0 && len < MAX_FRAME_SIZE
}

/// The single authoritative record for one session category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSession {
    pub active: bool,
    /// Free-text intent the user typed when starting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

/// One time block of the day's schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleBlock {
    pub title: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Read-only projection of the schedule evaluator's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSnapshot {
    pub enabled: bool,
    /// Evaluator state tag, e.g. "idle", "inBlock", "break"
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_block: Option<ScheduleBlock>,
    #[serde(default)]
    pub blocks: Vec<ScheduleBlock>,
}

impl ScheduleSnapshot {
    /// Snapshot reported before any schedule has been configured
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            state: "disabled".to_string(),
            active_block: None,
            blocks: Vec::new(),
        }
    }
}

impl Default for ScheduleSnapshot {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Per-connection usage totals, in seconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub by_domain: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
    pub total_seconds: u64,
}

// ============================================================================
// Extension -> Relay requests
// ============================================================================

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// Inbound message, decoded once at the framed channel boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum RelayRequest {
    /// Liveness probe; also asks for fresh snapshots
    Ping,
    /// Claim the canonical session for a category
    SessionStart {
        #[serde(default = "default_category")]
        category: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        categories: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u32>,
    },
    /// End the active session for a category
    SessionEnd {
        #[serde(default = "default_category")]
        category: String,
    },
    /// Amend the active session for a category
    SessionUpdate {
        #[serde(default = "default_category")]
        category: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        categories: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u32>,
    },
    GetStatus,
    GetUsage,
    /// Periodic report that the user spent time on a domain
    UsageHeartbeat {
        domain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<u64>,
    },
    /// Any `type` this relay does not know about
    #[serde(other)]
    Unrecognized,
}

// ============================================================================
// Relay -> Extension messages (replies and broadcasts)
// ============================================================================

/// Outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum RelayMessage {
    Pong,
    /// Full snapshot of every canonical session
    SessionSync {
        sessions: BTreeMap<String, CanonicalSession>,
        /// Category this sync was triggered for, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        /// Set on the correction sent to a caller whose change lost arbitration
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        rejected: bool,
    },
    /// Full snapshot of the schedule
    ScheduleSync { schedule: ScheduleSnapshot },
    Status {
        label: String,
        sessions: BTreeMap<String, CanonicalSession>,
        schedule: ScheduleSnapshot,
        connections: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerIdentity>,
    },
    UsageResponse { usage: UsageReport },
    /// Settings payload from another subsystem, relayed key for key
    SettingsSync {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message into one wire frame (length prefix + JSON body)
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(msg)?;
    if !is_valid_frame_len(body.len()) {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body into a JSON object that carries a string `type`
pub fn decode_frame_body(body: &[u8]) -> Result<Map<String, Value>, FrameError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| FrameError::Malformed(e.to_string()))?;

    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str).is_some() {
                Ok(map)
            } else {
                Err(FrameError::Malformed("missing string field `type`".to_string()))
            }
        }
        other => Err(FrameError::Malformed(format!(
            "expected JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
