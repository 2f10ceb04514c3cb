//! IPC protocol types and validation for roster-daemon.
//!
//! This module defines the on-the-wire schema and the rules we enforce at the
//! daemon boundary. Requests and push messages travel as newline-delimited
//! JSON over one long-lived connection; we fail fast on malformed input so a
//! bad client can never corrupt coordinator state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    TakeLock,
    Add,
    Delete,
    Update,
}

/// One client request frame. `id` is an optional correlation id the client
/// may set; it is echoed back only on error frames, since successful
/// operations are answered through the push channels instead.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// A row in the shared record list. `id` is assigned by the store on insert;
/// clients send `0` (or omit it) when adding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Record {
    #[serde(default)]
    pub id: i64,
    pub name: String,
}

/// Server-push frames, tagged by notification channel. Everything a client
/// learns after connecting arrives through one of these.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "channel", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full record list, ordered by name. Sent to a connection when it
    /// becomes active.
    All(Vec<Record>),
    /// The complete set of currently locked record ids.
    AllLocks(Vec<i64>),
    /// Acknowledgement to the requester that its lock attempt won.
    TakeLockSuccess(Record),
    Add(Record),
    Delete(Record),
    Update(Record),
    Health(HealthInfo),
    /// Caller-only failure report for a single request.
    Error(ErrorFrame),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthInfo {
    pub status: String,
    pub pid: u32,
    pub version: String,
    pub protocol_version: u32,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn into_frame(self, id: Option<String>) -> ErrorFrame {
        ErrorFrame {
            id,
            code: self.code,
            message: self.message,
        }
    }
}

/// Parses and validates the record payload for a method that operates on an
/// existing row (`take_lock`, `delete`, `update`). The id must identify a
/// stored record; whether it actually exists is the store's business.
pub fn parse_identified_record(params: Value) -> Result<Record, ErrorInfo> {
    let record = parse_record(params)?;
    if record.id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_record_id",
            "record id must be a positive integer",
        ));
    }
    Ok(record)
}

/// Parses the record payload for `add`. The id is ignored by the store, but
/// the name must be present since it is the only client-supplied field.
pub fn parse_new_record(params: Value) -> Result<Record, ErrorInfo> {
    let record = parse_record(params)?;
    if record.name.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "name is required"));
    }
    Ok(record)
}

fn parse_record(params: Value) -> Result<Record, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("record payload is invalid: {}", err),
        )
    })
}
