//! Host bridge envelope
//!
//! A host sends one [`Request`] per command and receives any number of
//! [`Response`]s carrying the same `id`. Responses with `keep = true` are
//! standing deliveries (scan results, notifications); exactly one response
//! with `keep = false` ends a command.

use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// Marker the host uses for binary payloads
pub const ARRAY_BUFFER_TYPE: &str = "ArrayBuffer";

/// Request message format for commands
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    pub cmd: String,
    #[serde(default)]
    pub args: JsonValue,
}

impl Request {
    pub fn new(cmd: &str) -> Self {
        Self { id: 0, cmd: cmd.to_string(), args: JsonValue::Array(Vec::new()) }
    }

    pub fn with_args(cmd: &str, args: JsonValue) -> Self {
        Self { id: 0, cmd: cmd.to_string(), args }
    }

    /// Positional argument, `None` when absent or `null`
    pub fn arg(&self, index: usize) -> Option<&JsonValue> {
        self.args.as_array()?.get(index).filter(|v| !v.is_null())
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.arg(index)?.as_str()
    }
}

/// Response message format
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: JsonValue) -> Self {
        Self { id: 0, ok: true, keep: false, data: Some(data), code: None, error: None }
    }

    /// Final success with no payload
    pub fn done() -> Self {
        Self { id: 0, ok: true, keep: false, data: None, code: None, error: None }
    }

    /// Standing delivery; more responses for the same request follow
    pub fn keep(data: JsonValue) -> Self {
        Self { id: 0, ok: true, keep: true, data: Some(data), code: None, error: None }
    }

    pub fn err(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            id: 0,
            ok: false,
            keep: false,
            data: None,
            code: Some(code.into()),
            error: Some(msg.into()),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }
}

/// Encode bytes the way the host expects binary data
pub fn array_buffer(bytes: &[u8]) -> JsonValue {
    json!({
        "CDVType": ARRAY_BUFFER_TYPE,
        "data": BASE64.encode(bytes),
    })
}

/// Decode a binary argument: an ArrayBuffer object, a base64 string, or a
/// plain array of byte values.
pub fn bytes_from_json(value: &JsonValue) -> Option<Vec<u8>> {
    match value {
        JsonValue::Object(map) => {
            if map.get("CDVType")?.as_str()? != ARRAY_BUFFER_TYPE {
                return None;
            }
            let data = map.get("data")?.as_str()?;
            BASE64.decode(data.as_bytes()).ok()
        }
        JsonValue::String(s) => BASE64.decode(s.as_bytes()).ok(),
        JsonValue::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}
