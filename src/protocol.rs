//! JSON-RPC 2.0 envelopes and the remoting method table.
//!
//! Requests arrive from the host with positional `params`. Responses echo the
//! request `id` and carry exactly one of `result` or `error`. The bridge only
//! ever sends notifications (`log`, `readData`); it never accepts them.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MethodError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Version of the remoting API reported by `getApiVersion`.
pub const API_VERSION: i32 = 1;

/// Wire format of every timestamp (UTC, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// =============================================================================
// Envelopes
// =============================================================================

/// A validated request from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Either `result` or `error`, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Result(Value),
    Error(JsonRpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: ResponseOutcome::Error(error),
        }
    }
}

/// Outbound message without `id` (`log`, `readData`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
}

pub fn make_notification(method: &str, params: Vec<Value>) -> JsonRpcNotification {
    JsonRpcNotification {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
    }
}

/// A frame that is not a well-formed request.
///
/// When `id` is known the violation is answered with an error response;
/// otherwise the frame is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolViolation {
    pub id: Option<Value>,
    pub message: String,
}

impl ProtocolViolation {
    fn new(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
        }
    }
}

/// Decode and validate a request envelope.
pub fn parse_request(payload: &[u8]) -> Result<JsonRpcRequest, ProtocolViolation> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| ProtocolViolation::new(None, format!("Invalid JSON: {}", e)))?;

    let Value::Object(mut envelope) = value else {
        return Err(ProtocolViolation::new(
            None,
            "JSON-RPC 2.0 message expected, but got something else.",
        ));
    };

    let id = match envelope.remove("id") {
        Some(Value::Null) | None => None,
        Some(id) => Some(id),
    };

    let version_ok = envelope.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION);

    let Some(id) = id else {
        let message = if version_ok {
            "JSON-RPC 2.0 notifications are not supported."
        } else {
            "JSON-RPC 2.0 message expected, but got something else."
        };
        return Err(ProtocolViolation::new(None, message));
    };

    if !version_ok {
        return Err(ProtocolViolation::new(
            Some(id),
            "JSON-RPC 2.0 message expected, but got something else.",
        ));
    }

    let method = match envelope.remove("method") {
        Some(Value::String(method)) => method,
        _ => {
            return Err(ProtocolViolation::new(
                Some(id),
                "JSON-RPC 2.0 method name must be a string.",
            ))
        }
    };

    let params = match envelope.remove("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params,
        Some(_) => {
            return Err(ProtocolViolation::new(
                Some(id),
                "JSON-RPC 2.0 params must be passed by position.",
            ))
        }
    };

    Ok(JsonRpcRequest { id, method, params })
}

// =============================================================================
// Method table
// =============================================================================

/// Every method the bridge understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetApiVersion,
    SetContext,
    GetCatalogRegistrations,
    EnrichCatalog,
    GetTimeRange,
    GetAvailability,
    ReadSingle,
    /// `$/cancelRequest`, accepted as a no-op.
    CancelRequest,
    /// `$/progress`, accepted as a no-op.
    Progress,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetApiVersion => "getApiVersion",
            Method::SetContext => "setContext",
            Method::GetCatalogRegistrations => "getCatalogRegistrations",
            Method::EnrichCatalog => "enrichCatalog",
            Method::GetTimeRange => "getTimeRange",
            Method::GetAvailability => "getAvailability",
            Method::ReadSingle => "readSingle",
            Method::CancelRequest => "$/cancelRequest",
            Method::Progress => "$/progress",
        }
    }

    /// Whether the method needs a data source set by `setContext`.
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Method::GetCatalogRegistrations
                | Method::EnrichCatalog
                | Method::GetTimeRange
                | Method::GetAvailability
                | Method::ReadSingle
        )
    }
}

impl FromStr for Method {
    type Err = MethodError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "getApiVersion" => Ok(Method::GetApiVersion),
            "setContext" => Ok(Method::SetContext),
            "getCatalogRegistrations" => Ok(Method::GetCatalogRegistrations),
            "enrichCatalog" => Ok(Method::EnrichCatalog),
            "getTimeRange" => Ok(Method::GetTimeRange),
            "getAvailability" => Ok(Method::GetAvailability),
            "readSingle" => Ok(Method::ReadSingle),
            "$/cancelRequest" => Ok(Method::CancelRequest),
            "$/progress" => Ok(Method::Progress),
            _ => Err(MethodError::Protocol(format!("Unknown method '{}'.", name))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Positional parameters
// =============================================================================

/// Typed access to positional request parameters.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a>(pub &'a [Value]);

impl<'a> Params<'a> {
    pub fn raw(&self, index: usize, name: &str) -> anyhow::Result<&'a Value> {
        self.0
            .get(index)
            .ok_or_else(|| anyhow!("Missing parameter {} ('{}').", index, name))
    }

    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> anyhow::Result<T> {
        let raw = self.raw(index, name)?;
        T::deserialize(raw).with_context(|| format!("Invalid parameter '{}'", name))
    }

    pub fn timestamp(&self, index: usize, name: &str) -> anyhow::Result<DateTime<Utc>> {
        let raw: String = self.get(index, name)?;
        parse_timestamp(&raw).with_context(|| format!("Invalid parameter '{}'", name))
    }
}

// =============================================================================
// Timestamps
// =============================================================================

pub fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .with_context(|| format!("Timestamp '{}' does not match {}", value, TIMESTAMP_FORMAT))?;
    Ok(naive.and_utc())
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Serde adapter for `DateTime<Utc>` fields on the wire.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
