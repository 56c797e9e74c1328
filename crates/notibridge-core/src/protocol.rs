//! Wire frames exchanged with the companion device.
//!
//! Every frame is a single JSON object. Requests carry `action` and
//! `requestId`; responses echo the `requestId`; push frames carry a `type`
//! and no `requestId`. Parsing is tolerant: unknown push types are returned
//! as [`Inbound::Unknown`] instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::Notification;

/// Outbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub action: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Request {
    pub fn new(action: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            request_id: request_id.into(),
            payload: Map::new(),
        }
    }

    /// Build a request from an arbitrary JSON payload; non-object payloads
    /// are rejected because their fields could not be flattened.
    pub fn with_payload(
        action: impl Into<String>,
        request_id: impl Into<String>,
        payload: Value,
    ) -> Result<Self> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Protocol(format!(
                    "request payload must be a JSON object, got {other}"
                )));
            }
        };
        let mut request = Self::new(action, request_id);
        request.payload = payload;
        Ok(request)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response frame correlated to a request by `requestId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set on the first half of a two-phase exchange (e.g. user approval).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<bool>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Response {
    pub fn is_pending(&self) -> bool {
        self.pending.unwrap_or(false)
    }

    /// String field from the response payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    pub fn payload_bool(&self, field: &str) -> bool {
        self.payload.get(field).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Unsolicited frame pushed by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Reconciliation snapshot sent after login.
    Initial(Vec<Notification>),
    /// Single lifecycle event.
    Notification(Notification),
}

/// Any inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Push(Push),
    Unknown { frame_type: String, payload: Value },
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<Inbound> {
    let raw: Value = serde_json::from_str(text)?;
    parse_value(raw)
}

/// Parse an inbound JSON value.
pub fn parse_value(raw: Value) -> Result<Inbound> {
    if !raw.is_object() {
        return Err(Error::Protocol("frame is not a JSON object".into()));
    }

    if raw.get("requestId").is_some_and(|v| !v.is_null()) {
        let response: Response = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("malformed response: {e}")))?;
        return Ok(Inbound::Response(response));
    }

    let frame_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("frame has neither 'requestId' nor 'type'".into()))?
        .to_string();

    match frame_type.as_str() {
        "initial" => {
            let data = raw.get("data").cloned().unwrap_or(Value::Array(Vec::new()));
            let batch: Vec<Notification> = serde_json::from_value(data)
                .map_err(|e| Error::Protocol(format!("malformed initial batch: {e}")))?;
            Ok(Inbound::Push(Push::Initial(batch)))
        }
        "notification" => {
            let data = raw
                .get("notification")
                .cloned()
                .ok_or_else(|| Error::Protocol("notification frame without payload".into()))?;
            let notification: Notification = serde_json::from_value(data)
                .map_err(|e| Error::Protocol(format!("malformed notification: {e}")))?;
            Ok(Inbound::Push(Push::Notification(notification)))
        }
        _ => Ok(Inbound::Unknown {
            frame_type,
            payload: raw,
        }),
    }
}
