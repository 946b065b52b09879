//! Message envelope vocabulary shared by every transport.
//!
//! Every frame on every transport decodes to a [`Message`]: a `(module,
//! action, kind)` triple with an optional `data` payload and, for failed
//! replies, an ordered list of [`ErrorReport`] records. The serde
//! representation below *is* the wire format; transports add framing and
//! addressing but never reshape the envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Literal prefix required on every validation-failure description.
///
/// Clients pattern-match on this prefix, so it is part of the wire
/// contract.
pub const INCORRECT_INPUT_PREFIX: &str = "Incorrect input.";

/// The three message kinds carried on the bus.
///
/// An error reply is a `Reply` whose `errors` list is non-empty; there is
/// no separate wire kind for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Reply,
    Notification,
}

impl MessageKind {
    /// Wire spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Reply => "reply",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error discriminants carried inside [`ErrorReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationFailed,
    UnknownModule,
    UnknownAction,
    WrongMessageKind,
    ServiceFailed,
    Internal,
}

/// One entry of a failed reply's `errors` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl ErrorReport {
    /// Validation failure with the mandatory `"Incorrect input."` prefix.
    #[must_use]
    pub fn incorrect_input(code: ErrorCode, detail: &str) -> Self {
        Self {
            code,
            description: format!("{INCORRECT_INPUT_PREFIX} {detail}"),
            stacktrace: None,
        }
    }

    /// Internal error; `stacktrace` is attached by the dispatcher only in
    /// debug mode.
    #[must_use]
    pub fn internal(description: impl Into<String>, stacktrace: Option<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            description: description.into(),
            stacktrace,
        }
    }
}

/// Envelope decode failures.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to decode message envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message envelope is not valid UTF-8 JSON")]
    NotJson,
}

/// The unit of traffic on every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub module: String,
    pub action: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorReport>,
}

impl Message {
    /// A request envelope.
    #[must_use]
    pub fn request(module: &str, action: &str, data: Option<Value>) -> Self {
        Self {
            module: module.to_string(),
            action: action.to_string(),
            kind: MessageKind::Request,
            data,
            errors: Vec::new(),
        }
    }

    /// A successful reply to `request`, carrying `data`.
    #[must_use]
    pub fn reply_to(request: &Self, data: Value) -> Self {
        Self {
            module: request.module.clone(),
            action: request.action.clone(),
            kind: MessageKind::Reply,
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// A failed reply to `request`. `errors` must be non-empty.
    #[must_use]
    pub fn error_reply_to(request: &Self, errors: Vec<ErrorReport>) -> Self {
        debug_assert!(!errors.is_empty(), "error reply needs at least one error");
        Self {
            module: request.module.clone(),
            action: request.action.clone(),
            kind: MessageKind::Reply,
            data: None,
            errors,
        }
    }

    /// An unsolicited notification envelope.
    #[must_use]
    pub fn notification(module: &str, action: &str, data: Option<Value>) -> Self {
        Self {
            module: module.to_string(),
            action: action.to_string(),
            kind: MessageKind::Notification,
            data,
            errors: Vec::new(),
        }
    }

    /// Decode an envelope from raw frame bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize the envelope to frame bytes.
    ///
    /// Serialization of an envelope built through the constructors cannot
    /// fail; the fallible signature exists for callers embedding foreign
    /// `data` payloads.
    pub fn to_vec(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether this is a reply that carries errors.
    #[must_use]
    pub fn is_error_reply(&self) -> bool {
        self.kind == MessageKind::Reply && !self.errors.is_empty()
    }

    /// Whether the reply payload signals an application-level refusal
    /// (`{"result": false}`). Distinct from an error reply: a refusal is a
    /// valid business answer and emits no notification.
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(
            self.data.as_ref().and_then(|d| d.get("result")),
            Some(Value::Bool(false))
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_round_trips_through_wire_bytes() {
        let msg = Message::request("dns", "get_settings", None);
        let bytes = msg.to_vec().unwrap();
        let back = Message::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
        // Absent data must be omitted, not serialized as null.
        assert!(!String::from_utf8(bytes).unwrap().contains("data"));
    }

    #[test]
    fn kind_serializes_lowercase() {
        let msg = Message::notification("web", "set_language", Some(json!({"language": "cs"})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "notification");
    }

    #[test]
    fn unknown_envelope_fields_are_rejected() {
        let raw = br#"{"module":"web","action":"get_data","kind":"request","bogus":1}"#;
        assert!(Message::from_slice(raw).is_err());
    }

    #[test]
    fn error_reply_keeps_order_and_prefix() {
        let req = Message::request("web", "set_language", Some(json!({"language": "xx"})));
        let reply = Message::error_reply_to(
            &req,
            vec![
                ErrorReport::incorrect_input(ErrorCode::ValidationFailed, "bad language"),
                ErrorReport::internal("secondary", None),
            ],
        );
        assert!(reply.is_error_reply());
        assert!(reply.errors[0].description.starts_with(INCORRECT_INPUT_PREFIX));
        assert_eq!(reply.errors.len(), 2);
    }

    #[test]
    fn refusal_is_not_an_error_reply() {
        let req = Message::request("subordinates", "del", Some(json!({"controller_id": "ab"})));
        let reply = Message::reply_to(&req, json!({"result": false}));
        assert!(reply.is_refusal());
        assert!(!reply.is_error_reply());
    }
}
