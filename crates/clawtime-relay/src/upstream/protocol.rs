//! Agent gateway wire frames.
//!
//! Requests are `{type:"req", id, method, params}`, responses echo the id as
//! `{type:"res", id, ok, payload | error}`, and unsolicited traffic arrives as
//! `{type:"event", event, payload}`.

use clawtime_core::MessageContent;
use clawtime_core::config::AgentConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::protocol::ChatState;

pub const PROTOCOL_VERSION: u32 = 3;

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_CHAT_SEND: &str = "chat.send";
pub const EVENT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_CHAT: &str = "chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        error: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Frame {
    pub fn request(method: &str, params: Value) -> (String, Self) {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = Self::Req {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        (id, frame)
    }
}

/// Human-readable text of a response `error`, which may be a string or an
/// object with a `message`.
pub fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), String::from),
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

/// Payload of a `chat` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    #[serde(default)]
    pub session_key: Option<String>,
    pub state: ChatState,
    #[serde(default)]
    pub message: Option<ChatEventMessage>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ChatEventMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
}

impl ChatEvent {
    /// Full text of the event's message, blocks joined by a blank line.
    pub fn text(&self) -> String {
        self.message
            .as_ref()
            .map(|m| m.content.full_text())
            .unwrap_or_default()
    }

    pub fn images(&self) -> Vec<String> {
        self.message
            .as_ref()
            .map(|m| m.content.images())
            .unwrap_or_default()
    }

    pub fn has_tool_use(&self) -> bool {
        self.message
            .as_ref()
            .is_some_and(|m| m.content.has_tool_use())
    }
}

/// Params for the `connect` request answering a challenge.
pub fn connect_params(config: &AgentConfig, nonce: Option<&str>) -> Value {
    let mut params = json!({
        "minProtocol": PROTOCOL_VERSION,
        "maxProtocol": PROTOCOL_VERSION,
        "client": {
            "id": config.client_id,
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "mode": "webchat",
        },
        "role": "operator",
        "scopes": ["operator.read", "operator.write"],
    });
    if let Some(token) = &config.token {
        params["auth"] = json!({ "token": token });
    }
    if let Some(nonce) = nonce {
        params["nonce"] = json!(nonce);
    }
    params
}

/// An image forwarded with a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime_type: String,
    /// Base64 body without the `data:` prefix.
    pub content: String,
}

impl Attachment {
    /// Build an image attachment from a `data:<mime>;base64,<body>` URL.
    pub fn from_data_url(data_url: &str) -> Option<Self> {
        let rest = data_url.strip_prefix("data:")?;
        let (meta, body) = rest.split_once(',')?;
        let mime = meta.strip_suffix(";base64")?;
        if body.is_empty() {
            return None;
        }
        Some(Self {
            kind: "image".to_string(),
            mime_type: if mime.is_empty() {
                "image/png".to_string()
            } else {
                mime.to_string()
            },
            content: body.to_string(),
        })
    }
}

/// Params for `chat.send`. `idempotency_key` must be unique per request.
pub fn chat_send_params(
    session_key: &str,
    text: &str,
    attachments: &[Attachment],
    idempotency_key: &str,
) -> Value {
    let mut params = json!({
        "sessionKey": session_key,
        "message": text,
        "idempotencyKey": idempotency_key,
    });
    if !attachments.is_empty() {
        params["attachments"] = json!(attachments);
    }
    params
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": {"nonce": "n1"}
        }))
        .unwrap();
        assert!(matches!(&frame, Frame::Event { event, .. } if event == EVENT_CHALLENGE));

        let frame: Frame = serde_json::from_value(json!({
            "type": "res", "id": "1", "ok": false, "error": {"message": "nope"}
        }))
        .unwrap();
        let Frame::Res { ok, error, .. } = frame else {
            panic!("expected res");
        };
        assert!(!ok);
        assert_eq!(error_message(&error), "nope");
    }

    #[test]
    fn request_ids_are_unique() {
        let (a, _) = Frame::request(METHOD_CHAT_SEND, Value::Null);
        let (b, frame) = Frame::request(METHOD_CHAT_SEND, Value::Null);
        assert_ne!(a, b);
        let value = serde_json::to_value(frame).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "chat.send");
        assert_eq!(value["id"], b.as_str());
    }

    #[test]
    fn chat_event_text_joins_blocks() {
        let event: ChatEvent = serde_json::from_value(json!({
            "runId": "r1",
            "sessionKey": "main",
            "state": "delta",
            "message": {"role": "assistant", "content": [
                {"type": "text", "text": "One"},
                {"type": "tool_use", "name": "search", "input": {}},
                {"type": "text", "text": "Two"}
            ]}
        }))
        .unwrap();
        assert_eq!(event.text(), "One\n\nTwo");
        assert!(event.has_tool_use());
        assert_eq!(event.state, ChatState::Delta);
    }

    #[test]
    fn chat_event_without_message() {
        let event: ChatEvent = serde_json::from_value(json!({
            "runId": "r1", "state": "error", "errorMessage": "boom"
        }))
        .unwrap();
        assert_eq!(event.text(), "");
        assert_eq!(event.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn connect_params_include_token_and_nonce() {
        let config = AgentConfig {
            token: Some("secret".into()),
            ..Default::default()
        };
        let params = connect_params(&config, Some("n1"));
        assert_eq!(params["auth"]["token"], "secret");
        assert_eq!(params["nonce"], "n1");
        assert_eq!(params["client"]["id"], "clawtime");

        let params = connect_params(&AgentConfig::default(), None);
        assert!(params.get("auth").is_none());
    }

    #[test]
    fn attachment_from_data_url() {
        let att = Attachment::from_data_url("data:image/jpeg;base64,QUJD").unwrap();
        assert_eq!(att.mime_type, "image/jpeg");
        assert_eq!(att.content, "QUJD");
        assert!(Attachment::from_data_url("https://example.com/x.png").is_none());
        assert!(Attachment::from_data_url("data:image/png;base64,").is_none());

        let params = chat_send_params("main", "look", &[att], "key-1");
        assert_eq!(params["attachments"][0]["type"], "image");
        assert_eq!(params["attachments"][0]["mimeType"], "image/jpeg");
        assert_eq!(params["idempotencyKey"], "key-1");
    }
}
