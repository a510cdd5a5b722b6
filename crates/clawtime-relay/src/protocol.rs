//! Client-facing wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. After key exchange the
//! object travels inside an encrypted envelope; the shapes here are what the
//! envelope carries.

use clawtime_core::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by the browser client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(alias = "authenticate")]
    Auth { token: String },
    KeyExchange { client_public_key: String },
    Send { text: String },
    GetHistory,
    Image {
        /// `data:` URL of the image.
        data: String,
        #[serde(default)]
        caption: Option<String>,
    },
    FetchResource { url: String },
    BargeIn {
        #[serde(default)]
        run_id: Option<String>,
    },
    Ping,
    VoiceMode { enabled: bool },
    ReverifyResult { request_id: String, verified: bool },
    Audio {
        /// Base64 audio recording.
        data: String,
    },
    WidgetResponse {
        id: String,
        #[serde(default)]
        widget: Option<String>,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        action: Option<String>,
    },
}

impl ClientMessage {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::KeyExchange { .. } => "key-exchange",
            Self::Send { .. } => "send",
            Self::GetHistory => "get-history",
            Self::Image { .. } => "image",
            Self::FetchResource { .. } => "fetch-resource",
            Self::BargeIn { .. } => "barge-in",
            Self::Ping => "ping",
            Self::VoiceMode { .. } => "voice-mode",
            Self::ReverifyResult { .. } => "reverify-result",
            Self::Audio { .. } => "audio",
            Self::WidgetResponse { .. } => "widget-response",
        }
    }
}

/// Streaming state of a chat update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Error,
    Aborted,
}

/// Avatar animation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarState {
    Idle,
    Thinking,
    Working,
    Talking,
}

/// Frames sent to the browser client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    AuthOk {
        server_public_key: String,
    },
    AuthFail {
        reason: String,
    },
    EncryptionReady,
    Connected {
        avatar_state: AvatarState,
    },
    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Chat {
        state: ChatState,
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    AvatarState {
        state: AvatarState,
    },
    History {
        messages: Vec<Message>,
    },
    SpeechAudio {
        audio_data: String,
        run_id: String,
    },
    Transcription {
        text: String,
    },
    TranscriptionError {
        error: String,
    },
    ResourceData {
        url: String,
        content_type: String,
        data: String,
    },
    ResourceError {
        url: String,
        error: String,
    },
    Reverify {
        request_id: String,
    },
    Pong,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_client_frames() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"key-exchange","clientPublicKey":"BAAA"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::KeyExchange {
                client_public_key: "BAAA".into()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get-history"}"#).unwrap();
        assert_eq!(msg, ClientMessage::GetHistory);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"barge-in","runId":"r1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::BargeIn {
                run_id: Some("r1".into())
            }
        );
    }

    #[test]
    fn authenticate_is_an_alias_for_auth() {
        let a: ClientMessage = serde_json::from_str(r#"{"type":"auth","token":"t"}"#).unwrap();
        let b: ClientMessage =
            serde_json::from_str(r#"{"type":"authenticate","token":"t"}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.kind(), "auth");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn encodes_server_frames() {
        let value = serde_json::to_value(ServerMessage::AuthOk {
            server_public_key: "BBBB".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "auth-ok", "serverPublicKey": "BBBB"}));

        let value = serde_json::to_value(ServerMessage::Chat {
            state: ChatState::Delta,
            run_id: "r1".into(),
            text: Some("He".into()),
            error: None,
            images: Vec::new(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "chat", "state": "delta", "runId": "r1", "text": "He"})
        );

        let value = serde_json::to_value(ServerMessage::Connected {
            avatar_state: AvatarState::Idle,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "connected", "avatarState": "idle"}));

        let value = serde_json::to_value(ServerMessage::EncryptionReady).unwrap();
        assert_eq!(value, json!({"type": "encryption-ready"}));
    }
}
