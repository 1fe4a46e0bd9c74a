//! Realtime sales-call wire protocol (JSON over WebSocket).
//!
//! Client audio travels as binary frames; everything else is JSON text.

use serde::{Deserialize, Serialize};

/// First text frame a client sends after connecting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
}

/// Control frames accepted after the init frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    /// End the call and receive the scored summary.
    End,
}

/// Messages pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A completed turn: the prospect's reply and its audio (base64) if synthesis succeeded.
    Reply {
        ai_reply: String,
        ai_audio: Option<String>,
    },
    /// Scored summary, sent after an explicit end.
    Summary {
        score: Option<i64>,
        feedback: String,
        title: String,
    },
    /// Session accepted; echoes the (possibly generated) id.
    Ready { session_id: String },
    /// A finalized user utterance.
    Transcript { transcript: String },
    /// An interim caption. Only sent when partial forwarding is enabled.
    Partial { partial: String },
    /// Diagnostic, sent before a fatal close or when a turn was dropped.
    Error { error: String },
}

impl ServerMessage {
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { error: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_null_audio_serialized() {
        let msg = ServerMessage::Reply {
            ai_reply: "Not interested.".into(),
            ai_audio: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"ai_reply": "Not interested.", "ai_audio": null}));
    }

    #[test]
    fn test_transcript_shape() {
        let msg = ServerMessage::Transcript {
            transcript: "Hi there".into(),
        };
        assert_eq!(serde_json::to_value(&msg).unwrap(), json!({"transcript": "Hi there"}));
    }

    #[test]
    fn test_parse_server_messages() {
        let reply: ServerMessage =
            serde_json::from_value(json!({"ai_reply": "ok", "ai_audio": "AAEC"})).unwrap();
        assert!(matches!(reply, ServerMessage::Reply { ai_audio: Some(_), .. }));

        let transcript: ServerMessage =
            serde_json::from_value(json!({"transcript": "hello"})).unwrap();
        assert_eq!(
            transcript,
            ServerMessage::Transcript {
                transcript: "hello".into()
            }
        );

        let ready: ServerMessage = serde_json::from_value(json!({"session_id": "s1"})).unwrap();
        assert_eq!(
            ready,
            ServerMessage::Ready {
                session_id: "s1".into()
            }
        );
    }

    #[test]
    fn test_client_init_optional_fields() {
        let init: ClientInit = serde_json::from_str(r#"{"persona": "CTO"}"#).unwrap();
        assert!(init.session_id.is_none());
        assert_eq!(init.persona.as_deref(), Some("CTO"));
    }

    #[test]
    fn test_client_end_control() {
        let ctl: ClientControl = serde_json::from_str(r#"{"type": "end"}"#).unwrap();
        assert_eq!(ctl, ClientControl::End);
        assert!(serde_json::from_str::<ClientControl>(r#"{"type": "pause"}"#).is_err());
    }
}
