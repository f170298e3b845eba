//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::SessionMode;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start (or restart) the backend bound to this client
    #[serde(rename = "session.start", rename_all = "camelCase")]
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<SessionMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        dangerously_skip_permissions: bool,
    },

    /// Send a user turn (chat) or raw input (terminal)
    #[serde(rename = "message.send")]
    MessageSend {
        #[serde(default)]
        content: String,
    },

    #[serde(rename = "session.interrupt")]
    SessionInterrupt,

    #[serde(rename = "session.close")]
    SessionClose,

    #[serde(rename = "mode.switch")]
    ModeSwitch {
        mode: SessionMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    /// Raw keystrokes for the terminal backend
    #[serde(rename = "terminal.input")]
    TerminalInput {
        #[serde(default)]
        content: String,
    },

    #[serde(rename = "terminal.resize")]
    TerminalResize { cols: u16, rows: u16 },

    /// Take control of a shared session (defaults to the current one)
    #[serde(rename = "control.request", rename_all = "camelCase")]
    ControlRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionStart { .. } => "session.start",
            ClientMessage::MessageSend { .. } => "message.send",
            ClientMessage::SessionInterrupt => "session.interrupt",
            ClientMessage::SessionClose => "session.close",
            ClientMessage::ModeSwitch { .. } => "mode.switch",
            ClientMessage::TerminalInput { .. } => "terminal.input",
            ClientMessage::TerminalResize { .. } => "terminal.resize",
            ClientMessage::ControlRequest { .. } => "control.request",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
///
/// The `Display` text is what the client receives in an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON message")]
    InvalidJson,

    #[error("Message must have a type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

const KNOWN_TYPES: &[&str] = &[
    "session.start",
    "message.send",
    "session.interrupt",
    "session.close",
    "mode.switch",
    "terminal.input",
    "terminal.resize",
    "control.request",
    "ping",
];

/// Parse one inbound text frame.
///
/// Distinguishes non-JSON input, objects without a string `type`, unknown
/// types and malformed payloads so each gets its own client-visible error.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolError::MissingType),
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_start_with_camel_case_fields() {
        let msg = parse_client_message(
            r#"{"type":"session.start","sessionId":"abc","projectPath":"/tmp/p","mode":"terminal","cols":100,"rows":40,"dangerouslySkipPermissions":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SessionStart {
                session_id: Some("abc".into()),
                project_path: Some("/tmp/p".into()),
                mode: Some(SessionMode::Terminal),
                cols: Some(100),
                rows: Some(40),
                model: None,
                dangerously_skip_permissions: true,
            }
        );
    }

    #[test]
    fn bare_session_start_uses_defaults() {
        let msg = parse_client_message(r#"{"type":"session.start"}"#).unwrap();
        match msg {
            ClientMessage::SessionStart {
                session_id,
                mode,
                dangerously_skip_permissions,
                ..
            } => {
                assert!(session_id.is_none());
                assert!(mode.is_none());
                assert!(!dangerously_skip_permissions);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unit_messages_parse() {
        assert_eq!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            parse_client_message(r#"{"type":"session.close"}"#).unwrap(),
            ClientMessage::SessionClose
        );
    }

    #[test]
    fn missing_content_defaults_to_empty() {
        let msg = parse_client_message(r#"{"type":"message.send"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::MessageSend {
                content: String::new()
            }
        );
    }

    #[test]
    fn rejects_untyped_and_invalid_frames() {
        assert_eq!(
            parse_client_message(r#"{"content":"hi"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            parse_client_message(r#"{"type":42}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            parse_client_message("not json"),
            Err(ProtocolError::InvalidJson)
        );
        assert_eq!(
            ProtocolError::MissingType.to_string(),
            "Message must have a type"
        );
        assert_eq!(ProtocolError::InvalidJson.to_string(), "Invalid JSON message");
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        assert_eq!(
            parse_client_message(r#"{"type":"session.explode"}"#),
            Err(ProtocolError::UnknownType("session.explode".into()))
        );
    }

    #[test]
    fn malformed_payload_names_the_message_kind() {
        let err = parse_client_message(r#"{"type":"terminal.resize","cols":"wide"}"#).unwrap_err();
        match err {
            ProtocolError::InvalidPayload { kind, .. } => assert_eq!(kind, "terminal.resize"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn serializes_with_dotted_type_tag() {
        let json = serde_json::to_value(ClientMessage::ControlRequest {
            session_id: Some("s1".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "control.request");
        assert_eq!(json["sessionId"], "s1");
    }
}
