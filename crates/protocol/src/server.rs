//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, SessionMode};

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    // Connection lifecycle
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { client_id: ClientId },

    #[serde(rename = "pong")]
    Pong,

    // Session lifecycle
    #[serde(rename = "session.started", rename_all = "camelCase")]
    SessionStarted {
        session_id: Option<String>,
        #[serde(default)]
        mode: SessionMode,
    },
    #[serde(rename = "session.ended", rename_all = "camelCase")]
    SessionEnded {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename = "session.control", rename_all = "camelCase")]
    SessionControl {
        has_control: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    // Backend output
    /// Raw structured stdout from a chat backend (NDJSON, possibly partial)
    #[serde(rename = "assistant.chunk")]
    AssistantChunk { content: String },

    /// Raw pty output from a terminal backend
    #[serde(rename = "terminal.output")]
    TerminalOutput { data: String },

    // Errors
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Pong => "pong",
            ServerMessage::SessionStarted { .. } => "session.started",
            ServerMessage::SessionEnded { .. } => "session.ended",
            ServerMessage::SessionControl { .. } => "session.control",
            ServerMessage::AssistantChunk { .. } => "assistant.chunk",
            ServerMessage::TerminalOutput { .. } => "terminal.output",
            ServerMessage::Error { .. } => "error",
        }
    }
}
