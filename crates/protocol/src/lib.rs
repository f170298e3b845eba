//! relaydock Protocol
//!
//! Shared types for communication between the relaydock server and browser
//! or terminal clients. Wire messages are serialized as one JSON object per
//! WebSocket text frame; stream types describe the assistant output that
//! clients rebuild from `assistant.chunk` payloads.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod stream;
pub mod types;

pub use client::{parse_client_message, ClientMessage, ProtocolError};
pub use server::ServerMessage;
pub use stream::{ContentBlock, MessageRole, StreamingMessage, ToolInput};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
