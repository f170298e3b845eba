//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Identifier of a live client connection.
pub type ClientId = String;

/// Default terminal width used when a client does not send geometry.
pub const DEFAULT_COLS: u16 = 120;

/// Default terminal height used when a client does not send geometry.
pub const DEFAULT_ROWS: u16 = 30;

/// Which kind of backend drives a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Structured JSON-over-stdio subprocess
    #[default]
    Chat,
    /// Interactive CLI inside a pseudo-terminal
    Terminal,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Chat => "chat",
            SessionMode::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    /// Build a size from optional wire values, falling back per dimension.
    pub fn from_parts(cols: Option<u16>, rows: Option<u16>, fallback: TerminalSize) -> Self {
        Self {
            cols: cols.filter(|c| *c > 0).unwrap_or(fallback.cols),
            rows: rows.filter(|r| *r > 0).unwrap_or(fallback.rows),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}
