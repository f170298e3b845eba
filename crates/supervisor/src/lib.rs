//! relaydock Supervisors
//!
//! Own the assistant CLI backends: structured JSON-over-stdio subprocesses
//! ([`ProcessSupervisor`]) and interactive pseudo-terminals
//! ([`PtySupervisor`]). Each supervisor's handle table is the single source of
//! truth for whether an execution is alive; handles leave the table the moment
//! their process exits or is killed.

pub mod launcher;
mod listeners;
pub mod process;
pub mod pty;

use thiserror::Error;

pub use launcher::{AssistantCli, Launcher, ScriptLauncher};
pub use listeners::{ListenerId, OutputHandler};
pub use process::{
    encode_user_turn, ProcessEvent, ProcessEventKind, ProcessInfo, ProcessSpawnOptions,
    ProcessStatus, ProcessSupervisor,
};
pub use pty::{PtyEvent, PtyEventKind, PtyInfo, PtySpawnOptions, PtySupervisor};

/// Identifier of a supervised backend.
pub type HandleId = String;

/// Default ceiling on live handles per supervisor.
pub const DEFAULT_MAX_LIVE: usize = 10;

/// ETX, what a terminal sends for Ctrl-C.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// Errors that can occur in supervisors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Too many active sessions (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("Failed to start assistant: {0}")]
    SpawnFailure(String),

    #[error("No backend with id {0}")]
    BackendNotFound(HandleId),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),
}

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    /// Human readable reason, e.g. `Signal: SIGTERM` or `Exit code: 0`.
    pub fn reason(&self) -> String {
        if let Some(signal) = &self.signal {
            format!("Signal: {signal}")
        } else {
            format!("Exit code: {}", self.code.unwrap_or(-1))
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal().map(signal_name),
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: None,
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        other => return format!("SIG{other}"),
    };
    name.to_string()
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Admission bookkeeping shared by both supervisors: live entries plus spawns
/// whose OS call is still in flight count against the ceiling.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    reserved: usize,
}

impl Admission {
    pub(crate) fn reserve(&mut self, live: usize, limit: usize) -> Result<(), SupervisorError> {
        if live + self.reserved >= limit {
            return Err(SupervisorError::CapacityExceeded { limit });
        }
        self.reserved += 1;
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }
}
