//! Command line and environment configuration.

use std::path::PathBuf;

use clap::Parser;

use relaydock_supervisor::DEFAULT_MAX_LIVE;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "relaydock",
    version,
    about = "Relay WebSocket sessions to local assistant CLI backends"
)]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "RELAYDOCK_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, short, env = "RELAYDOCK_PORT", default_value_t = 4000)]
    pub port: u16,

    /// Data directory (logs). Defaults to ~/.relaydock
    #[arg(long, env = "RELAYDOCK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Assistant CLI binary; found on PATH or in common install locations otherwise
    #[arg(long, env = "RELAYDOCK_CLAUDE_BIN")]
    pub claude_bin: Option<PathBuf>,

    /// Shell used to launch terminal sessions (defaults to $SHELL)
    #[arg(long, env = "RELAYDOCK_SHELL")]
    pub shell: Option<String>,

    /// Working directory for sessions started without a project path
    #[arg(long, env = "RELAYDOCK_PROJECT_PATH")]
    pub default_project: Option<String>,

    /// Ceiling on live chat subprocesses
    #[arg(long, env = "RELAYDOCK_MAX_PROCESSES", default_value_t = DEFAULT_MAX_LIVE)]
    pub max_processes: usize,

    /// Ceiling on live terminals
    #[arg(long, env = "RELAYDOCK_MAX_TERMINALS", default_value_t = DEFAULT_MAX_LIVE)]
    pub max_terminals: usize,

    /// Outbound frames buffered per client before new ones are dropped
    #[arg(long, env = "RELAYDOCK_CLIENT_QUEUE", default_value_t = 256)]
    pub client_queue: usize,

    /// Mirror logs to stderr
    #[arg(long, env = "RELAYDOCK_LOG_STDERR")]
    pub log_stderr: bool,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
