//! Backend invocation building.
//!
//! A [`Launcher`] turns spawn options into the OS command for each backend
//! kind. [`AssistantCli`] runs the real assistant CLI; [`ScriptLauncher`] runs
//! shell scripts in its place for tests and local smoke runs.

use std::path::{Path, PathBuf};

use portable_pty::CommandBuilder;
use tracing::{debug, warn};

use crate::process::ProcessSpawnOptions;
use crate::pty::PtySpawnOptions;

/// Builds backend commands from spawn options.
pub trait Launcher: Send + Sync {
    /// Command for a structured (stream-json over stdio) backend.
    fn chat_command(&self, options: &ProcessSpawnOptions) -> tokio::process::Command;

    /// Command for an interactive backend inside a pseudo-terminal.
    fn terminal_command(&self, options: &PtySpawnOptions) -> CommandBuilder;
}

/// The assistant CLI (`claude`).
#[derive(Debug, Clone)]
pub struct AssistantCli {
    program: String,
    shell: String,
}

impl AssistantCli {
    pub fn new(program: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            shell: shell.into(),
        }
    }

    /// Resolve the CLI binary and login shell.
    ///
    /// Binary: `explicit` > `CLAUDE_BIN` > `~/.claude/local/claude` > `PATH`.
    /// Falls back to the bare name so a missing install surfaces as a spawn
    /// failure on first use rather than at startup.
    pub fn resolve(explicit: Option<&Path>, shell: Option<&str>) -> Self {
        let program = resolve_binary(explicit);
        let shell = shell
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self { program, shell }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Arguments for the structured chat backend.
    pub fn chat_args(options: &ProcessSpawnOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(id) = &options.session_id {
            args.extend(["--resume".to_string(), id.clone()]);
        }
        if let Some(model) = &options.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if options.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }

    /// Arguments for the interactive terminal backend.
    pub fn terminal_args(options: &PtySpawnOptions) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(id) = &options.session_id {
            args.extend(["--resume".to_string(), id.clone()]);
        }
        if options.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }
}

impl Launcher for AssistantCli {
    fn chat_command(&self, options: &ProcessSpawnOptions) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(Self::chat_args(options));
        if let Some(cwd) = &options.project_path {
            command.current_dir(cwd);
        }
        command.env("CLAUDE_CODE_ENTRYPOINT", "relaydock");
        command
    }

    fn terminal_command(&self, options: &PtySpawnOptions) -> CommandBuilder {
        let mut line = shell_quote(&self.program);
        for arg in Self::terminal_args(options) {
            line.push(' ');
            line.push_str(&shell_quote(&arg));
        }

        let script = format!("exec {line}");
        let mut command = CommandBuilder::new(&self.shell);
        command.args(["-l", "-c", script.as_str()]);
        if let Some(cwd) = &options.project_path {
            command.cwd(cwd);
        }
        command.env("TERM", "xterm-256color");
        command.env("CLAUDE_CODE_ENTRYPOINT", "relaydock");
        command
    }
}

/// Runs `sh -c <script>` for each backend kind.
///
/// Spawn options are exposed to the script as `RELAYDOCK_SESSION_ID`,
/// `RELAYDOCK_MODEL` and `RELAYDOCK_PROJECT_PATH`.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    pub chat_script: String,
    pub terminal_script: String,
}

impl ScriptLauncher {
    pub fn new(chat_script: impl Into<String>, terminal_script: impl Into<String>) -> Self {
        Self {
            chat_script: chat_script.into(),
            terminal_script: terminal_script.into(),
        }
    }

    /// Both backends echo their input back (`cat`).
    pub fn echo() -> Self {
        Self::new("cat", "cat")
    }
}

impl Launcher for ScriptLauncher {
    fn chat_command(&self, options: &ProcessSpawnOptions) -> tokio::process::Command {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(&self.chat_script);
        if let Some(cwd) = &options.project_path {
            command.current_dir(cwd);
        }
        command.env(
            "RELAYDOCK_SESSION_ID",
            options.session_id.as_deref().unwrap_or(""),
        );
        command.env("RELAYDOCK_MODEL", options.model.as_deref().unwrap_or(""));
        command.env(
            "RELAYDOCK_PROJECT_PATH",
            options.project_path.as_deref().unwrap_or(""),
        );
        command
    }

    fn terminal_command(&self, options: &PtySpawnOptions) -> CommandBuilder {
        let mut command = CommandBuilder::new("sh");
        command.args(["-c", self.terminal_script.as_str()]);
        if let Some(cwd) = &options.project_path {
            command.cwd(cwd);
        }
        command.env(
            "RELAYDOCK_SESSION_ID",
            options.session_id.as_deref().unwrap_or(""),
        );
        command.env(
            "RELAYDOCK_PROJECT_PATH",
            options.project_path.as_deref().unwrap_or(""),
        );
        command
    }
}

fn resolve_binary(explicit: Option<&Path>) -> String {
    if let Some(path) = explicit {
        return path.to_string_lossy().into_owned();
    }

    if let Ok(path) = std::env::var("CLAUDE_BIN") {
        if Path::new(&path).exists() {
            return path;
        }
        warn!(
            component = "launcher",
            event = "launcher.binary.env_not_found",
            path = %path,
            "CLAUDE_BIN path does not exist, trying fallbacks"
        );
    }

    if let Some(home) = std::env::var_os("HOME") {
        let local = PathBuf::from(home).join(".claude/local/claude");
        if local.exists() {
            return local.to_string_lossy().into_owned();
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("claude");
            if candidate.is_file() {
                debug!(
                    component = "launcher",
                    event = "launcher.binary.path_hit",
                    path = %candidate.display(),
                    "Resolved assistant CLI from PATH"
                );
                return candidate.to_string_lossy().into_owned();
            }
        }
    }

    warn!(
        component = "launcher",
        event = "launcher.binary.not_found",
        "Assistant CLI not found; set CLAUDE_BIN or --claude-bin"
    );
    "claude".to_string()
}

/// Single-quote `value` for a POSIX shell command line.
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_options() -> ProcessSpawnOptions {
        ProcessSpawnOptions {
            session_id: Some("sess-1".into()),
            model: Some("opus".into()),
            skip_permissions: true,
            ..Default::default()
        }
    }

    #[test]
    fn chat_args_carry_streaming_flags_and_resume() {
        let args = AssistantCli::chat_args(&chat_options());
        for flag in ["--print", "--input-format", "--output-format", "stream-json"] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "sess-1");
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model + 1], "opus");
        assert!(args.iter().any(|a| a == "--dangerously-skip-permissions"));
    }

    #[test]
    fn fresh_chat_has_no_resume_flag() {
        let args = AssistantCli::chat_args(&ProcessSpawnOptions::default());
        assert!(!args.iter().any(|a| a == "--resume"));
        assert!(!args.iter().any(|a| a == "--model"));
    }

    #[test]
    fn terminal_args_resume_session() {
        let options = PtySpawnOptions {
            session_id: Some("abc".into()),
            ..Default::default()
        };
        assert_eq!(AssistantCli::terminal_args(&options), vec!["--resume", "abc"]);
    }

    #[test]
    fn quotes_shell_arguments() {
        assert_eq!(shell_quote("plain-arg"), "plain-arg");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn explicit_binary_wins() {
        let cli = AssistantCli::resolve(Some(Path::new("/opt/claude")), Some("/bin/zsh"));
        assert_eq!(cli.program(), "/opt/claude");
        assert_eq!(cli.shell(), "/bin/zsh");
    }
}
