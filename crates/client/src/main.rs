//! relaydock-attach - drive a relaydock session from the terminal.
//!
//! Lines typed on stdin become `message.send` (chat) or `terminal.input`
//! (terminal). `/interrupt` stops the current turn, `/quit` closes the
//! session and exits.

use std::io::Write;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use relaydock_client::{
    spawn, AssemblerUpdate, ChannelConfig, ChannelEvent, ChannelHandle, StreamAssembler,
};
use relaydock_protocol::{ClientMessage, ServerMessage, SessionMode, StreamingMessage};

#[derive(Parser, Debug)]
#[command(name = "relaydock-attach", about = "Attach to a relaydock server")]
struct Args {
    /// WebSocket endpoint of the server.
    #[arg(long, env = "RELAYDOCK_URL", default_value = "ws://127.0.0.1:4000/ws")]
    url: String,

    /// Resume an existing conversation.
    #[arg(long)]
    session_id: Option<String>,

    /// Working directory for the assistant.
    #[arg(long)]
    project_path: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Run the interactive CLI in a terminal instead of structured chat.
    #[arg(long)]
    terminal: bool,

    #[arg(long)]
    dangerously_skip_permissions: bool,

    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = 10)]
    max_retries: u32,
}

impl Args {
    fn mode(&self) -> SessionMode {
        if self.terminal {
            SessionMode::Terminal
        } else {
            SessionMode::Chat
        }
    }

    fn start_message(&self, session_id: Option<String>) -> ClientMessage {
        let (cols, rows) = match self.mode() {
            SessionMode::Terminal => (Some(120), Some(30)),
            SessionMode::Chat => (None, None),
        };
        ClientMessage::SessionStart {
            session_id,
            project_path: self.project_path.clone(),
            mode: Some(self.mode()),
            cols,
            rows,
            model: self.model.clone(),
            dangerously_skip_permissions: self.dangerously_skip_permissions,
        }
    }
}

/// Prints streamed assistant text incrementally.
#[derive(Default)]
struct Printer {
    message_id: Option<String>,
    printed: usize,
}

impl Printer {
    fn show(&mut self, update: &AssemblerUpdate) {
        let message = update.message();
        if self.message_id.as_deref() != Some(message.id.as_str()) {
            self.message_id = Some(message.id.clone());
            self.printed = 0;
            println!();
        }
        self.print_suffix(message);
        if let AssemblerUpdate::Completed(_) = update {
            println!();
            self.message_id = None;
            self.printed = 0;
        }
    }

    fn print_suffix(&mut self, message: &StreamingMessage) {
        let text = message.text();
        if let Some(suffix) = text.get(self.printed..) {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(suffix.as_bytes());
            let _ = stdout.flush();
            self.printed = text.len();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RELAYDOCK_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = ChannelConfig {
        max_retries: args.max_retries,
        ..Default::default()
    };
    let (handle, mut events) = spawn(args.url.clone(), config);

    let mut session_id = args.session_id.clone();
    let mut assembler = StreamAssembler::new();
    let mut printer = Printer::default();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                match event {
                    ChannelEvent::Connected => {
                        eprintln!("[connected to {}]", args.url);
                        // Every (re)connect is a new server client; resume the session.
                        assembler.reset();
                        handle.send(args.start_message(session_id.clone()));
                    }
                    ChannelEvent::Reconnecting { attempt, delay } => {
                        eprintln!("[connection lost, retry {attempt} in {}ms]", delay.as_millis());
                    }
                    ChannelEvent::Failed => bail!("could not reach {} after retrying", args.url),
                    ChannelEvent::Closed => return Ok(()),
                    ChannelEvent::Message(message) => {
                        handle_server_message(
                            message,
                            &mut session_id,
                            &mut assembler,
                            &mut printer,
                        );
                    }
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => send_line(&handle, args.mode(), line),
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        handle.send(ClientMessage::SessionClose);
                        handle.close();
                    }
                }
            }
        }
    }
}

fn handle_server_message(
    message: ServerMessage,
    session_id: &mut Option<String>,
    assembler: &mut StreamAssembler,
    printer: &mut Printer,
) {
    match message {
        ServerMessage::Connected { client_id } => eprintln!("[client {client_id}]"),
        ServerMessage::SessionStarted {
            session_id: Some(id),
            mode,
        } => {
            eprintln!("[session {id} ({mode})]");
            *session_id = Some(id);
        }
        ServerMessage::SessionStarted {
            session_id: None,
            mode,
        } => eprintln!("[session starting ({mode})]"),
        ServerMessage::AssistantChunk { content } => {
            for update in assembler.push(&content) {
                printer.show(&update);
            }
        }
        ServerMessage::TerminalOutput { data } => {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(data.as_bytes());
            let _ = stdout.flush();
        }
        ServerMessage::SessionEnded { reason, .. } => eprintln!("[session ended: {reason}]"),
        ServerMessage::SessionControl { has_control, .. } => {
            if !has_control {
                eprintln!("[another client controls this session; /control to take over]");
            }
        }
        ServerMessage::Error { message } => eprintln!("[error: {message}]"),
        ServerMessage::Pong => {}
    }
}

fn send_line(handle: &ChannelHandle, mode: SessionMode, line: String) {
    let message = match line.trim() {
        "/interrupt" => ClientMessage::SessionInterrupt,
        "/control" => ClientMessage::ControlRequest { session_id: None },
        "/quit" => {
            handle.send(ClientMessage::SessionClose);
            handle.close();
            return;
        }
        _ => match mode {
            SessionMode::Chat => ClientMessage::MessageSend { content: line },
            SessionMode::Terminal => ClientMessage::TerminalInput {
                content: format!("{line}\r"),
            },
        },
    };
    handle.send(message);
}
