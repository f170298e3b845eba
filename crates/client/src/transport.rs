//! tokio-tungstenite driver for [`ReconnectingChannel`].

use std::collections::VecDeque;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use relaydock_protocol::ClientMessage;

use crate::channel::{Action, ChannelConfig, ChannelEvent, ReconnectingChannel, TokioClock};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(ClientMessage),
    Close,
}

/// Sending half of a running channel
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Send now, or queue until the socket is back. False once the driver stopped.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.commands.send(Command::Send(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Connect to `url` and keep reconnecting per `config`.
///
/// Events end with `Failed` or `Closed`, after which the receiver closes.
pub fn spawn(
    url: impl Into<String>,
    config: ChannelConfig,
) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let channel = ReconnectingChannel::new(config, TokioClock);
    tokio::spawn(drive(url.into(), channel, command_rx, event_tx));
    (
        ChannelHandle {
            commands: command_tx,
        },
        event_rx,
    )
}

async fn drive(
    url: String,
    mut channel: ReconnectingChannel<TokioClock>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut socket: Option<WsStream> = None;
    let mut pending: VecDeque<Action> = channel.start().into();

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Connect => match connect_async(url.as_str()).await {
                    Ok((ws, _response)) => {
                        socket = Some(ws);
                        pending.extend(channel.handle_open());
                    }
                    Err(e) => {
                        debug!(
                            component = "channel",
                            event = "channel.connect_failed",
                            url = %url,
                            error = %e,
                            "Connection attempt failed"
                        );
                        pending.extend(channel.handle_close());
                    }
                },
                Action::Transmit(text) => {
                    let Some(ws) = socket.as_mut() else {
                        continue;
                    };
                    if let Err(e) = ws.send(Message::Text(text.into())).await {
                        warn!(
                            component = "channel",
                            event = "channel.send_failed",
                            error = %e,
                            "Send failed, treating socket as closed"
                        );
                        socket = None;
                        pending.extend(channel.handle_close());
                    }
                }
                Action::DropSocket => {
                    if let Some(mut ws) = socket.take() {
                        let _ = ws.close(None).await;
                    }
                }
                Action::Emit(event) => {
                    let finished = matches!(event, ChannelEvent::Failed | ChannelEvent::Closed);
                    let _ = events.send(event);
                    if finished {
                        return;
                    }
                }
            }
        }

        let deadline = channel.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                pending.extend(match command {
                    Some(Command::Send(message)) => channel.send(&message),
                    Some(Command::Close) | None => channel.close(),
                });
            }
            frame = next_frame(&mut socket) => {
                pending.extend(match frame {
                    Some(Ok(Message::Text(text))) => channel.handle_text(&text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        socket = None;
                        channel.handle_close()
                    }
                    Some(Ok(_)) => Vec::new(),
                });
            }
            _ = sleep_until(deadline) => {
                pending.extend(channel.tick());
            }
        }
    }
}

/// Next frame of the open socket; never resolves while disconnected.
async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
