//! WebSocket handling

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use relaydock_protocol::{parse_client_message, ClientMessage, ServerMessage};

use crate::registry::OutboundMessage;
use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(state.client_queue);
    let client_id = state.registry.register(outbound_tx.clone());
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        client_id = %client_id,
        "WebSocket connection opened"
    );

    // Forward queued frames to the socket
    let conn_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            client_id = %conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    client_id = %conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    state.router.attach(&client_id);
    state.registry.send_to(
        &client_id,
        ServerMessage::Connected {
            client_id: client_id.clone(),
        },
    );

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.try_send(OutboundMessage::Pong(data));
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    client_id = %client_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    client_id = %client_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        handle_text(&state, &client_id, text.as_str());
    }

    state.router.detach(&client_id);
    state.registry.unregister(&client_id);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        client_id = %client_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Handle one inbound text frame from `client_id`.
pub(crate) fn handle_text(state: &AppState, client_id: &str, text: &str) {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                client_id = %client_id,
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, 240),
                "Failed to parse client message"
            );
            state
                .registry
                .send_to(client_id, ServerMessage::error(e.to_string()));
            return;
        }
    };

    debug!(
        component = "websocket",
        event = "ws.message.received",
        client_id = %client_id,
        message_type = message.kind(),
        "Client message"
    );

    if let ClientMessage::Ping = message {
        state.registry.send_to(client_id, ServerMessage::Pong);
        return;
    }

    if !state.router.dispatch(client_id, message) {
        warn!(
            component = "websocket",
            event = "ws.message.no_route",
            client_id = %client_id,
            "No route for client"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use clap::Parser;
    use relaydock_protocol::SessionMode;
    use relaydock_supervisor::ScriptLauncher;

    fn new_test_state() -> Arc<AppState> {
        let config = Config::try_parse_from(["relaydock"]).unwrap();
        Arc::new(AppState::new(Arc::new(ScriptLauncher::echo()), &config))
    }

    fn connect(state: &AppState) -> (String, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let client_id = state.registry.register(tx);
        state.router.attach(&client_id);
        (client_id, rx)
    }

    async fn recv_server_message(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("expected outbound server message");
        match msg {
            OutboundMessage::Json(message) => message,
            OutboundMessage::Pong(_) => panic!("expected JSON server message, got pong"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_get_distinct_errors() {
        let state = new_test_state();
        let (client, mut rx) = connect(&state);

        handle_text(&state, &client, "not json");
        handle_text(&state, &client, r#"{"content":"x"}"#);
        handle_text(&state, &client, r#"{"type":"session.teleport"}"#);
        handle_text(&state, &client, r#"{"type":"terminal.resize","cols":"wide"}"#);

        assert_eq!(
            recv_server_message(&mut rx).await,
            ServerMessage::error("Invalid JSON message")
        );
        assert_eq!(
            recv_server_message(&mut rx).await,
            ServerMessage::error("Message must have a type")
        );
        assert_eq!(
            recv_server_message(&mut rx).await,
            ServerMessage::error("Unknown message type: session.teleport")
        );
        match recv_server_message(&mut rx).await {
            ServerMessage::Error { message } => {
                assert!(message.starts_with("Invalid terminal.resize message"), "{message}")
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_answered_without_route() {
        let state = new_test_state();
        let (tx, mut rx) = mpsc::channel(8);
        let client = state.registry.register(tx);

        handle_text(&state, &client, r#"{"type":"ping"}"#);
        assert_eq!(recv_server_message(&mut rx).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn session_start_is_routed_to_actor() {
        let state = new_test_state();
        let (client, mut rx) = connect(&state);

        handle_text(
            &state,
            &client,
            r#"{"type":"session.start","sessionId":"s-1","mode":"chat"}"#,
        );
        assert_eq!(
            recv_server_message(&mut rx).await,
            ServerMessage::SessionStarted {
                session_id: Some("s-1".into()),
                mode: SessionMode::Chat,
            }
        );
        assert_eq!(
            recv_server_message(&mut rx).await,
            ServerMessage::SessionControl {
                has_control: true,
                session_id: Some("s-1".into()),
            }
        );
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.registry.members_of("s-1"), vec![client.clone()]);

        state.router.detach(&client);
        state.registry.unregister(&client);
        state.shutdown();
    }
}
