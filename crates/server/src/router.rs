//! Session router: one route actor per client, fed by both supervisors.
//!
//! Supervisor listeners run on reader tasks and threads. They only look up
//! the owning client's mailbox and enqueue, so backend output is handled by
//! the same actor, in the same order, as that client's own messages.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use relaydock_protocol::{ClientId, ClientMessage};
use relaydock_supervisor::{ListenerId, ProcessEvent, PtyEvent};

use crate::route_actor::{self, ClientRoute, RouteCommand, RouteContext};

type Mailboxes = Arc<DashMap<ClientId, mpsc::UnboundedSender<RouteCommand>>>;

pub struct SessionRouter {
    ctx: RouteContext,
    mailboxes: Mailboxes,
    process_listener: ListenerId,
    pty_listener: ListenerId,
}

impl SessionRouter {
    pub fn new(ctx: RouteContext) -> Self {
        let mailboxes: Mailboxes = Arc::new(DashMap::new());

        let boxes = mailboxes.clone();
        let process_listener = ctx.processes.on_output(Arc::new(move |event: &ProcessEvent| {
            forward(&boxes, event.owner.as_deref(), || {
                RouteCommand::Process(event.clone())
            });
        }));

        let boxes = mailboxes.clone();
        let pty_listener = ctx.ptys.on_output(Arc::new(move |event: &PtyEvent| {
            forward(&boxes, event.owner.as_deref(), || RouteCommand::Pty(event.clone()));
        }));

        Self {
            ctx,
            mailboxes,
            process_listener,
            pty_listener,
        }
    }

    /// Start the route actor for a freshly registered client.
    pub fn attach(&self, client_id: &str) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.insert(client_id.to_string(), tx);
        tokio::spawn(route_actor::run(
            ClientRoute::new(client_id.to_string()),
            self.ctx.clone(),
            rx,
        ));
        debug!(
            component = "router",
            event = "router.route.attached",
            client_id = %client_id,
            "Route attached"
        );
    }

    /// Queue a client message for its route. False when the client has no route.
    pub fn dispatch(&self, client_id: &str, message: ClientMessage) -> bool {
        match self.mailboxes.get(client_id) {
            Some(tx) => tx.send(RouteCommand::Client(message)).is_ok(),
            None => false,
        }
    }

    /// Stop the client's route; its backend is killed.
    pub fn detach(&self, client_id: &str) -> bool {
        let Some((_, tx)) = self.mailboxes.remove(client_id) else {
            return false;
        };
        let _ = tx.send(RouteCommand::Disconnect);
        info!(
            component = "router",
            event = "router.route.detached",
            client_id = %client_id,
            "Route detached"
        );
        true
    }

    pub fn live_routes(&self) -> usize {
        self.mailboxes.len()
    }
}

impl Drop for SessionRouter {
    fn drop(&mut self) {
        self.ctx.processes.off_output(self.process_listener);
        self.ctx.ptys.off_output(self.pty_listener);
    }
}

fn forward(mailboxes: &Mailboxes, owner: Option<&str>, command: impl FnOnce() -> RouteCommand) {
    let Some(owner) = owner else {
        return;
    };
    if let Some(tx) = mailboxes.get(owner) {
        let _ = tx.send(command());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::{ConnectionRegistry, OutboundMessage};
    use relaydock_protocol::{ServerMessage, SessionMode};
    use relaydock_supervisor::{ProcessSupervisor, PtySupervisor, ScriptLauncher};

    const INIT_THEN_ECHO: &str =
        r#"echo '{"type":"system","subtype":"init","session_id":"abc"}'; exec cat"#;

    fn router() -> (SessionRouter, RouteContext) {
        let launcher = Arc::new(ScriptLauncher::new(INIT_THEN_ECHO, "cat"));
        let ctx = RouteContext {
            registry: Arc::new(ConnectionRegistry::new()),
            processes: Arc::new(ProcessSupervisor::new(launcher.clone())),
            ptys: Arc::new(PtySupervisor::new(launcher)),
            default_project: None,
        };
        (SessionRouter::new(ctx.clone()), ctx)
    }

    async fn next_json(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for server message")
                .expect("client channel closed");
            if let OutboundMessage::Json(msg) = msg {
                return msg;
            }
        }
    }

    async fn wait_for(
        rx: &mut mpsc::Receiver<OutboundMessage>,
        pred: impl Fn(&ServerMessage) -> bool,
    ) -> ServerMessage {
        loop {
            let msg = next_json(rx).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    fn start() -> ClientMessage {
        ClientMessage::SessionStart {
            session_id: None,
            project_path: None,
            mode: Some(SessionMode::Chat),
            cols: None,
            rows: None,
            model: None,
            dangerously_skip_permissions: false,
        }
    }

    #[tokio::test]
    async fn chat_round_trip_through_actor() {
        let (router, ctx) = router();
        let (tx, mut rx) = mpsc::channel(64);
        let client = ctx.registry.register(tx);
        router.attach(&client);

        assert!(router.dispatch(&client, start()));
        assert_eq!(
            next_json(&mut rx).await,
            ServerMessage::SessionStarted {
                session_id: None,
                mode: SessionMode::Chat,
            }
        );

        let discovered = wait_for(&mut rx, |m| {
            matches!(m, ServerMessage::SessionStarted { session_id: Some(_), .. })
        })
        .await;
        assert_eq!(
            discovered,
            ServerMessage::SessionStarted {
                session_id: Some("abc".into()),
                mode: SessionMode::Chat,
            }
        );
        assert_eq!(ctx.registry.session_of(&client).as_deref(), Some("abc"));

        assert!(router.dispatch(
            &client,
            ClientMessage::MessageSend {
                content: "hello".into()
            }
        ));
        let echoed = wait_for(&mut rx, |m| match m {
            ServerMessage::AssistantChunk { content } => content.contains("hello"),
            _ => false,
        })
        .await;
        let ServerMessage::AssistantChunk { content } = echoed else {
            unreachable!()
        };
        assert!(content.contains(r#""type":"user""#));

        assert!(router.detach(&client));
        assert!(!router.dispatch(&client, ClientMessage::Ping));
        for _ in 0..50 {
            if ctx.processes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ctx.processes.is_empty());
        assert_eq!(router.live_routes(), 0);
    }

    #[tokio::test]
    async fn events_without_a_route_are_dropped() {
        let (router, ctx) = router();
        let (tx, mut rx) = mpsc::channel(64);
        let client = ctx.registry.register(tx);
        router.attach(&client);
        router.dispatch(&client, start());
        next_json(&mut rx).await;

        // Route gone before the backend's output arrives.
        router.detach(&client);
        ctx.processes.kill_all();
        assert!(!router.detach(&client));
    }

    #[tokio::test]
    async fn drop_unsubscribes_listeners() {
        let (router, ctx) = router();
        drop(router);
        // A fresh router gets new listener ids; nothing left behind to forward.
        let second = SessionRouter::new(ctx.clone());
        assert_eq!(second.live_routes(), 0);
        assert!(!ctx.processes.off_output(1));
        assert!(!ctx.ptys.off_output(1));
    }
}
