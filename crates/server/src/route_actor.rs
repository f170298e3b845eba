//! Route actor: owns one client's binding to its backend.
//!
//! Each connected client runs as an independent tokio task. Client messages
//! and backend events for that client arrive through one mailbox and are
//! handled sequentially, so a restart can never race another start and a
//! late event from a retired backend is recognised by its handle id.
//!
//! A session runs at most one backend. Binding a session id claims it in the
//! registry and retires whatever backend held it, including one owned by
//! another route; that route notices on its next command and lets go.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relaydock_protocol::{ClientId, ClientMessage, ServerMessage, SessionMode, TerminalSize};
use relaydock_supervisor::{
    encode_user_turn, HandleId, ProcessEvent, ProcessEventKind, ProcessSpawnOptions,
    ProcessSupervisor, PtyEvent, PtyEventKind, PtySpawnOptions, PtySupervisor, SupervisorError,
};

use crate::registry::{BackendBinding, ConnectionRegistry};

pub const REASON_CLOSED_BY_USER: &str = "Session closed by user";
pub const REASON_CLIENT_DISCONNECTED: &str = "Client disconnected";
pub const REASON_SPAWN_FAILED: &str = "Failed to start assistant";

/// Work queued for a route actor
#[derive(Debug)]
pub enum RouteCommand {
    Client(ClientMessage),
    Process(ProcessEvent),
    Pty(PtyEvent),
    Disconnect,
}

/// Rejections reported to the acting client as `error`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("No active session")]
    NoBackend,

    #[error("Message content is required")]
    EmptyContent,

    #[error("Another client controls this session")]
    NotController,

    #[error("Not a member of that session")]
    NotMember,

    #[error("{0} requires terminal mode")]
    WrongMode(&'static str),

    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    Spawn(String),
}

impl From<SupervisorError> for RouteError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::CapacityExceeded { .. } => RouteError::Capacity(err.to_string()),
            other => RouteError::Spawn(other.to_string()),
        }
    }
}

/// Where a client is in its session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Idle,
    /// Backend bound, session id not yet known
    Starting,
    /// Backend bound, session id known
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Backend {
    handle_id: HandleId,
    mode: SessionMode,
}

/// Everything a route needs from the rest of the server
#[derive(Clone)]
pub struct RouteContext {
    pub registry: Arc<ConnectionRegistry>,
    pub processes: Arc<ProcessSupervisor>,
    pub ptys: Arc<PtySupervisor>,
    pub default_project: Option<String>,
}

struct StartRequest {
    session_id: Option<String>,
    project_path: Option<String>,
    mode: SessionMode,
    size: TerminalSize,
    model: Option<String>,
    skip_permissions: bool,
}

/// Routing state of one client
pub struct ClientRoute {
    client_id: ClientId,
    state: RouteState,
    backend: Option<Backend>,
    mode: SessionMode,
    session_id: Option<String>,
    project_path: Option<String>,
    model: Option<String>,
    skip_permissions: bool,
    size: TerminalSize,
}

impl ClientRoute {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            state: RouteState::Idle,
            backend: None,
            mode: SessionMode::Chat,
            session_id: None,
            project_path: None,
            model: None,
            skip_permissions: false,
            size: TerminalSize::default(),
        }
    }

    pub fn state(&self) -> RouteState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn backend_id(&self) -> Option<&str> {
        self.backend.as_ref().map(|b| b.handle_id.as_str())
    }

    pub fn handle(&mut self, ctx: &RouteContext, command: RouteCommand) -> bool {
        match command {
            RouteCommand::Client(message) => self.handle_client(ctx, message),
            RouteCommand::Process(event) => self.handle_process_event(ctx, event),
            RouteCommand::Pty(event) => self.handle_pty_event(ctx, event),
            RouteCommand::Disconnect => {
                self.disconnect(ctx);
                return false;
            }
        }
        true
    }

    pub fn handle_client(&mut self, ctx: &RouteContext, message: ClientMessage) {
        self.drop_if_superseded(ctx);
        let kind = message.kind();
        let result = match message {
            ClientMessage::SessionStart {
                session_id,
                project_path,
                mode,
                cols,
                rows,
                model,
                dangerously_skip_permissions,
            } => self.start(
                ctx,
                StartRequest {
                    session_id,
                    project_path,
                    mode: mode.unwrap_or_default(),
                    size: TerminalSize::from_parts(cols, rows, TerminalSize::default()),
                    model,
                    skip_permissions: dangerously_skip_permissions,
                },
            ),
            ClientMessage::MessageSend { content } => self.send_message(ctx, &content),
            ClientMessage::SessionInterrupt => self.interrupt(ctx),
            ClientMessage::SessionClose => {
                self.close(ctx);
                Ok(())
            }
            ClientMessage::ModeSwitch { mode, cols, rows } => {
                self.switch_mode(ctx, mode, cols, rows)
            }
            ClientMessage::TerminalInput { content } => self.terminal_input(ctx, &content),
            ClientMessage::TerminalResize { cols, rows } => self.terminal_resize(ctx, cols, rows),
            ClientMessage::ControlRequest { session_id } => self.request_control(ctx, session_id),
            ClientMessage::Ping => {
                ctx.registry.send_to(&self.client_id, ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(err) = result {
            debug!(
                component = "route",
                event = "route.rejected",
                client_id = %self.client_id,
                message_type = kind,
                error = %err,
                "Client operation rejected"
            );
            ctx.registry
                .send_to(&self.client_id, ServerMessage::error(err.to_string()));
            if matches!(err, RouteError::Spawn(_)) {
                self.state = RouteState::Ended;
                self.deliver(
                    ctx,
                    ServerMessage::SessionEnded {
                        reason: REASON_SPAWN_FAILED.to_string(),
                        session_id: self.session_id.clone(),
                    },
                );
            }
        }
    }

    fn start(&mut self, ctx: &RouteContext, request: StartRequest) -> Result<(), RouteError> {
        self.retire(ctx);

        self.mode = request.mode;
        self.session_id = request.session_id.filter(|s| !s.trim().is_empty());
        self.project_path = request.project_path.or_else(|| ctx.default_project.clone());
        self.model = request.model;
        self.skip_permissions = request.skip_permissions;
        self.size = request.size;

        // A fresh conversation leaves whatever session the client was watching.
        if self.session_id.is_none() {
            ctx.registry.dissociate(&self.client_id);
        }
        self.spawn_backend(ctx)
    }

    /// Spawn a backend for the current settings and bind it.
    fn spawn_backend(&mut self, ctx: &RouteContext) -> Result<(), RouteError> {
        if let Some(session_id) = &self.session_id {
            if let Some(previous) = ctx
                .registry
                .claim_backend(session_id, &self.client_id, self.mode)
            {
                self.retire_binding(ctx, session_id, previous);
            }
        }

        let owner = Some(self.client_id.clone());
        let spawned = match self.mode {
            SessionMode::Chat => ctx
                .processes
                .spawn(ProcessSpawnOptions {
                    session_id: self.session_id.clone(),
                    project_path: self.project_path.clone(),
                    model: self.model.clone(),
                    skip_permissions: self.skip_permissions,
                    owner,
                })
                .map(|info| info.id),
            SessionMode::Terminal => ctx
                .ptys
                .spawn(PtySpawnOptions {
                    session_id: self.session_id.clone(),
                    project_path: self.project_path.clone(),
                    size: self.size,
                    skip_permissions: self.skip_permissions,
                    owner,
                })
                .map(|info| info.id),
        };
        let handle_id = match spawned {
            Ok(handle_id) => handle_id,
            Err(err) => {
                if let Some(session_id) = &self.session_id {
                    ctx.registry
                        .release_backend(session_id, &self.client_id, None);
                }
                return Err(err.into());
            }
        };
        if let Some(session_id) = &self.session_id {
            if let Some(previous) =
                ctx.registry
                    .bind_backend(session_id, &self.client_id, &handle_id, self.mode)
            {
                self.retire_binding(ctx, session_id, previous);
            }
        }

        info!(
            component = "route",
            event = "route.backend.bound",
            client_id = %self.client_id,
            handle_id = %handle_id,
            mode = %self.mode,
            session_id = ?self.session_id,
            "Backend bound to client"
        );
        self.backend = Some(Backend {
            handle_id,
            mode: self.mode,
        });

        ctx.registry.send_to(
            &self.client_id,
            ServerMessage::SessionStarted {
                session_id: self.session_id.clone(),
                mode: self.mode,
            },
        );
        match self.session_id.clone() {
            Some(session_id) => {
                self.state = RouteState::Active;
                ctx.registry.associate(&self.client_id, &session_id);
            }
            None => self.state = RouteState::Starting,
        }
        Ok(())
    }

    /// Kill and unbind the current backend, if any. Session membership stays.
    fn retire(&mut self, ctx: &RouteContext) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        if let Some(session_id) = &self.session_id {
            ctx.registry
                .release_backend(session_id, &self.client_id, Some(&backend.handle_id));
        }
        let killed = kill_backend(ctx, &backend);
        debug!(
            component = "route",
            event = "route.backend.retired",
            client_id = %self.client_id,
            handle_id = %backend.handle_id,
            was_live = killed,
            "Backend retired"
        );
        self.state = RouteState::Idle;
    }

    /// Kill a session backend this route displaced.
    fn retire_binding(&self, ctx: &RouteContext, session_id: &str, binding: BackendBinding) {
        let Some(handle_id) = binding.handle_id else {
            return;
        };
        let killed = kill_backend(
            ctx,
            &Backend {
                handle_id: handle_id.clone(),
                mode: binding.mode,
            },
        );
        info!(
            component = "route",
            event = "route.backend.superseded",
            client_id = %self.client_id,
            session_id = %session_id,
            handle_id = %handle_id,
            previous_owner = %binding.owner,
            was_live = killed,
            "Retired the session's previous backend"
        );
    }

    /// Let go of a backend another route has replaced for this session.
    ///
    /// The replaced backend is already dead; its exit must not end the
    /// session the replacement now serves.
    fn drop_if_superseded(&mut self, ctx: &RouteContext) {
        if self.state != RouteState::Active {
            return;
        }
        let (Some(backend), Some(session_id)) = (&self.backend, &self.session_id) else {
            return;
        };
        let held = ctx
            .registry
            .backend_of(session_id)
            .is_some_and(|b| b.is(&self.client_id, &backend.handle_id));
        if held {
            return;
        }
        let killed = kill_backend(ctx, backend);
        debug!(
            component = "route",
            event = "route.backend.superseded",
            client_id = %self.client_id,
            session_id = %session_id,
            handle_id = %backend.handle_id,
            was_live = killed,
            "Session backend replaced by another client"
        );
        self.backend = None;
        self.state = RouteState::Idle;
    }

    /// This route's backend, or else the one serving the session it watches.
    fn target(&self, ctx: &RouteContext) -> Option<Backend> {
        if let Some(backend) = &self.backend {
            return Some(backend.clone());
        }
        let session_id = ctx.registry.session_of(&self.client_id)?;
        let binding = ctx.registry.backend_of(&session_id)?;
        Some(Backend {
            handle_id: binding.handle_id?,
            mode: binding.mode,
        })
    }

    /// Input is refused to members that do not hold control of the session.
    fn ensure_control(&self, ctx: &RouteContext) -> Result<(), RouteError> {
        let Some(session_id) = ctx.registry.session_of(&self.client_id) else {
            return Ok(());
        };
        match ctx.registry.controller_of(&session_id) {
            Some(controller) if controller != self.client_id => Err(RouteError::NotController),
            _ => Ok(()),
        }
    }

    fn send_message(&mut self, ctx: &RouteContext, content: &str) -> Result<(), RouteError> {
        let backend = self.target(ctx).ok_or(RouteError::NoBackend)?;
        if content.trim().is_empty() {
            return Err(RouteError::EmptyContent);
        }
        self.ensure_control(ctx)?;

        let delivered = match backend.mode {
            SessionMode::Chat => ctx
                .processes
                .send(&backend.handle_id, encode_user_turn(content).as_bytes()),
            SessionMode::Terminal => ctx.ptys.write(&backend.handle_id, content.as_bytes()),
        };
        if delivered {
            Ok(())
        } else {
            Err(RouteError::NoBackend)
        }
    }

    fn interrupt(&mut self, ctx: &RouteContext) -> Result<(), RouteError> {
        let backend = self.target(ctx).ok_or(RouteError::NoBackend)?;
        self.ensure_control(ctx)?;
        let interrupted = match backend.mode {
            SessionMode::Chat => ctx.processes.interrupt(&backend.handle_id),
            SessionMode::Terminal => ctx.ptys.interrupt(&backend.handle_id),
        };
        if interrupted {
            Ok(())
        } else {
            Err(RouteError::NoBackend)
        }
    }

    fn close(&mut self, ctx: &RouteContext) {
        self.retire(ctx);
        self.deliver(
            ctx,
            ServerMessage::SessionEnded {
                reason: REASON_CLOSED_BY_USER.to_string(),
                session_id: self.session_id.clone(),
            },
        );
        ctx.registry.dissociate(&self.client_id);
        self.session_id = None;
        self.state = RouteState::Ended;
        info!(
            component = "route",
            event = "route.closed",
            client_id = %self.client_id,
            "Session closed by client"
        );
    }

    fn switch_mode(
        &mut self,
        ctx: &RouteContext,
        mode: SessionMode,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<(), RouteError> {
        self.size = TerminalSize::from_parts(cols, rows, self.size);
        if self.mode == mode && self.backend.is_some() {
            return Ok(());
        }
        self.ensure_control(ctx)?;
        self.retire(ctx);
        self.mode = mode;
        self.spawn_backend(ctx)
    }

    fn terminal_input(&mut self, ctx: &RouteContext, content: &str) -> Result<(), RouteError> {
        let backend = match self.ensure_terminal(ctx, "Terminal input")? {
            Some(backend) => backend,
            None => self.backend.clone().ok_or(RouteError::NoBackend)?,
        };
        if content.is_empty() {
            return Ok(());
        }
        if ctx.ptys.write(&backend.handle_id, content.as_bytes()) {
            Ok(())
        } else {
            Err(RouteError::NoBackend)
        }
    }

    fn terminal_resize(
        &mut self,
        ctx: &RouteContext,
        cols: u16,
        rows: u16,
    ) -> Result<(), RouteError> {
        self.size = TerminalSize::from_parts(Some(cols), Some(rows), self.size);
        // A freshly spawned terminal already has the new size.
        let Some(backend) = self.ensure_terminal(ctx, "Terminal resize")? else {
            return Ok(());
        };
        ctx.ptys.resize(&backend.handle_id, self.size.cols, self.size.rows);
        Ok(())
    }

    /// Terminal operations auto-start a terminal backend when nothing is bound.
    ///
    /// Returns the existing terminal, or `None` when one was just spawned.
    fn ensure_terminal(
        &mut self,
        ctx: &RouteContext,
        operation: &'static str,
    ) -> Result<Option<Backend>, RouteError> {
        match self.target(ctx) {
            Some(backend) if backend.mode == SessionMode::Terminal => {
                self.ensure_control(ctx)?;
                Ok(Some(backend))
            }
            Some(_) => Err(RouteError::WrongMode(operation)),
            None => {
                self.ensure_control(ctx)?;
                self.mode = SessionMode::Terminal;
                self.spawn_backend(ctx)?;
                Ok(None)
            }
        }
    }

    fn request_control(
        &mut self,
        ctx: &RouteContext,
        session_id: Option<String>,
    ) -> Result<(), RouteError> {
        let session_id = session_id
            .or_else(|| ctx.registry.session_of(&self.client_id))
            .ok_or(RouteError::NotMember)?;
        if ctx.registry.request_control(&self.client_id, &session_id) {
            Ok(())
        } else {
            Err(RouteError::NotMember)
        }
    }

    fn is_bound(&self, handle_id: &str) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|b| b.handle_id == handle_id)
    }

    pub fn handle_process_event(&mut self, ctx: &RouteContext, event: ProcessEvent) {
        self.drop_if_superseded(ctx);
        if !self.is_bound(&event.handle_id) {
            debug!(
                component = "route",
                event = "route.event.stale",
                client_id = %self.client_id,
                handle_id = %event.handle_id,
                "Ignoring event from a retired backend"
            );
            return;
        }
        match event.kind {
            ProcessEventKind::Stdout(line) => {
                if self.state == RouteState::Starting {
                    self.discover_session(ctx, &line);
                }
                self.deliver(ctx, ServerMessage::AssistantChunk { content: line });
            }
            ProcessEventKind::Stderr(line) => {
                debug!(
                    component = "route",
                    event = "route.backend.stderr",
                    client_id = %self.client_id,
                    line = %line.trim_end(),
                    "Backend stderr"
                );
            }
            ProcessEventKind::Exit(exit) => self.backend_ended(ctx, None, exit.reason()),
            ProcessEventKind::Error(message) => {
                let reason = format!("Process error: {message}");
                self.backend_ended(ctx, Some(message), reason)
            }
        }
    }

    pub fn handle_pty_event(&mut self, ctx: &RouteContext, event: PtyEvent) {
        self.drop_if_superseded(ctx);
        if !self.is_bound(&event.handle_id) {
            return;
        }
        match event.kind {
            PtyEventKind::Data(data) => self.deliver(ctx, ServerMessage::TerminalOutput { data }),
            PtyEventKind::Exit(exit) => self.backend_ended(ctx, None, exit.reason()),
            PtyEventKind::Error(message) => {
                let reason = format!("Terminal error: {message}");
                self.backend_ended(ctx, Some(message), reason)
            }
        }
    }

    fn backend_ended(&mut self, ctx: &RouteContext, error: Option<String>, reason: String) {
        if let (Some(backend), Some(session_id)) = (self.backend.take(), &self.session_id) {
            ctx.registry
                .release_backend(session_id, &self.client_id, Some(&backend.handle_id));
        }
        self.state = RouteState::Ended;
        info!(
            component = "route",
            event = "route.backend.ended",
            client_id = %self.client_id,
            session_id = ?self.session_id,
            reason = %reason,
            "Backend ended"
        );
        if let Some(message) = error {
            self.deliver(ctx, ServerMessage::error(message));
        }
        self.deliver(
            ctx,
            ServerMessage::SessionEnded {
                reason,
                session_id: self.session_id.clone(),
            },
        );
    }

    /// Pick up the session id from the CLI's `system/init` line.
    fn discover_session(&mut self, ctx: &RouteContext, line: &str) {
        let Ok(raw) = serde_json::from_str::<Value>(line) else {
            return;
        };
        if raw.get("type").and_then(|v| v.as_str()) != Some("system")
            || raw.get("subtype").and_then(|v| v.as_str()) != Some("init")
        {
            return;
        }
        let Some(session_id) = raw.get("session_id").and_then(|v| v.as_str()) else {
            return;
        };

        info!(
            component = "route",
            event = "route.session.discovered",
            client_id = %self.client_id,
            session_id = %session_id,
            "Session id reported by backend"
        );
        self.session_id = Some(session_id.to_string());
        self.state = RouteState::Active;
        if let Some(backend) = &self.backend {
            if let Some(previous) = ctx.registry.bind_backend(
                session_id,
                &self.client_id,
                &backend.handle_id,
                backend.mode,
            ) {
                self.retire_binding(ctx, session_id, previous);
            }
        }
        ctx.registry.associate(&self.client_id, session_id);
        self.deliver(
            ctx,
            ServerMessage::SessionStarted {
                session_id: self.session_id.clone(),
                mode: self.mode,
            },
        );
    }

    /// The whole session once this client is attached to it, else just the client.
    fn deliver(&self, ctx: &RouteContext, message: ServerMessage) {
        let attached = self
            .session_id
            .as_deref()
            .filter(|sid| ctx.registry.session_of(&self.client_id).as_deref() == Some(*sid));
        match attached {
            Some(session_id) => {
                ctx.registry.send_to_session(session_id, message);
            }
            None => {
                ctx.registry.send_to(&self.client_id, message);
            }
        }
    }

    fn disconnect(&mut self, ctx: &RouteContext) {
        self.drop_if_superseded(ctx);
        if self.backend.is_none() {
            return;
        }
        self.retire(ctx);
        self.state = RouteState::Ended;
        if let Some(session_id) = &self.session_id {
            let delivered = ctx.registry.send_to_session(
                session_id,
                ServerMessage::SessionEnded {
                    reason: REASON_CLIENT_DISCONNECTED.to_string(),
                    session_id: Some(session_id.clone()),
                },
            );
            debug!(
                component = "route",
                event = "route.disconnected",
                client_id = %self.client_id,
                session_id = %session_id,
                notified = delivered,
                "Client disconnected, backend killed"
            );
        }
    }
}

fn kill_backend(ctx: &RouteContext, backend: &Backend) -> bool {
    match backend.mode {
        SessionMode::Chat => ctx.processes.kill(&backend.handle_id),
        SessionMode::Terminal => ctx.ptys.kill(&backend.handle_id),
    }
}

/// Actor loop: one route, commands processed in arrival order.
pub async fn run(
    mut route: ClientRoute,
    ctx: RouteContext,
    mut mailbox: mpsc::UnboundedReceiver<RouteCommand>,
) {
    while let Some(command) = mailbox.recv().await {
        if !route.handle(&ctx, command) {
            return;
        }
    }
    // Mailbox dropped without an explicit disconnect.
    if route.backend.is_some() {
        warn!(
            component = "route",
            event = "route.mailbox.closed",
            client_id = %route.client_id,
            "Route mailbox closed with a live backend"
        );
        route.disconnect(&ctx);
    }
}
