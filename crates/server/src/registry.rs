//! Connection registry
//!
//! Tracks live clients, which session each one is attached to, and which
//! member controls each session. It also records which backend executes
//! each session, so a session never has more than one. One lock guards all
//! tables so membership, controller and backend changes are observed
//! atomically; delivery uses `try_send` and never blocks on a slow client.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use relaydock_protocol::{new_id, ClientId, ServerMessage, SessionMode};

/// Frames queued for a client's WebSocket writer
#[derive(Debug)]
pub enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

pub type ClientSender = mpsc::Sender<OutboundMessage>;

struct ClientEntry {
    tx: ClientSender,
    session_id: Option<String>,
}

#[derive(Default)]
struct SessionEntry {
    /// Join order; the head is the default controller
    members: Vec<ClientId>,
    controller: Option<ClientId>,
}

/// The backend executing a session and the route that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendBinding {
    pub owner: ClientId,
    /// `None` while the owner's spawn is in flight
    pub handle_id: Option<String>,
    pub mode: SessionMode,
}

impl BackendBinding {
    pub fn is(&self, owner: &str, handle_id: &str) -> bool {
        self.owner == owner && self.handle_id.as_deref() == Some(handle_id)
    }
}

#[derive(Default)]
struct Tables {
    clients: HashMap<ClientId, ClientEntry>,
    sessions: HashMap<String, SessionEntry>,
    backends: HashMap<String, BackendBinding>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    tables: Mutex<Tables>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, tx: ClientSender) -> ClientId {
        let client_id = new_id();
        self.lock().clients.insert(
            client_id.clone(),
            ClientEntry {
                tx,
                session_id: None,
            },
        );
        info!(
            component = "registry",
            event = "registry.client.registered",
            client_id = %client_id,
            "Client registered"
        );
        client_id
    }

    /// Remove a client, handing off control of its session if it held it.
    pub fn unregister(&self, client_id: &str) -> bool {
        let mut tables = self.lock();
        if !tables.clients.contains_key(client_id) {
            return false;
        }
        leave_session(&mut tables, client_id);
        tables.clients.remove(client_id);
        info!(
            component = "registry",
            event = "registry.client.unregistered",
            client_id = %client_id,
            "Client unregistered"
        );
        true
    }

    /// Join `session_id`, leaving any previous session first.
    pub fn associate(&self, client_id: &str, session_id: &str) -> bool {
        let mut tables = self.lock();
        let Some(client) = tables.clients.get(client_id) else {
            return false;
        };

        if client.session_id.as_deref() == Some(session_id) {
            let has_control = tables
                .sessions
                .get(session_id)
                .and_then(|s| s.controller.as_deref())
                == Some(client_id);
            notify_control(&tables.clients, client_id, session_id, has_control);
            return true;
        }

        leave_session(&mut tables, client_id);

        let Tables {
            clients, sessions, ..
        } = &mut *tables;
        if let Some(client) = clients.get_mut(client_id) {
            client.session_id = Some(session_id.to_string());
        }
        let session = sessions.entry(session_id.to_string()).or_default();
        session.members.push(client_id.to_string());

        match session.controller.clone() {
            Some(controller) => {
                notify_control(clients, client_id, session_id, false);
                notify_control(clients, &controller, session_id, true);
            }
            None => {
                session.controller = Some(client_id.to_string());
                notify_control(clients, client_id, session_id, true);
            }
        }

        debug!(
            component = "registry",
            event = "registry.session.joined",
            client_id = %client_id,
            session_id = %session_id,
            members = session.members.len(),
            "Client joined session"
        );
        true
    }

    pub fn dissociate(&self, client_id: &str) -> bool {
        leave_session(&mut self.lock(), client_id).is_some()
    }

    /// Make `client_id` the controller of `session_id`.
    pub fn request_control(&self, client_id: &str, session_id: &str) -> bool {
        let mut tables = self.lock();
        let Tables {
            clients, sessions, ..
        } = &mut *tables;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if !session.members.iter().any(|m| m == client_id) {
            return false;
        }
        if session.controller.as_deref() == Some(client_id) {
            notify_control(clients, client_id, session_id, true);
            return true;
        }

        let previous = session.controller.replace(client_id.to_string());
        if let Some(previous) = &previous {
            notify_control(clients, previous, session_id, false);
        }
        notify_control(clients, client_id, session_id, true);
        info!(
            component = "registry",
            event = "registry.control.transferred",
            session_id = %session_id,
            from = ?previous,
            to = %client_id,
            "Session control transferred"
        );
        true
    }

    /// False if the client is unknown, its queue is full or its socket closed.
    pub fn send_to(&self, client_id: &str, message: ServerMessage) -> bool {
        deliver(&self.lock().clients, client_id, message)
    }

    /// Deliver to every member of the session; returns how many accepted it.
    pub fn send_to_session(&self, session_id: &str, message: ServerMessage) -> usize {
        let tables = self.lock();
        let Some(session) = tables.sessions.get(session_id) else {
            return 0;
        };
        session
            .members
            .iter()
            .filter(|member| deliver(&tables.clients, member, message.clone()))
            .count()
    }

    pub fn broadcast(&self, message: ServerMessage) -> usize {
        let tables = self.lock();
        tables
            .clients
            .keys()
            .filter(|id| deliver(&tables.clients, id, message.clone()))
            .count()
    }

    pub fn members_of(&self, session_id: &str) -> Vec<ClientId> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub fn session_of(&self, client_id: &str) -> Option<String> {
        self.lock()
            .clients
            .get(client_id)
            .and_then(|c| c.session_id.clone())
    }

    pub fn controller_of(&self, session_id: &str) -> Option<ClientId> {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|s| s.controller.clone())
    }

    pub fn has_control(&self, client_id: &str) -> bool {
        let tables = self.lock();
        tables
            .clients
            .get(client_id)
            .and_then(|c| c.session_id.as_deref())
            .and_then(|sid| tables.sessions.get(sid))
            .is_some_and(|s| s.controller.as_deref() == Some(client_id))
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Reserve `session_id` for a backend `owner` is about to spawn.
    ///
    /// Returns the binding it displaced; the caller retires that backend
    /// before spawning its own.
    pub fn claim_backend(
        &self,
        session_id: &str,
        owner: &str,
        mode: SessionMode,
    ) -> Option<BackendBinding> {
        let binding = BackendBinding {
            owner: owner.to_string(),
            handle_id: None,
            mode,
        };
        let previous = self
            .lock()
            .backends
            .insert(session_id.to_string(), binding);
        previous.filter(|p| p.handle_id.is_some() || p.owner != owner)
    }

    /// Record `handle_id` as the session's backend.
    ///
    /// Returns any other backend that was bound in the meantime.
    pub fn bind_backend(
        &self,
        session_id: &str,
        owner: &str,
        handle_id: &str,
        mode: SessionMode,
    ) -> Option<BackendBinding> {
        let binding = BackendBinding {
            owner: owner.to_string(),
            handle_id: Some(handle_id.to_string()),
            mode,
        };
        let previous = self
            .lock()
            .backends
            .insert(session_id.to_string(), binding);
        debug!(
            component = "registry",
            event = "registry.backend.bound",
            session_id = %session_id,
            owner = %owner,
            handle_id = %handle_id,
            "Session backend bound"
        );
        previous.filter(|p| {
            p.handle_id.as_deref().is_some_and(|h| h != handle_id) || p.owner != owner
        })
    }

    /// Drop the session's binding if `owner` still holds it with `handle_id`
    /// (or a pending claim when `handle_id` is `None`).
    pub fn release_backend(&self, session_id: &str, owner: &str, handle_id: Option<&str>) -> bool {
        let mut tables = self.lock();
        let held = tables.backends.get(session_id).is_some_and(|b| {
            b.owner == owner && (handle_id.is_none() || b.handle_id.as_deref() == handle_id)
        });
        if held {
            tables.backends.remove(session_id);
        }
        held
    }

    pub fn backend_of(&self, session_id: &str) -> Option<BackendBinding> {
        self.lock().backends.get(session_id).cloned()
    }
}

/// Drop the client from its session; returns the session it left.
fn leave_session(tables: &mut Tables, client_id: &str) -> Option<String> {
    let Tables {
        clients, sessions, ..
    } = tables;
    let session_id = clients.get_mut(client_id)?.session_id.take()?;

    if let Some(session) = sessions.get_mut(&session_id) {
        session.members.retain(|m| m != client_id);
        if session.members.is_empty() {
            sessions.remove(&session_id);
        } else if session.controller.as_deref() == Some(client_id) {
            session.controller = session.members.first().cloned();
            if let Some(successor) = &session.controller {
                notify_control(clients, successor, &session_id, true);
                info!(
                    component = "registry",
                    event = "registry.control.handoff",
                    session_id = %session_id,
                    to = %successor,
                    "Controller left, control handed to next member"
                );
            }
        }
    }
    Some(session_id)
}

fn notify_control(
    clients: &HashMap<ClientId, ClientEntry>,
    client_id: &str,
    session_id: &str,
    has_control: bool,
) {
    deliver(
        clients,
        client_id,
        ServerMessage::SessionControl {
            has_control,
            session_id: Some(session_id.to_string()),
        },
    );
}

fn deliver(
    clients: &HashMap<ClientId, ClientEntry>,
    client_id: &str,
    message: ServerMessage,
) -> bool {
    let Some(client) = clients.get(client_id) else {
        return false;
    };
    match client.tx.try_send(OutboundMessage::Json(message)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!(
                component = "registry",
                event = "registry.send.queue_full",
                client_id = %client_id,
                "Client queue full, message dropped"
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
