//! Application state

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use relaydock_supervisor::{Launcher, ProcessSupervisor, PtySupervisor};

use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::route_actor::RouteContext;
use crate::router::SessionRouter;

/// Shared application state
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub processes: Arc<ProcessSupervisor>,
    pub ptys: Arc<PtySupervisor>,
    pub router: SessionRouter,
    /// Capacity of each client's outbound queue
    pub client_queue: usize,
    started_at: Instant,
}

/// Body of `GET /status`
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub clients: usize,
    pub sessions: Vec<SessionStatus>,
    pub processes: usize,
    pub terminals: usize,
    pub max_processes: usize,
    pub max_terminals: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub members: usize,
    pub controller: Option<String>,
    /// Handle id of the backend executing the session
    pub backend: Option<String>,
}

impl AppState {
    pub fn new(launcher: Arc<dyn Launcher>, config: &Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let processes = Arc::new(ProcessSupervisor::with_limit(
            launcher.clone(),
            config.max_processes,
        ));
        let ptys = Arc::new(PtySupervisor::with_limit(launcher, config.max_terminals));
        let router = SessionRouter::new(RouteContext {
            registry: registry.clone(),
            processes: processes.clone(),
            ptys: ptys.clone(),
            default_project: config.default_project.clone(),
        });

        Self {
            registry,
            processes,
            ptys,
            router,
            client_queue: config.client_queue.max(1),
            started_at: Instant::now(),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            clients: self.registry.client_count(),
            sessions: self
                .registry
                .active_sessions()
                .into_iter()
                .map(|session_id| SessionStatus {
                    members: self.registry.members_of(&session_id).len(),
                    controller: self.registry.controller_of(&session_id),
                    backend: self
                        .registry
                        .backend_of(&session_id)
                        .and_then(|b| b.handle_id),
                    session_id,
                })
                .collect(),
            processes: self.processes.len(),
            terminals: self.ptys.len(),
            max_processes: self.processes.max_live(),
            max_terminals: self.ptys.max_live(),
        }
    }

    /// Kill every live backend. Returns how many were killed.
    pub fn shutdown(&self) -> usize {
        let processes = self.processes.kill_all();
        let terminals = self.ptys.kill_all();
        info!(
            component = "server",
            event = "server.shutdown.backends_killed",
            processes,
            terminals,
            "Killed live backends"
        );
        processes + terminals
    }
}
