//! Structured-output subprocess supervisor
//!
//! Spawns the assistant CLI with stdin/stdout/stderr piped and relays its
//! NDJSON stream. Each handle gets a stdin writer task and a watcher task;
//! the watcher reads stdout/stderr line by line, delivers events to listeners
//! in observation order and reaps the process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use relaydock_protocol::new_id;

use crate::launcher::Launcher;
use crate::listeners::{ListenerId, ListenerSet, OutputHandler};
use crate::{now_millis, Admission, ExitInfo, HandleId, SupervisorError, DEFAULT_MAX_LIVE};

const STDIN_QUEUE: usize = 256;

/// Options for spawning a chat backend
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawnOptions {
    /// Session to resume; `None` starts a fresh conversation
    pub session_id: Option<String>,
    /// Working directory
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub skip_permissions: bool,
    /// Opaque routing key echoed on every event of this handle
    pub owner: Option<String>,
}

/// Subprocess lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
}

/// Snapshot of a supervised subprocess
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: HandleId,
    pub session_id: Option<String>,
    pub owner: Option<String>,
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub pid: Option<u32>,
    pub started_at: u64,
    pub status: ProcessStatus,
}

/// Output event of a subprocess
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub handle_id: HandleId,
    pub owner: Option<String>,
    pub kind: ProcessEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEventKind {
    /// One stdout line, newline included when present
    Stdout(String),
    Stderr(String),
    Exit(ExitInfo),
    Error(String),
}

struct ProcessEntry {
    info: ProcessInfo,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ProcessTable {
    entries: HashMap<HandleId, ProcessEntry>,
    admission: Admission,
}

struct Shared {
    table: Mutex<ProcessTable>,
    listeners: ListenerSet<ProcessEvent>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, ProcessTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_running(&self, id: &str) {
        if let Some(entry) = self.table().entries.get_mut(id) {
            if entry.info.status == ProcessStatus::Starting {
                entry.info.status = ProcessStatus::Running;
            }
        }
    }

    fn remove(&self, id: &str) -> Option<ProcessEntry> {
        self.table().entries.remove(id)
    }
}

/// Owns spawned chat subprocesses
pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    max_live: usize,
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self::with_limit(launcher, DEFAULT_MAX_LIVE)
    }

    pub fn with_limit(launcher: Arc<dyn Launcher>, max_live: usize) -> Self {
        Self {
            launcher,
            max_live,
            shared: Arc::new(Shared {
                table: Mutex::new(ProcessTable::default()),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Spawn a subprocess. Must be called inside a tokio runtime.
    ///
    /// The capacity slot is reserved before the OS call and the handle is
    /// registered before its readers start, so no output can precede it.
    pub fn spawn(&self, options: ProcessSpawnOptions) -> Result<ProcessInfo, SupervisorError> {
        {
            let mut table = self.shared.table();
            let live = table.entries.len();
            table.admission.reserve(live, self.max_live)?;
        }

        let (child, stdin, stdout, stderr) = match self.launch(&options) {
            Ok(parts) => parts,
            Err(e) => {
                self.shared.table().admission.release();
                warn!(
                    component = "process_supervisor",
                    event = "process.spawn_failed",
                    error = %e,
                    "Failed to spawn assistant subprocess"
                );
                return Err(e);
            }
        };

        let info = ProcessInfo {
            id: new_id(),
            session_id: options.session_id.clone(),
            owner: options.owner.clone(),
            project_path: options.project_path.clone(),
            model: options.model.clone(),
            pid: child.id(),
            started_at: now_millis(),
            status: ProcessStatus::Starting,
        };

        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE);
        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut table = self.shared.table();
            table.admission.release();
            table.entries.insert(
                info.id.clone(),
                ProcessEntry {
                    info: info.clone(),
                    stdin_tx,
                    kill_tx: Some(kill_tx),
                },
            );
        }

        info!(
            component = "process_supervisor",
            event = "process.spawned",
            handle_id = %info.id,
            pid = ?info.pid,
            session_id = ?info.session_id,
            project_path = ?info.project_path,
            "Assistant subprocess spawned"
        );

        tokio::spawn(stdin_writer(info.id.clone(), stdin, stdin_rx));
        tokio::spawn(watch(
            self.shared.clone(),
            info.id.clone(),
            info.owner.clone(),
            child,
            stdout,
            stderr,
            kill_rx,
        ));

        Ok(info)
    }

    fn launch(
        &self,
        options: &ProcessSpawnOptions,
    ) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr), SupervisorError> {
        let mut command = self.launcher.chat_command(options);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailure(e.to_string()))?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => Ok((child, stdin, stdout, stderr)),
            _ => {
                let _ = child.start_kill();
                Err(SupervisorError::SpawnFailure(
                    "child process is missing a stdio pipe".into(),
                ))
            }
        }
    }

    /// Queue bytes for the subprocess stdin.
    pub fn send(&self, id: &str, data: &[u8]) -> bool {
        let table = self.shared.table();
        let Some(entry) = table.entries.get(id) else {
            return false;
        };
        entry.stdin_tx.try_send(data.to_vec()).is_ok()
    }

    /// Ask the subprocess to stop its current turn. The handle stays tracked.
    pub fn interrupt(&self, id: &str) -> bool {
        let table = self.shared.table();
        let Some(entry) = table.entries.get(id) else {
            return false;
        };

        #[cfg(unix)]
        {
            let Some(pid) = entry.info.pid else {
                return false;
            };
            // SAFETY: plain signal delivery to a pid we spawned and still track.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            debug!(
                component = "process_supervisor",
                event = "process.interrupt",
                handle_id = %id,
                pid = pid,
                delivered = rc == 0,
                "Sent SIGINT to subprocess"
            );
            rc == 0
        }

        #[cfg(not(unix))]
        {
            entry.stdin_tx.try_send(vec![crate::INTERRUPT_BYTE]).is_ok()
        }
    }

    /// Remove the handle and terminate its process without waiting for it.
    pub fn kill(&self, id: &str) -> bool {
        let Some(mut entry) = self.shared.remove(id) else {
            return false;
        };
        entry.info.status = ProcessStatus::Stopped;
        if let Some(kill_tx) = entry.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        info!(
            component = "process_supervisor",
            event = "process.killed",
            handle_id = %id,
            pid = ?entry.info.pid,
            "Assistant subprocess killed"
        );
        true
    }

    /// Kill every live handle; returns how many were killed.
    pub fn kill_all(&self) -> usize {
        let ids: Vec<HandleId> = self.shared.table().entries.keys().cloned().collect();
        ids.iter().filter(|id| self.kill(id)).count()
    }

    pub fn on_output(&self, handler: OutputHandler<ProcessEvent>) -> ListenerId {
        self.shared.listeners.add(handler)
    }

    pub fn off_output(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<ProcessInfo> {
        self.shared.table().entries.get(id).map(|e| e.info.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shared.table().entries.contains_key(id)
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.shared
            .table()
            .entries
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_live(&self) -> usize {
        self.max_live
    }
}

/// Wrap a user turn as the stream-json stdin envelope (one line).
pub fn encode_user_turn(content: &str) -> String {
    let envelope = serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": content }],
        },
    });
    let mut line = envelope.to_string();
    line.push('\n');
    line
}

/// Drains the stdin queue into the child.
async fn stdin_writer(id: HandleId, mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = stdin.write_all(&bytes).await {
            error!(
                component = "process_supervisor",
                event = "process.stdin.write_error",
                handle_id = %id,
                error = %e,
                "Failed to write to subprocess stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "process_supervisor",
                event = "process.stdin.flush_error",
                handle_id = %id,
                error = %e,
                "Failed to flush subprocess stdin"
            );
            break;
        }
    }
    debug!(
        component = "process_supervisor",
        event = "process.stdin.closed",
        handle_id = %id,
        "Stdin writer task ended"
    );
}

/// Read stdout/stderr until both close, then reap the child.
///
/// A dropped or fired `kill_rx` terminates the child; reading continues so
/// the final exit is still observed and reported.
async fn watch(
    shared: Arc<Shared>,
    id: HandleId,
    owner: Option<String>,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let emit = |kind: ProcessEventKind| {
        shared.listeners.emit(&ProcessEvent {
            handle_id: id.clone(),
            owner: owner.clone(),
            kind,
        });
    };

    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut out_line = Vec::new();
    let mut err_line = Vec::new();
    let mut out_open = true;
    let mut err_open = true;
    let mut kill_requested = false;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut out_line), if out_open => match read {
                Ok(0) => out_open = false,
                Ok(_) => {
                    shared.mark_running(&id);
                    let line = String::from_utf8_lossy(&out_line).into_owned();
                    out_line.clear();
                    emit(ProcessEventKind::Stdout(line));
                }
                Err(e) => {
                    fail(&shared, &id, &mut child, &emit, format!("stdout read error: {e}"));
                    return;
                }
            },
            read = stderr.read_until(b'\n', &mut err_line), if err_open => match read {
                Ok(0) => err_open = false,
                Ok(_) => {
                    shared.mark_running(&id);
                    let line = String::from_utf8_lossy(&err_line).into_owned();
                    err_line.clear();
                    emit(ProcessEventKind::Stderr(line));
                }
                Err(e) => {
                    fail(&shared, &id, &mut child, &emit, format!("stderr read error: {e}"));
                    return;
                }
            },
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                let _ = child.start_kill();
            }
        }
    }

    // Pipes can close before the process does; a kill must still land.
    let waited = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                let _ = child.start_kill();
            }
        }
    };

    let exit = match waited {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            fail(&shared, &id, &mut child, &emit, format!("wait failed: {e}"));
            return;
        }
    };

    shared.remove(&id);
    info!(
        component = "process_supervisor",
        event = "process.exited",
        handle_id = %id,
        code = ?exit.code,
        signal = ?exit.signal,
        "Assistant subprocess exited"
    );
    emit(ProcessEventKind::Exit(exit));
}

fn fail(
    shared: &Shared,
    id: &str,
    child: &mut Child,
    emit: &impl Fn(ProcessEventKind),
    message: String,
) {
    error!(
        component = "process_supervisor",
        event = "process.error",
        handle_id = %id,
        error = %message,
        "Subprocess I/O failed"
    );
    let _ = child.start_kill();
    shared.remove(id);
    emit(ProcessEventKind::Error(message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ScriptLauncher;
    use std::time::Duration;

    fn supervisor(script: &str, limit: usize) -> ProcessSupervisor {
        ProcessSupervisor::with_limit(Arc::new(ScriptLauncher::new(script, "cat")), limit)
    }

    fn collect(sup: &ProcessSupervisor) -> mpsc::UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        sup.on_output(Arc::new(move |event: &ProcessEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for process event")
            .expect("listener channel closed")
    }

    #[test]
    fn user_turn_envelope_is_one_json_line() {
        let line = encode_user_turn("hello \"world\"");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["message"]["role"], "user");
        assert_eq!(value["message"]["content"][0]["text"], "hello \"world\"");
    }

    #[tokio::test]
    async fn echoes_stdin_and_reports_running() {
        let sup = supervisor("cat", 2);
        let mut rx = collect(&sup);
        let info = sup
            .spawn(ProcessSpawnOptions {
                owner: Some("client-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(info.status, ProcessStatus::Starting);

        assert!(sup.send(&info.id, b"{\"type\":\"ping\"}\n"));
        let event = next_event(&mut rx).await;
        assert_eq!(event.handle_id, info.id);
        assert_eq!(event.owner.as_deref(), Some("client-1"));
        assert_eq!(
            event.kind,
            ProcessEventKind::Stdout("{\"type\":\"ping\"}\n".into())
        );
        assert_eq!(sup.get(&info.id).unwrap().status, ProcessStatus::Running);

        assert!(sup.kill(&info.id));
    }

    #[tokio::test]
    async fn runs_in_project_dir_with_session_env() {
        let project = tempfile::tempdir().unwrap();
        let sup = supervisor("pwd; echo \"$RELAYDOCK_SESSION_ID\"", 1);
        let mut rx = collect(&sup);
        sup.spawn(ProcessSpawnOptions {
            session_id: Some("sess-9".into()),
            project_path: Some(project.path().to_string_lossy().into_owned()),
            ..Default::default()
        })
        .unwrap();

        let ProcessEventKind::Stdout(cwd) = next_event(&mut rx).await.kind else {
            panic!("expected working directory on stdout");
        };
        let reported = std::fs::canonicalize(cwd.trim_end()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(project.path()).unwrap());
        assert_eq!(
            next_event(&mut rx).await.kind,
            ProcessEventKind::Stdout("sess-9\n".into())
        );
    }

    #[tokio::test]
    async fn capacity_ceiling_rejects_without_counting() {
        let sup = supervisor("cat", 1);
        let first = sup.spawn(ProcessSpawnOptions::default()).unwrap();

        let err = sup.spawn(ProcessSpawnOptions::default()).unwrap_err();
        assert!(matches!(err, SupervisorError::CapacityExceeded { limit: 1 }));
        assert_eq!(sup.len(), 1);

        assert!(sup.kill(&first.id));
        assert!(sup.spawn(ProcessSpawnOptions::default()).is_ok());
        assert_eq!(sup.kill_all(), 1);
    }

    #[tokio::test]
    async fn kill_removes_synchronously_and_send_fails() {
        let sup = supervisor("cat", 2);
        let mut rx = collect(&sup);
        let info = sup.spawn(ProcessSpawnOptions::default()).unwrap();

        assert!(sup.kill(&info.id));
        assert!(!sup.contains(&info.id));
        assert!(!sup.send(&info.id, b"late\n"));
        assert!(!sup.interrupt(&info.id));
        assert!(!sup.kill(&info.id));

        // The OS exit still arrives, after the handle is already gone.
        let event = next_event(&mut rx).await;
        match event.kind {
            ProcessEventKind::Exit(exit) => assert!(exit.signal.is_some() || exit.code.is_some()),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_is_removed_before_listeners_run() {
        let sup = Arc::new(supervisor("echo done; exit 3", 2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = sup.clone();
        sup.on_output(Arc::new(move |event: &ProcessEvent| {
            if let ProcessEventKind::Exit(exit) = &event.kind {
                let _ = tx.send((observer.contains(&event.handle_id), exit.clone()));
            }
        }));

        sup.spawn(ProcessSpawnOptions::default()).unwrap();
        let (still_tracked, exit) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!still_tracked);
        assert_eq!(exit.reason(), "Exit code: 3");
        assert!(sup.is_empty());
    }

    #[tokio::test]
    async fn output_order_is_preserved_per_handle() {
        let sup = supervisor("for i in 1 2 3 4 5; do echo line$i; done", 2);
        let mut rx = collect(&sup);
        sup.spawn(ProcessSpawnOptions::default()).unwrap();

        let mut lines = Vec::new();
        loop {
            let event = next_event(&mut rx).await;
            match event.kind {
                ProcessEventKind::Stdout(line) => lines.push(line.trim_end().to_string()),
                ProcessEventKind::Exit(_) => break,
                _ => {}
            }
        }
        assert_eq!(lines, vec!["line1", "line2", "line3", "line4", "line5"]);
    }

    #[tokio::test]
    async fn stderr_is_reported_separately() {
        let sup = supervisor("echo oops >&2", 2);
        let mut rx = collect(&sup);
        sup.spawn(ProcessSpawnOptions::default()).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, ProcessEventKind::Stderr("oops\n".into()));
    }

    #[tokio::test]
    async fn spawn_failure_releases_the_slot() {
        let sup = supervisor("cat", 1);
        let err = sup
            .spawn(ProcessSpawnOptions {
                project_path: Some("/definitely/not/a/real/dir".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailure(_)));
        assert!(sup.is_empty());

        let ok = sup.spawn(ProcessSpawnOptions::default()).unwrap();
        sup.kill(&ok.id);
    }

    #[tokio::test]
    async fn off_output_stops_delivery() {
        let sup = supervisor("cat", 1);
        let (tx, mut rx) = mpsc::unbounded_channel::<ProcessEvent>();
        let listener = sup.on_output(Arc::new(move |event: &ProcessEvent| {
            let _ = tx.send(event.clone());
        }));
        assert!(sup.off_output(listener));

        let info = sup.spawn(ProcessSpawnOptions::default()).unwrap();
        sup.send(&info.id, b"x\n");
        sup.kill(&info.id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
