//! Pseudo-terminal supervisor
//!
//! Runs the interactive assistant CLI under a PTY. Output is raw terminal
//! data; a reader thread decodes it to text without ever splitting a UTF-8
//! sequence across two events.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portable_pty::{native_pty_system, Child, ChildKiller, MasterPty, PtySize};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use relaydock_protocol::{new_id, TerminalSize};

use crate::launcher::Launcher;
use crate::listeners::{ListenerId, ListenerSet, OutputHandler};
use crate::{now_millis, Admission, ExitInfo, HandleId, SupervisorError, DEFAULT_MAX_LIVE};

const READ_CHUNK: usize = 8192;
const INPUT_QUEUE: usize = 256;

/// Options for spawning a terminal backend
#[derive(Debug, Clone, Default)]
pub struct PtySpawnOptions {
    pub session_id: Option<String>,
    pub project_path: Option<String>,
    pub size: TerminalSize,
    pub skip_permissions: bool,
    pub owner: Option<String>,
}

/// Snapshot of a supervised terminal
#[derive(Debug, Clone, Serialize)]
pub struct PtyInfo {
    pub id: HandleId,
    pub session_id: Option<String>,
    pub owner: Option<String>,
    pub project_path: Option<String>,
    pub pid: Option<u32>,
    pub size: TerminalSize,
    pub started_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PtyEvent {
    pub handle_id: HandleId,
    pub owner: Option<String>,
    pub kind: PtyEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PtyEventKind {
    Data(String),
    Exit(ExitInfo),
    Error(String),
}

struct PtyEntry {
    info: PtyInfo,
    master: Box<dyn MasterPty + Send>,
    input_tx: SyncSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

#[derive(Default)]
struct PtyTable {
    entries: HashMap<HandleId, PtyEntry>,
    admission: Admission,
}

struct Shared {
    table: Mutex<PtyTable>,
    listeners: ListenerSet<PtyEvent>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PtyTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Launched {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

/// Owns interactive terminal backends
pub struct PtySupervisor {
    launcher: Arc<dyn Launcher>,
    max_live: usize,
    shared: Arc<Shared>,
}

impl PtySupervisor {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self::with_limit(launcher, DEFAULT_MAX_LIVE)
    }

    pub fn with_limit(launcher: Arc<dyn Launcher>, max_live: usize) -> Self {
        Self {
            launcher,
            max_live,
            shared: Arc::new(Shared {
                table: Mutex::new(PtyTable::default()),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Open a PTY sized per `options` and start the interactive CLI in it.
    pub fn spawn(&self, options: PtySpawnOptions) -> Result<PtyInfo, SupervisorError> {
        {
            let mut table = self.shared.table();
            let live = table.entries.len();
            table.admission.reserve(live, self.max_live)?;
        }

        let launched = match self.launch(&options) {
            Ok(launched) => launched,
            Err(e) => {
                self.shared.table().admission.release();
                warn!(
                    component = "pty_supervisor",
                    event = "pty.spawn_failed",
                    error = %e,
                    "Failed to spawn terminal backend"
                );
                return Err(e);
            }
        };
        let Launched {
            master,
            child,
            reader,
            writer,
        } = launched;

        let info = PtyInfo {
            id: new_id(),
            session_id: options.session_id.clone(),
            owner: options.owner.clone(),
            project_path: options.project_path.clone(),
            pid: child.process_id(),
            size: options.size,
            started_at: now_millis(),
        };

        let (input_tx, input_rx) = sync_channel::<Vec<u8>>(INPUT_QUEUE);
        let killer = child.clone_killer();
        {
            let mut table = self.shared.table();
            table.admission.release();
            table.entries.insert(
                info.id.clone(),
                PtyEntry {
                    info: info.clone(),
                    master,
                    input_tx,
                    killer,
                },
            );
        }

        info!(
            component = "pty_supervisor",
            event = "pty.spawned",
            handle_id = %info.id,
            pid = ?info.pid,
            cols = info.size.cols,
            rows = info.size.rows,
            "Terminal backend spawned"
        );

        let writer_id = info.id.clone();
        std::thread::spawn(move || input_writer(writer_id, writer, input_rx));

        let shared = self.shared.clone();
        let reader_id = info.id.clone();
        let owner = info.owner.clone();
        std::thread::spawn(move || read_output(shared, reader_id, owner, reader, child));

        Ok(info)
    }

    fn launch(&self, options: &PtySpawnOptions) -> Result<Launched, SupervisorError> {
        let spawn_err = |e: anyhow::Error| SupervisorError::SpawnFailure(e.to_string());

        let pair = native_pty_system()
            .openpty(pty_size(options.size))
            .map_err(spawn_err)?;
        let command = self.launcher.terminal_command(options);
        let child = pair.slave.spawn_command(command).map_err(spawn_err)?;
        // The reader only sees EOF once no slave handle is left open here.
        drop(pair.slave);

        let mut child = child;
        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                return Err(spawn_err(e));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                return Err(spawn_err(e));
            }
        };

        Ok(Launched {
            master: pair.master,
            child,
            reader,
            writer,
        })
    }

    /// Queue raw bytes for the terminal input.
    pub fn write(&self, id: &str, data: &[u8]) -> bool {
        let table = self.shared.table();
        let Some(entry) = table.entries.get(id) else {
            return false;
        };
        match entry.input_tx.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    component = "pty_supervisor",
                    event = "pty.input.queue_full",
                    handle_id = %id,
                    "Terminal input queue full, dropping write"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Send Ctrl-C through the terminal.
    pub fn interrupt(&self, id: &str) -> bool {
        self.write(id, &[crate::INTERRUPT_BYTE])
    }

    /// Change the terminal dimensions. Zero dimensions are rejected.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            return false;
        }
        let mut table = self.shared.table();
        let Some(entry) = table.entries.get_mut(id) else {
            return false;
        };
        let size = TerminalSize { cols, rows };
        match entry.master.resize(pty_size(size)) {
            Ok(()) => {
                entry.info.size = size;
                debug!(
                    component = "pty_supervisor",
                    event = "pty.resized",
                    handle_id = %id,
                    cols = cols,
                    rows = rows,
                    "Terminal resized"
                );
                true
            }
            Err(e) => {
                warn!(
                    component = "pty_supervisor",
                    event = "pty.resize_failed",
                    handle_id = %id,
                    error = %e,
                    "Terminal resize failed"
                );
                false
            }
        }
    }

    /// Remove the handle and terminate its process without waiting for it.
    pub fn kill(&self, id: &str) -> bool {
        let Some(mut entry) = self.shared.table().entries.remove(id) else {
            return false;
        };
        if let Err(e) = entry.killer.kill() {
            debug!(
                component = "pty_supervisor",
                event = "pty.kill_failed",
                handle_id = %id,
                error = %e,
                "Terminal backend already gone"
            );
        }
        info!(
            component = "pty_supervisor",
            event = "pty.killed",
            handle_id = %id,
            pid = ?entry.info.pid,
            "Terminal backend killed"
        );
        true
    }

    pub fn kill_all(&self) -> usize {
        let ids: Vec<HandleId> = self.shared.table().entries.keys().cloned().collect();
        ids.iter().filter(|id| self.kill(id)).count()
    }

    pub fn on_output(&self, handler: OutputHandler<PtyEvent>) -> ListenerId {
        self.shared.listeners.add(handler)
    }

    pub fn off_output(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<PtyInfo> {
        self.shared.table().entries.get(id).map(|e| e.info.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shared.table().entries.contains_key(id)
    }

    pub fn list(&self) -> Vec<PtyInfo> {
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

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn input_writer(
    id: HandleId,
    mut writer: Box<dyn Write + Send>,
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    while let Ok(bytes) = rx.recv() {
        if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
            debug!(
                component = "pty_supervisor",
                event = "pty.input.write_error",
                handle_id = %id,
                error = %e,
                "Terminal input closed"
            );
            break;
        }
    }
}

fn read_output(
    shared: Arc<Shared>,
    id: HandleId,
    owner: Option<String>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
) {
    let emit = |kind: PtyEventKind| {
        shared.listeners.emit(&PtyEvent {
            handle_id: id.clone(),
            owner: owner.clone(),
            kind,
        });
    };

    let mut buf = [0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    let mut read_error = None;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                if let Some(text) = take_complete_utf8(&mut pending) {
                    emit(PtyEventKind::Data(text));
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the slave side is gone.
            Err(e) if e.raw_os_error() == Some(5) => break,
            Err(e) => {
                read_error = Some(e.to_string());
                break;
            }
        }
    }

    if !pending.is_empty() {
        emit(PtyEventKind::Data(
            String::from_utf8_lossy(&pending).into_owned(),
        ));
    }

    if let Some(message) = read_error {
        error!(
            component = "pty_supervisor",
            event = "pty.read_error",
            handle_id = %id,
            error = %message,
            "Terminal read failed"
        );
        let _ = child.kill();
        shared.table().entries.remove(&id);
        emit(PtyEventKind::Error(message));
        return;
    }

    let exit = match child.wait() {
        Ok(status) => {
            let signal = status.signal().map(str::to_string);
            ExitInfo {
                code: signal.is_none().then(|| status.exit_code() as i32),
                signal,
            }
        }
        Err(e) => {
            shared.table().entries.remove(&id);
            emit(PtyEventKind::Error(format!("wait failed: {e}")));
            return;
        }
    };

    shared.table().entries.remove(&id);
    info!(
        component = "pty_supervisor",
        event = "pty.exited",
        handle_id = %id,
        code = ?exit.code,
        signal = ?exit.signal,
        "Terminal backend exited"
    );
    emit(PtyEventKind::Exit(exit));
}

/// Drain the longest valid prefix of `pending` as text, keeping an incomplete
/// trailing sequence for the next read. Invalid bytes decode as U+FFFD.
fn take_complete_utf8(pending: &mut Vec<u8>) -> Option<String> {
    let keep = incomplete_tail(pending);
    let complete = pending.len() - keep;
    if complete == 0 {
        return None;
    }
    let text = String::from_utf8_lossy(&pending[..complete]).into_owned();
    pending.drain(..complete);
    Some(text)
}

/// Length of a trailing, not yet complete, UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ScriptLauncher;
    use std::sync::mpsc::{channel, Receiver};
    use std::time::{Duration, Instant};

    fn collect(sup: &PtySupervisor) -> Receiver<PtyEvent> {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        sup.on_output(Arc::new(move |event: &PtyEvent| {
            let _ = tx.lock().unwrap().send(event.clone());
        }));
        rx
    }

    /// PTYs are unavailable in some sandboxes; those tests become no-ops.
    fn try_spawn(sup: &PtySupervisor, options: PtySpawnOptions) -> Option<PtyInfo> {
        match sup.spawn(options) {
            Ok(info) => Some(info),
            Err(SupervisorError::SpawnFailure(reason)) => {
                eprintln!("skipping: no pty available ({reason})");
                None
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    fn wait_for_exit(rx: &Receiver<PtyEvent>) -> (String, ExitInfo) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut output = String::new();
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(PtyEvent {
                    kind: PtyEventKind::Data(data),
                    ..
                }) => output.push_str(&data),
                Ok(PtyEvent {
                    kind: PtyEventKind::Exit(exit),
                    ..
                }) => return (output, exit),
                Ok(_) | Err(_) => {}
            }
        }
        panic!("terminal did not exit; output so far: {output:?}");
    }

    #[test]
    fn incomplete_tail_detects_split_sequences() {
        let snowman = "☃".as_bytes(); // 3 bytes
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail(&snowman[..1]), 1);
        assert_eq!(incomplete_tail(&snowman[..2]), 2);
        assert_eq!(incomplete_tail(snowman), 0);

        let crab = "🦀".as_bytes(); // 4 bytes
        assert_eq!(incomplete_tail(&crab[..3]), 3);
        assert_eq!(incomplete_tail(crab), 0);
    }

    #[test]
    fn carries_partial_characters_between_reads() {
        let bytes = "a☃b".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(take_complete_utf8(&mut pending).as_deref(), Some("a"));
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_complete_utf8(&mut pending).as_deref(), Some("☃b"));
        assert!(pending.is_empty());
    }

    #[test]
    fn terminal_output_and_exit_code() {
        let sup = PtySupervisor::with_limit(
            Arc::new(ScriptLauncher::new("cat", "printf 'hello pty'; exit 4")),
            2,
        );
        let rx = collect(&sup);
        let Some(info) = try_spawn(&sup, PtySpawnOptions::default()) else {
            return;
        };
        assert_eq!(info.size, TerminalSize::default());

        let (output, exit) = wait_for_exit(&rx);
        assert!(output.contains("hello pty"), "output: {output:?}");
        assert_eq!(exit.reason(), "Exit code: 4");
        assert!(!sup.contains(&info.id));
    }

    #[test]
    fn write_resize_and_kill() {
        let sup = PtySupervisor::with_limit(Arc::new(ScriptLauncher::echo()), 1);
        let rx = collect(&sup);
        let Some(info) = try_spawn(&sup, PtySpawnOptions::default()) else {
            return;
        };

        assert!(sup.write(&info.id, b"ping\n"));
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut echoed = String::new();
        while !echoed.contains("ping") && Instant::now() < deadline {
            if let Ok(PtyEvent {
                kind: PtyEventKind::Data(data),
                ..
            }) = rx.recv_timeout(Duration::from_millis(200))
            {
                echoed.push_str(&data);
            }
        }
        assert!(echoed.contains("ping"), "output: {echoed:?}");

        assert!(sup.resize(&info.id, 100, 40));
        assert_eq!(sup.get(&info.id).unwrap().size, TerminalSize { cols: 100, rows: 40 });
        assert!(!sup.resize(&info.id, 0, 40));

        assert!(matches!(
            sup.spawn(PtySpawnOptions::default()),
            Err(SupervisorError::CapacityExceeded { limit: 1 })
        ));

        assert!(sup.kill(&info.id));
        assert!(!sup.contains(&info.id));
        assert!(!sup.write(&info.id, b"late"));
        assert!(!sup.resize(&info.id, 80, 24));

        let (_output, exit) = wait_for_exit(&rx);
        assert!(exit.signal.is_some() || exit.code.is_some());
    }
}
