//! Interactive PTY terminals with persisted scrollback.
//!
//! A live terminal and its persisted [`TerminalSession`] row are owned
//! separately: the process exiting leaves the row in place so the session can
//! be restored later, and only [`TerminalManager::destroy`] removes both.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::config::{SessionConfig, VigilConfig};
use vigil_core::events::SupervisorEventKind;
use vigil_core::types::TaskKey;

use crate::capture::{agent_project_dir, capture_session_id, CapturePolicy};
use crate::events::EventBus;
use crate::output::{OutputBuffer, Utf8ChunkDecoder};
use crate::persistence::{PersistenceError, SqliteStore, TerminalSession};
use crate::terminate::{send_signal, Signal};

const READ_CHUNK: usize = 4096;
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("terminal session {id} not found")]
    NotFound { id: String },
    #[error("terminal session {id} is already running")]
    AlreadyRunning { id: String },
    #[error("pty error for terminal {id}: {message}")]
    Pty { id: String, message: String },
    #[error("failed to write to terminal {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 40, cols: 120 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTerminal {
    pub id: String,
    pub working_path: PathBuf,
    pub project_path: Option<PathBuf>,
    pub title: Option<String>,
    pub size: TerminalSize,
}

impl CreateTerminal {
    pub fn new(id: impl Into<String>, working_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            working_path: working_path.into(),
            project_path: None,
            title: None,
            size: TerminalSize::default(),
        }
    }
}

struct LiveTerminal {
    generation: u64,
    pid: Option<u32>,
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    output: Arc<Mutex<OutputBuffer>>,
    exited: Arc<AtomicBool>,
}

struct ManagerInner {
    live: Mutex<HashMap<String, LiveTerminal>>,
    store: Arc<Mutex<SqliteStore>>,
    events: EventBus,
    session: SessionConfig,
    capture: CapturePolicy,
    stop_grace: Duration,
    generation: AtomicU64,
}

/// Owns every live terminal. Cheap to clone. Methods that start processes
/// must run inside a tokio runtime.
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<ManagerInner>,
}

impl TerminalManager {
    pub fn new(store: Arc<Mutex<SqliteStore>>, events: EventBus, config: &VigilConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                live: Mutex::new(HashMap::new()),
                store,
                events,
                session: config.session.clone(),
                capture: CapturePolicy::from_config(&config.session),
                stop_grace: Duration::from_millis(config.supervisor.stop_grace_ms),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn create(&self, request: CreateTerminal) -> Result<TerminalSession, SessionError> {
        let now = Utc::now();
        let mut session = TerminalSession::new(request.id.clone(), request.working_path, now);
        session.project_path = request.project_path;
        if let Some(title) = request.title {
            session.title = title;
        }

        self.spawn_live(&session, request.size)?;
        self.with_store(|store| store.upsert_session(&session))?;
        info!(terminal = %session.id, cwd = %session.working_path.display(), "terminal created");
        Ok(session)
    }

    /// Bring a persisted session back: new shell at the same path, old
    /// scrollback replayed, and the agent conversation resumed when the
    /// session was in agent mode. No capture poll runs.
    pub fn restore(&self, id: &str, size: TerminalSize) -> Result<TerminalSession, SessionError> {
        let mut session = self
            .with_store(|store| store.load_session(id))?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;

        self.spawn_live(&session, size)?;
        if !session.output_buffer.is_empty() {
            self.inner.events.emit(
                &TaskKey::new(id),
                SupervisorEventKind::TerminalOutput {
                    data: session.output_buffer.clone(),
                },
            );
        }
        if session.agent_mode {
            if let Some(agent_session_id) = session.agent_session_id.as_deref() {
                let resume = format!("{} --resume {agent_session_id}\r", self.inner.session.agent_command);
                self.write(id, &resume)?;
            }
        }

        session.last_active_at = Utc::now();
        self.with_store(|store| store.upsert_session(&session))?;
        info!(terminal = %id, "terminal restored");
        Ok(session)
    }

    pub fn write(&self, id: &str, data: &str) -> Result<(), SessionError> {
        let mut live = self.live();
        let terminal = live
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        let write_err = |source| SessionError::Write {
            id: id.to_string(),
            source,
        };
        terminal.writer.write_all(data.as_bytes()).map_err(write_err)?;
        terminal.writer.flush().map_err(write_err)
    }

    pub fn resize(&self, id: &str, size: TerminalSize) -> Result<(), SessionError> {
        let live = self.live();
        let terminal = live
            .get(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        terminal
            .master
            .resize(size.into())
            .map_err(|err| SessionError::Pty {
                id: id.to_string(),
                message: err.to_string(),
            })
    }

    pub fn set_title(&self, id: &str, title: &str) -> Result<(), SessionError> {
        let updated = self.with_store(|store| store.update_title(id, title, Utc::now()))?;
        found(id, updated)
    }

    pub fn set_agent_mode(&self, id: &str, agent_mode: bool) -> Result<(), SessionError> {
        let updated = self.with_store(|store| store.update_agent_mode(id, agent_mode, Utc::now()))?;
        found(id, updated)
    }

    /// Start the agent CLI in the terminal and, unless the session already
    /// knows its conversation id, poll for it in the background. The handle
    /// resolves to the captured id.
    pub fn invoke_agent(&self, id: &str) -> Result<Option<JoinHandle<Option<String>>>, SessionError> {
        let session = self
            .with_store(|store| store.load_session(id))?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        let started_at = Utc::now();
        self.write(id, &format!("{}\r", self.inner.session.agent_command))?;
        self.set_agent_mode(id, true)?;

        if session.agent_session_id.is_some() {
            return Ok(None);
        }
        let Some(projects_root) = self.inner.session.resolved_agent_projects_dir() else {
            warn!(terminal = %id, "no agent projects directory; session id will not be captured");
            return Ok(None);
        };

        let dir = agent_project_dir(&projects_root, &session.working_path);
        let manager = self.clone();
        let id = id.to_string();
        Ok(Some(tokio::spawn(async move {
            let wanted = {
                let manager = manager.clone();
                let id = id.clone();
                move || manager.awaits_session_id(&id)
            };
            let captured = capture_session_id(dir, started_at, manager.inner.capture, wanted).await?;
            manager.record_session_id(&id, &captured);
            Some(captured)
        })))
    }

    /// Kill the process if it is running and delete the persisted row.
    /// Returns false when neither existed.
    pub fn destroy(&self, id: &str) -> Result<bool, SessionError> {
        let removed = self.live().remove(id);
        let was_live = removed.is_some();
        if let Some(terminal) = removed {
            self.terminate(id, terminal);
        }
        let deleted = self.with_store(|store| store.delete_session(id))?;
        info!(terminal = %id, was_live, deleted, "terminal destroyed");
        Ok(was_live || deleted)
    }

    /// Persist the live scrollback for `id`.
    pub fn flush_output(&self, id: &str) -> Result<bool, SessionError> {
        let Some(text) = self.snapshot(id) else {
            return Ok(false);
        };
        Ok(self.with_store(|store| store.update_output(id, &text, Utc::now()))?)
    }

    pub fn flush_all(&self) -> usize {
        self.live_ids()
            .iter()
            .filter(|id| match self.flush_output(id) {
                Ok(flushed) => flushed,
                Err(err) => {
                    warn!(terminal = %id, error = %err, "failed to persist terminal output");
                    false
                }
            })
            .count()
    }

    pub fn snapshot(&self, id: &str) -> Option<String> {
        let output = self.live().get(id).map(|terminal| Arc::clone(&terminal.output))?;
        let text = lock(&output).to_text();
        Some(text)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live().contains_key(id)
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> Result<Vec<TerminalSession>, SessionError> {
        Ok(self.with_store(SqliteStore::list_sessions)?)
    }

    pub fn session(&self, id: &str) -> Result<Option<TerminalSession>, SessionError> {
        Ok(self.with_store(|store| store.load_session(id))?)
    }

    fn spawn_live(&self, session: &TerminalSession, size: TerminalSize) -> Result<(), SessionError> {
        let id = session.id.clone();
        if self.is_live(&id) {
            return Err(SessionError::AlreadyRunning { id });
        }
        let pty_err = |err: anyhow::Error| SessionError::Pty {
            id: session.id.clone(),
            message: err.to_string(),
        };

        let pair = native_pty_system().openpty(size.into()).map_err(pty_err)?;
        let mut command = CommandBuilder::new(self.shell());
        command.cwd(&session.working_path);
        for (key, value) in std::env::vars() {
            command.env(key, value);
        }
        command.env("TERM", "xterm-256color");

        let mut child = pair.slave.spawn_command(command).map_err(pty_err)?;
        drop(pair.slave);
        let writer = pair.master.take_writer().map_err(pty_err)?;
        let reader = pair.master.try_clone_reader().map_err(pty_err)?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let output = Arc::new(Mutex::new(OutputBuffer::with_contents(
            self.inner.session.output_buffer_bytes,
            &session.output_buffer,
        )));
        let exited = Arc::new(AtomicBool::new(false));
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut live = self.live();
            if live.contains_key(&id) {
                if let Err(err) = child.kill() {
                    debug!(terminal = %id, error = %err, "failed to kill duplicate terminal");
                }
                return Err(SessionError::AlreadyRunning { id });
            }
            live.insert(
                id.clone(),
                LiveTerminal {
                    generation,
                    pid,
                    writer,
                    master: pair.master,
                    killer,
                    output: Arc::clone(&output),
                    exited: Arc::clone(&exited),
                },
            );
        }
        debug!(terminal = %id, ?pid, generation, "pty spawned");

        let events = self.inner.events.clone();
        let key = TaskKey::new(id.clone());
        let reader_output = Arc::clone(&output);
        let pump = tokio::task::spawn_blocking(move || read_loop(reader, &key, &events, &reader_output));

        let manager = self.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            exited.store(true, Ordering::SeqCst);
            let code = match status {
                Ok(Ok(status)) => i32::try_from(status.exit_code()).ok(),
                Ok(Err(err)) => {
                    warn!(terminal = %id, error = %err, "failed to wait for terminal process");
                    None
                }
                Err(err) => {
                    warn!(terminal = %id, error = %err, "terminal wait task failed");
                    None
                }
            };
            if tokio::time::timeout(READER_DRAIN, pump).await.is_err() {
                debug!(terminal = %id, "pty reader still open after exit");
            }
            manager.handle_exit(&id, generation, &output, code);
        });
        Ok(())
    }

    /// Only the spawn still registered under `id` may touch its row or
    /// report an exit; a destroyed or replaced shell exits silently.
    fn handle_exit(&self, id: &str, generation: u64, output: &Arc<Mutex<OutputBuffer>>, code: Option<i32>) {
        let current = {
            let mut live = self.live();
            let current = live.get(id).is_some_and(|terminal| terminal.generation == generation);
            if current {
                live.remove(id);
            }
            current
        };
        if !current {
            debug!(terminal = %id, generation, ?code, "stale terminal exit ignored");
            return;
        }
        let text = lock(output).to_text();
        if let Err(err) = self.with_store(|store| store.update_output(id, &text, Utc::now())) {
            warn!(terminal = %id, error = %err, "failed to persist terminal output");
        }
        info!(terminal = %id, ?code, "terminal exited");
        self.inner
            .events
            .emit(&TaskKey::new(id), SupervisorEventKind::TerminalExit { code });
    }

    /// SIGTERM, then a hard kill after the grace period if the shell is
    /// still running.
    fn terminate(&self, id: &str, terminal: LiveTerminal) {
        let LiveTerminal {
            pid,
            mut killer,
            exited,
            ..
        } = terminal;
        let signalled = pid.is_some_and(|pid| match send_signal(pid, Signal::Terminate) {
            Ok(delivered) => delivered,
            Err(err) => {
                debug!(terminal = %id, pid, error = %err, "SIGTERM not delivered");
                false
            }
        });
        if !signalled {
            if let Err(err) = killer.kill() {
                debug!(terminal = %id, error = %err, "terminal kill failed");
            }
            return;
        }

        let grace = self.inner.stop_grace;
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::SeqCst) {
                warn!(terminal = %id, "terminal ignored SIGTERM; killing");
                if let Err(err) = killer.kill() {
                    debug!(terminal = %id, error = %err, "terminal kill failed");
                }
            }
        });
    }

    fn awaits_session_id(&self, id: &str) -> bool {
        match self.with_store(|store| store.load_session(id)) {
            Ok(Some(session)) => session.agent_session_id.is_none(),
            Ok(None) => false,
            Err(err) => {
                debug!(terminal = %id, error = %err, "session lookup failed during capture");
                false
            }
        }
    }

    fn record_session_id(&self, id: &str, agent_session_id: &str) {
        match self.with_store(|store| store.set_agent_session_id(id, agent_session_id, Utc::now())) {
            Ok(true) => {
                info!(terminal = %id, agent_session_id, "agent session captured");
                self.inner.events.emit(
                    &TaskKey::new(id),
                    SupervisorEventKind::SessionCaptured {
                        agent_session_id: agent_session_id.to_string(),
                    },
                );
            }
            Ok(false) => debug!(terminal = %id, "session removed before capture completed"),
            Err(err) => warn!(terminal = %id, error = %err, "failed to store agent session id"),
        }
    }

    fn shell(&self) -> String {
        self.inner
            .session
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(default_shell)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveTerminal>> {
        lock(&self.inner.live)
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&SqliteStore) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        f(&lock(&self.inner.store))
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    key: &TaskKey,
    events: &EventBus,
    output: &Arc<Mutex<OutputBuffer>>,
) {
    let mut decoder = Utf8ChunkDecoder::default();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let (text, done) = match reader.read(&mut buf) {
            Ok(0) | Err(_) => (decoder.finish(), true),
            Ok(n) => {
                lock(output).extend(&buf[..n]);
                (decoder.decode(&buf[..n]), false)
            }
        };
        if !text.is_empty() {
            events.emit(key, SupervisorEventKind::TerminalOutput { data: text });
        }
        if done {
            break;
        }
    }
}

fn found(id: &str, updated: bool) -> Result<(), SessionError> {
    if updated {
        Ok(())
    } else {
        Err(SessionError::NotFound { id: id.to_string() })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(unix)]
fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[cfg(not(unix))]
fn default_shell() -> String {
    "cmd.exe".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::broadcast;
    use vigil_core::config::VigilConfig;
    use vigil_core::events::{SupervisorEvent, SupervisorEventKind};

    use super::{CreateTerminal, SessionError, TerminalManager, TerminalSize};
    use crate::capture::agent_project_dir;
    use crate::events::EventBus;
    use crate::persistence::{SqliteStore, TerminalSession};

    struct Harness {
        manager: TerminalManager,
        events: EventBus,
        store: Arc<Mutex<SqliteStore>>,
        dir: tempfile::TempDir,
    }

    fn harness(agent_command: &str) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open_in_memory().expect("sqlite");
        store.migrate().expect("migrate");
        let store = Arc::new(Mutex::new(store));

        let mut config = VigilConfig::default();
        config.session.shell = Some("/bin/sh".to_string());
        config.session.agent_command = agent_command.to_string();
        config.session.agent_projects_dir = Some(dir.path().join("projects"));
        config.session.capture_initial_delay_ms = 10;
        config.session.capture_interval_ms = 20;
        config.session.capture_max_attempts = 100;
        config.supervisor.stop_grace_ms = 200;

        let events = EventBus::default();
        let manager = TerminalManager::new(Arc::clone(&store), events.clone(), &config);
        Harness {
            manager,
            events,
            store,
            dir,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SupervisorEvent>,
        mut matches: impl FnMut(&SupervisorEventKind) -> bool,
    ) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event");
                if matches(&event.kind) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    #[tokio::test]
    async fn create_write_and_destroy() {
        let h = harness("true");
        h.manager
            .create(CreateTerminal::new("term-1", h.dir.path()))
            .expect("create");
        assert!(h.manager.is_live("term-1"));
        assert!(matches!(
            h.manager.create(CreateTerminal::new("term-1", h.dir.path())),
            Err(SessionError::AlreadyRunning { .. })
        ));

        h.manager.write("term-1", "echo vigil-$((40+2))\r").expect("write");
        wait_until(|| {
            h.manager
                .snapshot("term-1")
                .is_some_and(|text| text.contains("vigil-42"))
        })
        .await;
        h.manager
            .resize("term-1", TerminalSize { rows: 24, cols: 80 })
            .expect("resize");

        assert!(h.manager.destroy("term-1").expect("destroy"));
        assert!(!h.manager.is_live("term-1"));
        assert!(h.manager.session("term-1").expect("load").is_none());
        assert!(!h.manager.destroy("term-1").expect("destroy again"));
        assert!(matches!(
            h.manager.write("term-1", "x"),
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn process_exit_keeps_persisted_session() {
        let h = harness("true");
        let mut rx = h.events.subscribe();
        h.manager
            .create(CreateTerminal::new("term-1", h.dir.path()))
            .expect("create");
        h.manager.write("term-1", "echo bye-now; exit 3\r").expect("write");

        let exit = next_matching(&mut rx, |kind| matches!(kind, SupervisorEventKind::TerminalExit { .. })).await;
        assert_eq!(exit.key.0, "term-1");
        assert_eq!(exit.kind, SupervisorEventKind::TerminalExit { code: Some(3) });

        wait_until(|| !h.manager.is_live("term-1")).await;
        let session = h.manager.session("term-1").expect("load").expect("row kept");
        assert!(session.output_buffer.contains("bye-now"));
    }

    #[tokio::test]
    async fn destroyed_shell_exit_leaves_recreated_terminal_alone() {
        let h = harness("true");
        let mut rx = h.events.subscribe();
        h.manager
            .create(CreateTerminal::new("term-1", h.dir.path()))
            .expect("create");
        h.manager.write("term-1", "echo old-$((1+1))\r").expect("write");
        wait_until(|| {
            h.manager
                .snapshot("term-1")
                .is_some_and(|text| text.contains("old-2"))
        })
        .await;

        assert!(h.manager.destroy("term-1").expect("destroy"));
        h.manager
            .create(CreateTerminal::new("term-1", h.dir.path()))
            .expect("recreate");
        // Past the kill grace period, so the old shell is gone.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(h.manager.is_live("term-1"));
        let session = h.manager.session("term-1").expect("load").expect("row");
        assert!(!session.output_buffer.contains("old-2"));
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event.kind, SupervisorEventKind::TerminalExit { .. }),
                "unexpected exit for {}",
                event.key
            );
        }
        h.manager.destroy("term-1").expect("cleanup");
    }

    #[tokio::test]
    async fn title_and_mode_updates_require_a_session() {
        let h = harness("true");
        h.manager
            .create(CreateTerminal::new("term-1", h.dir.path()))
            .expect("create");
        h.manager.set_title("term-1", "api server").expect("title");
        h.manager.set_agent_mode("term-1", true).expect("mode");

        let session = h.manager.session("term-1").expect("load").expect("row");
        assert_eq!(session.title, "api server");
        assert!(session.agent_mode);
        assert!(matches!(
            h.manager.set_title("missing", "x"),
            Err(SessionError::NotFound { .. })
        ));
        h.manager.destroy("term-1").expect("destroy");
    }

    #[tokio::test]
    async fn restore_replays_output_and_resumes_agent() {
        let h = harness("echo resumed");
        let mut session = TerminalSession::new("term-9", h.dir.path(), Utc::now());
        session.output_buffer = "earlier scrollback\n".to_string();
        session.agent_mode = true;
        session.agent_session_id = Some("abc-123".to_string());
        h.store
            .lock()
            .expect("store")
            .upsert_session(&session)
            .expect("seed");

        let mut rx = h.events.subscribe();
        h.manager
            .restore("term-9", TerminalSize::default())
            .expect("restore");

        let replay = next_matching(&mut rx, |kind| matches!(kind, SupervisorEventKind::TerminalOutput { .. })).await;
        assert_eq!(
            replay.kind,
            SupervisorEventKind::TerminalOutput {
                data: "earlier scrollback\n".to_string()
            }
        );
        wait_until(|| {
            h.manager
                .snapshot("term-9")
                .is_some_and(|text| text.starts_with("earlier scrollback") && text.contains("resumed --resume abc-123"))
        })
        .await;
        assert!(matches!(
            h.manager.restore("term-9", TerminalSize::default()),
            Err(SessionError::AlreadyRunning { .. })
        ));
        assert!(matches!(
            h.manager.restore("nope", TerminalSize::default()),
            Err(SessionError::NotFound { .. })
        ));
        h.manager.destroy("term-9").expect("destroy");
    }

    #[tokio::test]
    async fn invoke_agent_captures_session_id() {
        let h = harness("true");
        let mut rx = h.events.subscribe();
        let working = h.dir.path().join("work");
        fs::create_dir_all(&working).expect("work dir");
        h.manager
            .create(CreateTerminal::new("term-1", &working))
            .expect("create");

        let capture = h
            .manager
            .invoke_agent("term-1")
            .expect("invoke")
            .expect("capture started");
        let transcripts = agent_project_dir(&h.dir.path().join("projects"), Path::new(&working));
        fs::create_dir_all(&transcripts).expect("transcript dir");
        fs::write(transcripts.join("sess-77.jsonl"), "{}\n").expect("transcript");

        assert_eq!(capture.await.expect("join").as_deref(), Some("sess-77"));
        let captured = next_matching(&mut rx, |kind| matches!(kind, SupervisorEventKind::SessionCaptured { .. })).await;
        assert_eq!(
            captured.kind,
            SupervisorEventKind::SessionCaptured {
                agent_session_id: "sess-77".to_string()
            }
        );
        let session = h.manager.session("term-1").expect("load").expect("row");
        assert!(session.agent_mode);
        assert_eq!(session.agent_session_id.as_deref(), Some("sess-77"));

        assert!(h.manager.invoke_agent("term-1").expect("invoke again").is_none());
        h.manager.destroy("term-1").expect("destroy");
    }
}
