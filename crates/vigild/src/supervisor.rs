//! Launches agent processes and turns their output into lifecycle events.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_agents::ideation::{parse_stream_signal, StreamSignal};
use vigil_agents::invocation::AgentCommand;
use vigil_agents::phase::infer_phase;
use vigil_agents::progress::{apply_update, is_visible_change};
use vigil_agents::rate_limit::detect_rate_limit;
use vigil_core::config::VigilConfig;
use vigil_core::events::{RateLimitProvider, SupervisorEventKind};
use vigil_core::types::{OutputStream, Phase, PhaseState, ProcessKind, SpawnToken, TaskKey};

use crate::events::EventBus;
use crate::output::{LineAssembler, RollingBuffer, Utf8ChunkDecoder};
use crate::plan::{self, StatusUpdate, WritePolicy};
use crate::registry::{ProcessRecord, ProcessRegistry};
use crate::terminate::{exit_code, send_signal, Signal};

/// Output still buffered in the pipes is drained for at most this long after
/// the process exits. Grandchildren holding the pipe open are abandoned.
const READER_DRAIN: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch {command} for {key}: {source}")]
    Launch {
        key: TaskKey,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub key: TaskKey,
    pub kind: ProcessKind,
    pub command: AgentCommand,
    /// Plan artifact updated on exit and read for subtask progress.
    pub plan_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub rolling_buffer_bytes: usize,
    pub stop_grace: Duration,
    pub fallback_provider: RateLimitProvider,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&VigilConfig::default())
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            rolling_buffer_bytes: config.supervisor.rolling_buffer_bytes,
            stop_grace: Duration::from_millis(config.supervisor.stop_grace_ms),
            fallback_provider: config.agent.provider,
        }
    }
}

#[derive(Debug)]
struct RunState {
    rolling: RollingBuffer,
    phase: PhaseState,
}

/// Everything the stream pumps and exit handler share for one spawn.
#[derive(Debug)]
struct RunContext {
    key: TaskKey,
    token: SpawnToken,
    kind: ProcessKind,
    plan_path: Option<PathBuf>,
    state: Mutex<RunState>,
}

impl RunContext {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    settings: Arc<SupervisorSettings>,
}

impl Supervisor {
    pub fn new(registry: Arc<ProcessRegistry>, events: EventBus, settings: SupervisorSettings) -> Self {
        Self {
            registry,
            events,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Launch `request`, replacing any live process for the same key.
    pub async fn start(&self, request: LaunchRequest) -> Result<SpawnToken, SupervisorError> {
        let LaunchRequest {
            key,
            kind,
            command,
            plan_path,
        } = request;
        let (token, displaced) = self.registry.replace_fresh(|token| ProcessRecord {
            key: key.clone(),
            token,
            pid: None,
            kind,
            working_path: command.working_dir.clone(),
            started_at: Utc::now(),
        });
        if let Some(previous) = displaced {
            info!(key = %key, previous = %previous.token, "replacing live process");
            self.terminate_record(&previous);
        }

        let mut child = match Command::new(&command.executable)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.registry.delete_if_token(&key, token);
                self.registry.was_killed(token);
                let rendered = render_command(&command);
                warn!(key = %key, command = %rendered, error = %source, "launch failed");
                self.events.emit(
                    &key,
                    SupervisorEventKind::Error {
                        message: format!("failed to start {rendered}: {source}"),
                    },
                );
                return Err(SupervisorError::Launch {
                    key,
                    command: rendered,
                    source,
                });
            }
        };

        if let Some(pid) = child.id() {
            self.registry.set_pid(&key, token, pid);
            // `stop` may have raced the spawn before a pid was known.
            if self.registry.is_marked_killed(token) {
                self.signal_with_escalation(token, pid);
            }
            info!(key = %key, token = %token, pid, kind = %kind, "process started");
        }

        let context = Arc::new(RunContext {
            key,
            token,
            kind,
            plan_path,
            state: Mutex::new(RunState {
                rolling: RollingBuffer::new(self.settings.rolling_buffer_bytes),
                phase: PhaseState::default(),
            }),
        });

        let mut pumps: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(self.clone().pump(
                Arc::clone(&context),
                OutputStream::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(self.clone().pump(
                Arc::clone(&context),
                OutputStream::Stderr,
                stderr,
            )));
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            for pump in pumps {
                let abort = pump.abort_handle();
                if tokio::time::timeout(READER_DRAIN, pump).await.is_err() {
                    debug!(key = %context.key, "output reader still open after exit");
                    abort.abort();
                }
            }
            supervisor.handle_exit(&context, status);
        });

        Ok(token)
    }

    /// Intentionally stop the live process for `key`. Its exit is then
    /// reported to nobody. Returns false when nothing was running.
    pub fn stop(&self, key: &TaskKey) -> bool {
        match self.registry.get(key) {
            Some(record) => {
                info!(key = %key, token = %record.token, "stopping process");
                self.terminate_record(&record);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        self.registry
            .keys()
            .iter()
            .filter(|key| self.stop(key))
            .count()
    }

    fn terminate_record(&self, record: &ProcessRecord) {
        self.registry.mark_killed(record.token);
        if let Some(pid) = record.pid {
            self.signal_with_escalation(record.token, pid);
        }
    }

    /// SIGTERM now, SIGKILL after the grace period unless the exit handler
    /// has consumed the killed mark by then.
    fn signal_with_escalation(&self, token: SpawnToken, pid: u32) {
        if let Err(err) = send_signal(pid, Signal::Terminate) {
            warn!(pid, error = %err, "failed to send SIGTERM");
        }
        let registry = Arc::clone(&self.registry);
        let grace = self.settings.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.is_marked_killed(token) {
                debug!(pid, token = %token, "grace period elapsed; sending SIGKILL");
                if let Err(err) = send_signal(pid, Signal::Kill) {
                    warn!(pid, error = %err, "failed to send SIGKILL");
                }
            }
        });
    }

    async fn pump<R>(self, context: Arc<RunContext>, stream: OutputStream, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = Utf8ChunkDecoder::default();
        let mut lines = LineAssembler::new(self.settings.rolling_buffer_bytes);
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() {
                        let complete = lines.push(&text);
                        self.handle_chunk(&context, stream, &text, complete);
                    }
                }
                Err(err) => {
                    warn!(key = %context.key, ?stream, error = %err, "output read failed");
                    break;
                }
            }
        }

        let tail = decoder.finish();
        let mut rest = if tail.is_empty() { Vec::new() } else { lines.push(&tail) };
        rest.extend(lines.finish());
        if !tail.is_empty() || !rest.is_empty() {
            self.handle_chunk(&context, stream, &tail, rest);
        }
    }

    fn handle_chunk(&self, context: &RunContext, stream: OutputStream, chunk: &str, lines: Vec<String>) {
        for line in &lines {
            self.events.emit(
                &context.key,
                SupervisorEventKind::Log {
                    stream,
                    line: line.clone(),
                },
            );
        }

        if matches!(context.kind, ProcessKind::Ideation | ProcessKind::Roadmap) {
            for signal in lines.iter().filter_map(|line| parse_stream_signal(line)) {
                self.handle_stream_signal(context, signal);
            }
        }

        let current = {
            let mut state = context.state();
            state.rolling.push(chunk);
            state.phase.phase
        };

        let Some(mut update) = infer_phase(chunk, current, context.kind.is_spec_runner()) else {
            return;
        };
        if update.phase == Phase::Coding && update.sub_progress.is_none() {
            update.sub_progress = context.plan_path.as_deref().and_then(plan::plan_sub_progress);
        }

        let changed = {
            let mut state = context.state();
            let next = apply_update(&state.phase, &update);
            let visible = is_visible_change(&state.phase, &next);
            state.phase = next.clone();
            visible.then_some(next)
        };
        if let Some(state) = changed {
            debug!(key = %context.key, phase = %state.phase, progress = state.progress_percent, "phase changed");
            self.events
                .emit(&context.key, SupervisorEventKind::Progress { state });
        }
    }

    fn handle_stream_signal(&self, context: &RunContext, signal: StreamSignal) {
        match signal {
            StreamSignal::UnitComplete { unit, count } => self
                .events
                .emit(&context.key, SupervisorEventKind::UnitComplete { unit, count }),
            StreamSignal::UnitFailed { unit } => self
                .events
                .emit(&context.key, SupervisorEventKind::UnitFailed { unit }),
            StreamSignal::Progress { percent } => {
                let changed = {
                    let mut state = context.state();
                    let phase = match state.phase.phase {
                        Phase::Idle => Phase::Planning,
                        other => other,
                    };
                    let next = PhaseState {
                        phase,
                        progress_percent: percent,
                        current_subtask: None,
                        message: format!("{percent}% complete"),
                    };
                    let visible = is_visible_change(&state.phase, &next);
                    state.phase = next.clone();
                    visible.then_some(next)
                };
                if let Some(state) = changed {
                    self.events
                        .emit(&context.key, SupervisorEventKind::Progress { state });
                }
            }
        }
    }

    fn handle_exit(&self, context: &RunContext, status: std::io::Result<ExitStatus>) {
        let code = match status {
            Ok(status) => exit_code(&status),
            Err(err) => {
                warn!(key = %context.key, error = %err, "failed to wait for process");
                None
            }
        };

        // The killed check runs before any other exit side effect.
        if self.registry.was_killed(context.token) {
            self.registry.delete_if_token(&context.key, context.token);
            info!(key = %context.key, token = %context.token, ?code, "stopped process exited");
            return;
        }
        self.registry.delete_if_token(&context.key, context.token);

        if code != Some(0) {
            let recent = context.state().rolling.as_str().to_string();
            if let Some(detection) = detect_rate_limit(&recent, self.settings.fallback_provider) {
                warn!(key = %context.key, provider = detection.provider.as_str(), "rate limit detected");
                self.events.emit(
                    &context.key,
                    SupervisorEventKind::RateLimit {
                        info: detection.into_info(context.key.clone(), context.kind),
                    },
                );
            }
        }

        let status = context.kind.exit_status();
        if let (Some(status), Some(path)) = (status, context.plan_path.as_deref()) {
            match plan::write_status(path, &StatusUpdate::new(status), WritePolicy::IfAdvances, Utc::now()) {
                Ok(outcome) => debug!(key = %context.key, ?outcome, "plan status write"),
                Err(err) => warn!(key = %context.key, error = %err, "plan status write failed"),
            }
        }

        info!(key = %context.key, ?code, kind = %context.kind, "process exited");
        self.events.emit(
            &context.key,
            SupervisorEventKind::Exit {
                code,
                process_kind: context.kind,
                status,
            },
        );
    }
}

fn render_command(command: &AgentCommand) -> String {
    let mut rendered = command.executable.clone();
    for arg in &command.args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}
