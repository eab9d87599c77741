use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OutputStream, PhaseState, ProcessKind, TaskKey, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitProvider {
    #[default]
    Claude,
    Codex,
    Unknown,
}

impl RateLimitProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitProvider::Claude => "claude",
            RateLimitProvider::Codex => "codex",
            RateLimitProvider::Unknown => "unknown",
        }
    }
}

/// Which quota window was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// Rolling session window (the five hour limit).
    Session,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub key: TaskKey,
    pub process_kind: ProcessKind,
    pub provider: RateLimitProvider,
    pub scope: Option<RateLimitScope>,
    /// Reset time as printed by the agent, e.g. `5pm (Europe/Paris)`.
    pub resets_at: Option<String>,
    pub matched_line: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SupervisorEventKind {
    Log {
        stream: OutputStream,
        line: String,
    },
    Error {
        message: String,
    },
    Progress {
        state: PhaseState,
    },
    Exit {
        code: Option<i32>,
        process_kind: ProcessKind,
        /// Status persisted for this exit, if the kind decides one.
        status: Option<TaskStatus>,
    },
    RateLimit {
        info: RateLimitInfo,
    },
    UnitComplete {
        unit: String,
        count: u32,
    },
    UnitFailed {
        unit: String,
    },
    SessionCaptured {
        agent_session_id: String,
    },
    TerminalOutput {
        data: String,
    },
    TerminalExit {
        code: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorEvent {
    pub at: DateTime<Utc>,
    pub key: TaskKey,
    pub kind: SupervisorEventKind,
}

impl SupervisorEvent {
    pub fn now(key: TaskKey, kind: SupervisorEventKind) -> Self {
        Self {
            at: Utc::now(),
            key,
            kind,
        }
    }
}

pub fn event_name(kind: &SupervisorEventKind) -> &'static str {
    match kind {
        SupervisorEventKind::Log { .. } => "log",
        SupervisorEventKind::Error { .. } => "error",
        SupervisorEventKind::Progress { .. } => "progress",
        SupervisorEventKind::Exit { .. } => "exit",
        SupervisorEventKind::RateLimit { .. } => "rate-limit",
        SupervisorEventKind::UnitComplete { .. } => "unit-complete",
        SupervisorEventKind::UnitFailed { .. } => "unit-failed",
        SupervisorEventKind::SessionCaptured { .. } => "session-captured",
        SupervisorEventKind::TerminalOutput { .. } => "terminal-output",
        SupervisorEventKind::TerminalExit { .. } => "terminal-exit",
    }
}
