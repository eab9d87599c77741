//! Core types shared by the supervisor, the merge coordinator and the agent
//! output classifiers.

use serde::{Deserialize, Serialize};

/// Identifies the task (or project, for ideation/roadmap runs) a process is
/// supervised under. At most one live process exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey(pub String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Directory name of a spec under the project's spec root (e.g. `001-add-login`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecId(pub String);

impl SpecId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SpecId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique value minted per launch. Lets the exit handler tell an
/// intentionally killed spawn apart from a newer spawn for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpawnToken(pub u64);

impl std::fmt::Display for SpawnToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "spawn-{}", self.0)
    }
}

/// Why a process was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessKind {
    TaskExecution,
    QaProcess,
    SpecCreation,
    Ideation,
    Roadmap,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::TaskExecution => "task-execution",
            ProcessKind::QaProcess => "qa-process",
            ProcessKind::SpecCreation => "spec-creation",
            ProcessKind::Ideation => "ideation",
            ProcessKind::Roadmap => "roadmap",
        }
    }

    /// Status written to the plan artifact once a process of this kind exits,
    /// whatever its exit code. `None` means the exit is informational only.
    pub fn exit_status(self) -> Option<TaskStatus> {
        match self {
            ProcessKind::SpecCreation => None,
            ProcessKind::TaskExecution
            | ProcessKind::QaProcess
            | ProcessKind::Ideation
            | ProcessKind::Roadmap => Some(TaskStatus::HumanReview),
        }
    }

    /// Spec creation runs print a different vocabulary and are classified
    /// with the spec-runner rules.
    pub fn is_spec_runner(self) -> bool {
        matches!(self, ProcessKind::SpecCreation)
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('_', "-").as_str() {
            "task-execution" | "task" => Ok(ProcessKind::TaskExecution),
            "qa-process" | "qa" => Ok(ProcessKind::QaProcess),
            "spec-creation" | "spec" => Ok(ProcessKind::SpecCreation),
            "ideation" => Ok(ProcessKind::Ideation),
            "roadmap" => Ok(ProcessKind::Roadmap),
            other => Err(format!(
                "invalid process kind '{other}'. valid values: task-execution, qa-process, spec-creation, ideation, roadmap"
            )),
        }
    }
}

/// Coarse stage of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    Coding,
    QaReview,
    QaFixing,
    Complete,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Planning => "planning",
            Phase::Coding => "coding",
            Phase::QaReview => "qa_review",
            Phase::QaFixing => "qa_fixing",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task execution progress, mutated only from phase inference results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseState {
    pub phase: Phase,
    pub progress_percent: u8,
    #[serde(default)]
    pub current_subtask: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Task status as stored in the plan artifact.
///
/// Declaration order is the "further along" order used by the
/// non-regression write rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Pending,
    InProgress,
    AiReview,
    HumanReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview => "ai_review",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Done => "done",
        }
    }

    /// Companion `planStatus` value written next to `status`.
    pub fn plan_status(self) -> &'static str {
        match self {
            TaskStatus::Backlog | TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview | TaskStatus::HumanReview => "review",
            TaskStatus::Done => "completed",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Backlog => 0,
            TaskStatus::Pending => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::AiReview => 3,
            TaskStatus::HumanReview => 4,
            TaskStatus::Done => 5,
        }
    }

    /// Rank of a raw status string read from disk. Missing, `idle` and
    /// unrecognised values rank with `backlog`.
    pub fn rank_of_raw(raw: Option<&str>) -> u8 {
        raw.and_then(|value| value.parse::<TaskStatus>().ok())
            .map(TaskStatus::rank)
            .unwrap_or(0)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "backlog" => Ok(TaskStatus::Backlog),
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "ai_review" => Ok(TaskStatus::AiReview),
            "human_review" => Ok(TaskStatus::HumanReview),
            "done" => Ok(TaskStatus::Done),
            other => Err(format!("invalid task status '{other}'")),
        }
    }
}

/// Which output channel of a child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}
