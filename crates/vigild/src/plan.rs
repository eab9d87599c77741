//! Reads and writes the shared `implementation_plan.json` artifact.
//!
//! The agent owns the document. We only touch `status`, `planStatus`,
//! `updated_at`, `stagedAt` and `stagedInMainProject`, keep every other
//! field as found, and never move a status backwards.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use vigil_core::types::{SpecId, TaskStatus};

pub const PLAN_FILE_NAME: &str = "implementation_plan.json";
pub const DEFAULT_SPECS_DIR: &str = ".auto-claude/specs";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("plan {path} is not a JSON object")]
    NotAnObject { path: PathBuf },
    #[error("failed to serialize plan: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write plan {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// When a status write is allowed to replace what is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Only when the new status ranks strictly above the current one.
    IfAdvances,
    /// Always, unless the plan is already `done`.
    UnlessDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    /// Marks the changes as staged in the main project.
    pub staged: bool,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            staged: false,
        }
    }

    pub fn staged(status: TaskStatus) -> Self {
        Self {
            status,
            staged: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Skipped { current: Option<String> },
    /// No plan file exists; nothing was created.
    Missing,
}

pub fn spec_plan_path(project_dir: &Path, spec_id: &SpecId) -> PathBuf {
    project_dir
        .join(DEFAULT_SPECS_DIR)
        .join(&spec_id.0)
        .join(PLAN_FILE_NAME)
}

pub fn read_plan(path: &Path) -> Result<Option<Map<String, Value>>, PlanError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PlanError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let value: Value = serde_json::from_str(&raw).map_err(|source| PlanError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(PlanError::NotAnObject {
            path: path.to_path_buf(),
        }),
    }
}

pub fn current_status(path: &Path) -> Result<Option<String>, PlanError> {
    Ok(read_plan(path)?.and_then(|plan| raw_status(&plan)))
}

pub fn write_status(
    path: &Path,
    update: &StatusUpdate,
    policy: WritePolicy,
    now: DateTime<Utc>,
) -> Result<WriteOutcome, PlanError> {
    let Some(mut plan) = read_plan(path)? else {
        return Ok(WriteOutcome::Missing);
    };
    let current = raw_status(&plan);
    if !allows(policy, current.as_deref(), update.status) {
        return Ok(WriteOutcome::Skipped { current });
    }

    let stamp = now.to_rfc3339();
    plan.insert("status".to_string(), Value::from(update.status.as_str()));
    plan.insert(
        "planStatus".to_string(),
        Value::from(update.status.plan_status()),
    );
    plan.insert("updated_at".to_string(), Value::from(stamp.clone()));
    if update.staged {
        plan.insert("stagedInMainProject".to_string(), Value::Bool(true));
        plan.insert("stagedAt".to_string(), Value::from(stamp));
    }

    write_atomic(path, &Value::Object(plan))?;
    Ok(WriteOutcome::Written)
}

fn allows(policy: WritePolicy, current: Option<&str>, next: TaskStatus) -> bool {
    match policy {
        WritePolicy::IfAdvances => next.rank() > TaskStatus::rank_of_raw(current),
        WritePolicy::UnlessDone => {
            current.and_then(|raw| raw.parse::<TaskStatus>().ok()) != Some(TaskStatus::Done)
        }
    }
}

fn raw_status(plan: &Map<String, Value>) -> Option<String> {
    plan.get("status").and_then(Value::as_str).map(str::to_string)
}

fn write_atomic(path: &Path, plan: &Value) -> Result<(), PlanError> {
    let mut body =
        serde_json::to_string_pretty(plan).map_err(|source| PlanError::Serialize { source })?;
    body.push('\n');

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| PLAN_FILE_NAME.to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    let write_err = |source| PlanError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, body).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)
}

/// `(completed, total)` subtasks across all phases. Older plans keep their
/// work items under `chunks` instead of `subtasks`.
pub fn subtask_counts(plan: &Map<String, Value>) -> Option<(usize, usize)> {
    let phases = plan.get("phases")?.as_array()?;
    let mut completed = 0;
    let mut total = 0;
    for phase in phases {
        let items = phase
            .get("subtasks")
            .or_else(|| phase.get("chunks"))
            .and_then(Value::as_array);
        for item in items.into_iter().flatten() {
            total += 1;
            if item.get("status").and_then(Value::as_str) == Some("completed") {
                completed += 1;
            }
        }
    }
    (total > 0).then_some((completed, total))
}

/// Subtask completion percentage read from the plan on disk. Unreadable
/// plans count as unknown.
pub fn plan_sub_progress(path: &Path) -> Option<u8> {
    let plan = read_plan(path).ok().flatten()?;
    let (completed, total) = subtask_counts(&plan)?;
    vigil_agents::progress::fraction_percent(completed, total)
}
