//! Finds the conversation id the agent CLI assigned to an interactive run.
//!
//! The CLI writes one `<session-id>.jsonl` transcript per conversation under
//! a directory derived from the working path. After an agent is invoked in a
//! terminal we poll that directory for a transcript created after the
//! invocation and take its stem as the id.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use vigil_core::config::SessionConfig;

const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Per-project transcript directory: every non-alphanumeric character of the
/// working path becomes `-`.
pub fn agent_project_dir(projects_root: &Path, working_path: &Path) -> PathBuf {
    let encoded: String = working_path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    projects_root.join(encoded)
}

/// Newest transcript in `dir` modified at or after `started_after`.
pub fn find_session_file(dir: &Path, started_after: DateTime<Utc>) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION) {
                return None;
            }
            let modified: DateTime<Utc> = entry.metadata().ok()?.modified().ok()?.into();
            if modified < started_after {
                return None;
            }
            let stem = path.file_stem()?.to_str()?.to_string();
            Some((modified, stem))
        })
        .max()
        .map(|(_, stem)| stem)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl CapturePolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.capture_initial_delay_ms),
            interval: Duration::from_millis(config.capture_interval_ms),
            max_attempts: config.capture_max_attempts,
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Poll for a transcript until one appears, attempts run out, or
/// `still_wanted` returns false (session destroyed or id already known).
pub async fn capture_session_id<F>(
    dir: PathBuf,
    started_after: DateTime<Utc>,
    policy: CapturePolicy,
    mut still_wanted: F,
) -> Option<String>
where
    F: FnMut() -> bool,
{
    tokio::time::sleep(policy.initial_delay).await;
    for attempt in 1..=policy.max_attempts {
        if !still_wanted() {
            debug!(attempt, "session capture no longer wanted");
            return None;
        }
        if let Some(id) = find_session_file(&dir, started_after) {
            debug!(attempt, session_id = %id, "captured agent session id");
            return Some(id);
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    debug!(dir = %dir.display(), "no agent session transcript appeared");
    None
}
