//! Drives the agent backend's merge step and decides the resulting status.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use vigil_agents::env::EnvLayers;
use vigil_agents::invocation::{AgentCommand, BackendInvocation};
use vigil_core::config::MergeConfig;
use vigil_core::types::{SpecId, TaskKey, TaskStatus};
use vigil_git::{
    discover_repo, find_spec_worktree, has_staged_changes, is_branch_merged, spec_branch,
    spec_workspace, staged_files, GitCli, GitError, RepoHandle,
};

use crate::output::Utf8ChunkDecoder;
use crate::plan::{self, StatusUpdate, WritePolicy};
use crate::terminate::{exit_code, terminate_child, TerminateError};

const READER_DRAIN: Duration = Duration::from_secs(2);
const CONFLICT_MARKERS: &[&str] = &["conflict", "<<<<<<<"];

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("failed to launch merge process {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for merge process: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Terminate(#[from] TerminateError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("merge preview timed out after {secs}s")]
    PreviewTimedOut { secs: u64 },
    #[error("merge preview failed (exit {code:?}): {message}")]
    PreviewFailed { code: Option<i32>, message: String },
    #[error("merge preview output is not valid JSON: {source}")]
    PreviewParse {
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub key: TaskKey,
    pub spec_id: SpecId,
    /// Main project the spec's changes are merged into.
    pub project_dir: PathBuf,
    /// Stage changes without committing them.
    pub no_commit: bool,
    pub plan_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    Staged,
    AlreadyStaged,
    AlreadyMerged,
    /// Exit 0 with nothing staged and no record of a previous merge.
    NothingStaged,
    /// Timed out, but the output says the work was done.
    BestEffort,
    TimedOut,
    Conflict,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub outcome: MergeOutcome,
    /// Status persisted to the plan, if the outcome decides one.
    pub status: Option<TaskStatus>,
    pub staged: bool,
    pub message: String,
    pub exit_code: Option<i32>,
    /// Index contents when the outcome leaves changes staged.
    pub staged_files: Vec<String>,
    /// Always empty here; see [`MergeCoordinator::preview`] for conflict files.
    pub conflict_files: Vec<String>,
}

impl MergeResult {
    fn new(outcome: MergeOutcome, message: impl Into<String>) -> Self {
        let (success, status, staged) = match outcome {
            MergeOutcome::Merged | MergeOutcome::AlreadyMerged => (true, Some(TaskStatus::Done), false),
            MergeOutcome::Staged | MergeOutcome::AlreadyStaged => {
                (true, Some(TaskStatus::HumanReview), true)
            }
            MergeOutcome::NothingStaged => (false, Some(TaskStatus::HumanReview), false),
            MergeOutcome::BestEffort => (true, Some(TaskStatus::Done), false),
            MergeOutcome::TimedOut | MergeOutcome::Conflict | MergeOutcome::Failed => {
                (false, None, false)
            }
        };
        Self {
            success,
            outcome,
            status,
            staged,
            message: message.into(),
            exit_code: None,
            staged_files: Vec::new(),
            conflict_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePreview {
    pub success: bool,
    pub files_changed: Vec<String>,
    pub conflict_files: Vec<String>,
    pub can_auto_merge: bool,
    /// Worktree currently checked out on the spec branch, if any.
    pub worktree: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSettings {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub success_markers: Vec<String>,
}

impl MergeSettings {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            success_markers: config
                .success_markers
                .iter()
                .map(|marker| marker.to_lowercase())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BoundedRun {
    exit_code: Option<i32>,
    timed_out: bool,
    stdout: String,
    stderr: String,
}

impl BoundedRun {
    fn contains_any(&self, needles: &[impl AsRef<str>]) -> bool {
        let stdout = self.stdout.to_lowercase();
        let stderr = self.stderr.to_lowercase();
        needles.iter().any(|needle| {
            let needle = needle.as_ref();
            stdout.contains(needle) || stderr.contains(needle)
        })
    }
}

#[derive(Debug, Clone)]
pub struct MergeCoordinator {
    invocation: BackendInvocation,
    env: EnvLayers,
    git: GitCli,
    settings: MergeSettings,
}

impl MergeCoordinator {
    pub fn new(invocation: BackendInvocation, env: EnvLayers, git: GitCli, settings: MergeSettings) -> Self {
        Self {
            invocation,
            env,
            git,
            settings,
        }
    }

    pub async fn merge(&self, request: &MergeRequest) -> Result<MergeResult, MergeError> {
        let repo = discover_repo(&request.project_dir, &self.git)?;

        if request.no_commit && has_staged_changes(&repo, &self.git)? {
            info!(key = %request.key, spec = %request.spec_id, "changes already staged; skipping merge process");
            let mut result = MergeResult::new(
                MergeOutcome::AlreadyStaged,
                "Changes are already staged in the project",
            );
            result.staged_files = staged_files(&repo, &self.git)?;
            self.persist(request, &result);
            return Ok(result);
        }

        let command = self.invocation.merge_command(
            &request.project_dir,
            &request.spec_id,
            request.no_commit,
            &self.env,
        );
        info!(key = %request.key, spec = %request.spec_id, no_commit = request.no_commit, "starting merge");
        let run = self.run_bounded(&command).await?;

        let mut result = if run.timed_out {
            self.classify_timeout(&run, request.no_commit)
        } else if run.exit_code == Some(0) {
            if request.no_commit {
                self.verify_staged(&repo, request)?
            } else {
                MergeResult::new(MergeOutcome::Merged, "Changes merged into the project")
            }
        } else if run.contains_any(CONFLICT_MARKERS) {
            MergeResult::new(MergeOutcome::Conflict, "Merge stopped on conflicts")
        } else {
            MergeResult::new(MergeOutcome::Failed, failure_message(&run))
        };
        result.exit_code = run.exit_code;

        info!(key = %request.key, outcome = ?result.outcome, success = result.success, "merge resolved");
        self.persist(request, &result);
        Ok(result)
    }

    pub async fn preview(&self, project_dir: &Path, spec_id: &SpecId) -> Result<MergePreview, MergeError> {
        let command = self
            .invocation
            .merge_preview_command(project_dir, spec_id, &self.env);
        let run = self.run_bounded(&command).await?;
        if run.timed_out {
            return Err(MergeError::PreviewTimedOut {
                secs: self.settings.timeout.as_secs(),
            });
        }

        let mut preview = match parse_preview(&run.stdout) {
            Some(parsed) => parsed.map_err(|source| MergeError::PreviewParse { source })?,
            None => {
                return Err(MergeError::PreviewFailed {
                    code: run.exit_code,
                    message: first_non_empty(&run.stderr, &run.stdout),
                })
            }
        };
        if run.exit_code != Some(0) {
            preview.success = false;
        }

        preview.worktree = discover_repo(project_dir, &self.git)
            .and_then(|repo| find_spec_worktree(&repo, &self.git, spec_id))
            .map_err(|err| debug!(error = %err, "worktree lookup failed"))
            .ok()
            .flatten()
            .map(|worktree| worktree.path)
            .or_else(|| {
                let workspace = spec_workspace(project_dir, spec_id);
                workspace.path.is_dir().then_some(workspace.path)
            });
        Ok(preview)
    }

    /// Exit 0 in stage-only mode is re-checked against the index: a prior
    /// run may already have committed everything. "Already merged" is
    /// decided by ancestry of the spec branch only.
    fn verify_staged(&self, repo: &RepoHandle, request: &MergeRequest) -> Result<MergeResult, MergeError> {
        if has_staged_changes(repo, &self.git)? {
            let mut result = MergeResult::new(
                MergeOutcome::Staged,
                "Changes staged in the project for review",
            );
            result.staged_files = staged_files(repo, &self.git)?;
            return Ok(result);
        }
        if is_branch_merged(repo, &self.git, &spec_branch(&request.spec_id))? {
            return Ok(MergeResult::new(
                MergeOutcome::AlreadyMerged,
                "Nothing to stage; the spec was already merged",
            ));
        }
        warn!(key = %request.key, spec = %request.spec_id, "merge exited 0 but nothing is staged");
        Ok(MergeResult::new(
            MergeOutcome::NothingStaged,
            "Merge reported success but nothing was staged; needs investigation",
        ))
    }

    fn classify_timeout(&self, run: &BoundedRun, no_commit: bool) -> MergeResult {
        let secs = self.settings.timeout.as_secs();
        if run.contains_any(&self.settings.success_markers) {
            warn!(secs, "merge timed out after reporting success");
            let mut result = MergeResult::new(
                MergeOutcome::BestEffort,
                format!("Merge timed out after {secs}s but reported success"),
            );
            if no_commit {
                result.status = Some(TaskStatus::HumanReview);
                result.staged = true;
            }
            result
        } else {
            warn!(secs, "merge timed out");
            MergeResult::new(
                MergeOutcome::TimedOut,
                format!("Merge timed out after {secs}s"),
            )
        }
    }

    fn persist(&self, request: &MergeRequest, result: &MergeResult) {
        let (Some(status), Some(path)) = (result.status, request.plan_path.as_deref()) else {
            return;
        };
        let update = StatusUpdate {
            status,
            staged: result.staged,
        };
        match plan::write_status(path, &update, WritePolicy::UnlessDone, Utc::now()) {
            Ok(outcome) => debug!(key = %request.key, ?outcome, "merge status write"),
            Err(err) => warn!(key = %request.key, error = %err, "merge status write failed"),
        }
    }

    async fn run_bounded(&self, command: &AgentCommand) -> Result<BoundedRun, MergeError> {
        let mut child = Command::new(&command.executable)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MergeError::Launch {
                command: format!("{} {}", command.executable, command.args.join(" ")),
                source,
            })?;

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let mut collectors = Vec::with_capacity(2);
        if let Some(reader) = child.stdout.take() {
            collectors.push(tokio::spawn(collect(reader, Arc::clone(&stdout))));
        }
        if let Some(reader) = child.stderr.take() {
            collectors.push(tokio::spawn(collect(reader, Arc::clone(&stderr))));
        }

        let (status, timed_out) = match tokio::time::timeout(self.settings.timeout, child.wait()).await {
            Ok(waited) => (waited.map_err(|source| MergeError::Wait { source })?, false),
            Err(_) => (terminate_child(&mut child, self.settings.kill_grace).await?, true),
        };

        for collector in collectors {
            let abort = collector.abort_handle();
            if tokio::time::timeout(READER_DRAIN, collector).await.is_err() {
                abort.abort();
            }
        }

        let snapshot = |buffer: &Arc<Mutex<String>>| {
            buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        };
        Ok(BoundedRun {
            exit_code: exit_code(&status),
            timed_out,
            stdout: snapshot(&stdout),
            stderr: snapshot(&stderr),
        })
    }
}

async fn collect<R>(mut reader: R, sink: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8ChunkDecoder::default();
    let mut buf = vec![0u8; 4096];
    loop {
        let (text, done) = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => (decoder.finish(), true),
            Ok(n) => (decoder.decode(&buf[..n]), false),
        };
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(&text);
        if done {
            break;
        }
    }
}

fn failure_message(run: &BoundedRun) -> String {
    let detail = first_non_empty(&run.stderr, &run.stdout);
    if detail.is_empty() {
        format!("Merge failed with exit code {:?}", run.exit_code)
    } else {
        format!("Merge failed: {detail}")
    }
}

fn first_non_empty(primary: &str, fallback: &str) -> String {
    let pick = if primary.trim().is_empty() { fallback } else { primary };
    pick.trim().lines().last().unwrap_or_default().to_string()
}

/// The preview report is the JSON object in stdout; log lines around it are
/// ignored. `None` means no object was printed at all.
fn parse_preview(stdout: &str) -> Option<Result<MergePreview, serde_json::Error>> {
    let start = stdout.find('{')?;
    let end = stdout.rfind('}')?;
    if end < start {
        return None;
    }
    Some(serde_json::from_str::<Value>(&stdout[start..=end]).map(|report| preview_from_report(&report)))
}

fn preview_from_report(report: &Value) -> MergePreview {
    let files_changed = string_list(report, &["files", "filesChanged", "files_changed", "changedFiles"]);
    let conflict_files = string_list(report, &["conflicts", "conflictFiles", "conflict_files"]);
    let can_auto_merge = first_field(report, &["canAutoMerge", "can_auto_merge"])
        .and_then(Value::as_bool)
        .unwrap_or(conflict_files.is_empty());
    MergePreview {
        success: report.get("success").and_then(Value::as_bool).unwrap_or(true),
        files_changed,
        conflict_files,
        can_auto_merge,
        worktree: None,
    }
}

fn first_field<'a>(report: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| report.get(*name))
}

/// Entries may be bare paths or objects carrying `file` / `path`.
fn string_list(report: &Value, names: &[&str]) -> Vec<String> {
    let Some(items) = first_field(report, names).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(path) => Some(path.clone()),
            Value::Object(entry) => entry
                .get("file")
                .or_else(|| entry.get("path"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_preview, preview_from_report};

    #[test]
    fn preview_accepts_objects_and_plain_paths() {
        let preview = preview_from_report(&json!({
            "success": true,
            "files": ["src/a.rs", {"path": "src/b.rs"}],
            "conflicts": [{"file": "src/a.rs", "severity": "high"}]
        }));
        assert_eq!(preview.files_changed, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(preview.conflict_files, vec!["src/a.rs"]);
        assert!(!preview.can_auto_merge);
        assert!(preview.success);
    }

    #[test]
    fn preview_flag_overrides_derived_auto_merge() {
        let preview = preview_from_report(&json!({"conflicts": ["x"], "canAutoMerge": true}));
        assert!(preview.can_auto_merge);
    }

    #[test]
    fn preview_json_is_found_between_log_lines() {
        let stdout = "Analyzing...\n{\"files\": [\"a\"], \"conflicts\": []}\nDone\n";
        let preview = parse_preview(stdout).expect("object").expect("valid json");
        assert_eq!(preview.files_changed, vec!["a"]);
        assert!(preview.can_auto_merge);

        assert!(parse_preview("no report").is_none());
        assert!(parse_preview("{not json}").expect("object").is_err());
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::time::Duration;

    use serde_json::json;
    use vigil_agents::env::EnvLayers;
    use vigil_agents::invocation::BackendInvocation;
    use vigil_core::config::{AgentConfig, MergeConfig};
    use vigil_core::types::{SpecId, TaskKey, TaskStatus};
    use vigil_git::GitCli;

    use super::{MergeCoordinator, MergeOutcome, MergeRequest, MergeSettings};
    use crate::plan::{current_status, read_plan};

    struct Fixture {
        _dir: tempfile::TempDir,
        project: PathBuf,
        backend: PathBuf,
        plan: PathBuf,
    }

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(["-c", "user.name=Test User", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn fixture(script: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("project");
        let backend = dir.path().join("backend");
        fs::create_dir_all(&project).expect("project dir");
        fs::create_dir_all(&backend).expect("backend dir");

        run_git(&project, &["init", "-b", "main"]);
        fs::write(project.join("README.md"), "init\n").expect("write readme");
        run_git(&project, &["add", "README.md"]);
        run_git(&project, &["commit", "-m", "init"]);

        fs::write(backend.join("run.sh"), script).expect("write script");
        let plan = dir.path().join("implementation_plan.json");
        fs::write(&plan, json!({"status": "human_review", "feature": "x"}).to_string())
            .expect("write plan");

        Fixture {
            _dir: dir,
            project,
            backend,
            plan,
        }
    }

    fn coordinator(fixture: &Fixture, timeout: Duration) -> MergeCoordinator {
        let invocation = BackendInvocation::new(AgentConfig {
            interpreter: "sh".to_string(),
            backend_dir: fixture.backend.clone(),
            run_script: "run.sh".to_string(),
            ..AgentConfig::default()
        });
        let mut settings = MergeSettings::from_config(&MergeConfig::default());
        settings.timeout = timeout;
        settings.kill_grace = Duration::from_millis(500);
        MergeCoordinator::new(invocation, EnvLayers::default(), GitCli::default(), settings)
    }

    fn request(fixture: &Fixture, no_commit: bool) -> MergeRequest {
        MergeRequest {
            key: TaskKey::new("task-1"),
            spec_id: SpecId::new("001-login"),
            project_dir: fixture.project.clone(),
            no_commit,
            plan_path: Some(fixture.plan.clone()),
        }
    }

    #[tokio::test]
    async fn already_staged_short_circuits_without_process() {
        let fixture = fixture("touch \"$(dirname \"$0\")/ran\"\n");
        fs::write(fixture.project.join("staged.rs"), "// staged\n").expect("write");
        run_git(&fixture.project, &["add", "staged.rs"]);

        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, true))
            .await
            .expect("merge");

        assert!(result.success);
        assert_eq!(result.outcome, MergeOutcome::AlreadyStaged);
        assert!(!fixture.backend.join("ran").exists());
        assert_eq!(result.staged_files, vec!["staged.rs"]);
        let plan = read_plan(&fixture.plan).expect("read").expect("plan");
        assert_eq!(plan["stagedInMainProject"], true);
    }

    #[tokio::test]
    async fn exit_zero_with_changes_staged_is_staged() {
        let fixture = fixture("cd \"$4\" && echo change > feature.rs && git add feature.rs\n");
        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, true))
            .await
            .expect("merge");

        assert_eq!(result.outcome, MergeOutcome::Staged);
        assert_eq!(result.status, Some(TaskStatus::HumanReview));
        assert!(result.staged);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.staged_files, vec!["feature.rs"]);
    }

    #[tokio::test]
    async fn exit_zero_nothing_staged_but_already_merged_is_done() {
        let fixture = fixture("exit 0\n");
        run_git(&fixture.project, &["checkout", "-b", "vigil/001-login"]);
        fs::write(fixture.project.join("login.rs"), "// login\n").expect("write");
        run_git(&fixture.project, &["add", "login.rs"]);
        run_git(&fixture.project, &["commit", "-m", "add login"]);
        run_git(&fixture.project, &["checkout", "main"]);
        run_git(&fixture.project, &["merge", "--no-ff", "-m", "merge", "vigil/001-login"]);

        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, true))
            .await
            .expect("merge");

        assert!(result.success);
        assert_eq!(result.outcome, MergeOutcome::AlreadyMerged);
        assert_eq!(result.status, Some(TaskStatus::Done));
        assert_eq!(current_status(&fixture.plan).expect("plan").as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn exit_zero_nothing_staged_not_merged_needs_investigation() {
        let fixture = fixture("exit 0\n");
        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, true))
            .await
            .expect("merge");

        assert!(!result.success);
        assert_eq!(result.outcome, MergeOutcome::NothingStaged);
        assert_eq!(result.status, Some(TaskStatus::HumanReview));
    }

    #[tokio::test]
    async fn merge_commit_for_a_longer_spec_id_is_not_this_merge() {
        let fixture = fixture("exit 0\n");
        run_git(&fixture.project, &["checkout", "-b", "vigil/001-login-2fa"]);
        fs::write(fixture.project.join("otp.rs"), "// otp\n").expect("write");
        run_git(&fixture.project, &["add", "otp.rs"]);
        run_git(&fixture.project, &["commit", "-m", "add otp"]);
        run_git(&fixture.project, &["checkout", "main"]);
        run_git(
            &fixture.project,
            &["merge", "--no-ff", "-m", "Merge spec 001-login-2fa", "vigil/001-login-2fa"],
        );

        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, true))
            .await
            .expect("merge");

        assert!(!result.success);
        assert_eq!(result.outcome, MergeOutcome::NothingStaged);
        assert_eq!(result.status, Some(TaskStatus::HumanReview));
        assert_eq!(
            current_status(&fixture.plan).expect("plan").as_deref(),
            Some("human_review")
        );
    }

    #[tokio::test]
    async fn merge_message_without_merged_branch_is_not_already_merged() {
        let fixture = fixture("exit 0\n");
        run_git(
            &fixture.project,
            &["commit", "--allow-empty", "-m", "Merge spec 001-login"],
        );

        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, true))
            .await
            .expect("merge");

        assert_eq!(result.outcome, MergeOutcome::NothingStaged);
    }

    #[tokio::test]
    async fn non_zero_exit_with_conflict_marker_is_conflict() {
        let fixture = fixture("echo 'CONFLICT (content): Merge conflict in src/a.rs'\nexit 1\n");
        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, false))
            .await
            .expect("merge");

        assert!(!result.success);
        assert_eq!(result.outcome, MergeOutcome::Conflict);
        assert!(result.conflict_files.is_empty());
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(
            current_status(&fixture.plan).expect("plan").as_deref(),
            Some("human_review")
        );
    }

    #[tokio::test]
    async fn non_zero_exit_without_marker_is_failure() {
        let fixture = fixture("echo 'boom' >&2\nexit 2\n");
        let result = coordinator(&fixture, Duration::from_secs(30))
            .merge(&request(&fixture, false))
            .await
            .expect("merge");
        assert_eq!(result.outcome, MergeOutcome::Failed);
        assert!(result.message.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_after_success_marker_is_best_effort() {
        let fixture = fixture("echo 'Changes successfully merged'\nexec sleep 30\n");
        let result = coordinator(&fixture, Duration::from_millis(500))
            .merge(&request(&fixture, false))
            .await
            .expect("merge");

        assert!(result.success);
        assert_eq!(result.outcome, MergeOutcome::BestEffort);
        assert!(result.message.contains("timed out"));
        assert_eq!(current_status(&fixture.plan).expect("plan").as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn timeout_without_marker_fails() {
        let fixture = fixture("echo 'resolving...'\nexec sleep 30\n");
        let result = coordinator(&fixture, Duration::from_millis(500))
            .merge(&request(&fixture, false))
            .await
            .expect("merge");

        assert!(!result.success);
        assert_eq!(result.outcome, MergeOutcome::TimedOut);
        assert_eq!(result.status, None);
    }

    #[tokio::test]
    async fn preview_parses_backend_report() {
        let fixture = fixture(
            "echo 'checking'\necho '{\"files\": [\"src/a.rs\"], \"conflicts\": [{\"file\": \"src/a.rs\"}]}'\n",
        );
        let preview = coordinator(&fixture, Duration::from_secs(30))
            .preview(&fixture.project, &SpecId::new("001-login"))
            .await
            .expect("preview");

        assert_eq!(preview.files_changed, vec!["src/a.rs"]);
        assert_eq!(preview.conflict_files, vec!["src/a.rs"]);
        assert!(!preview.can_auto_merge);
        assert_eq!(preview.worktree, None);
    }

    #[tokio::test]
    async fn preview_falls_back_to_spec_workspace_directory() {
        let fixture = fixture("echo '{\"files\": [], \"canAutoMerge\": true}'\n");
        let workspace = fixture.project.join(".vigil/worktrees/001-login");
        fs::create_dir_all(&workspace).expect("workspace dir");

        let preview = coordinator(&fixture, Duration::from_secs(30))
            .preview(&fixture.project, &SpecId::new("001-login"))
            .await
            .expect("preview");

        assert!(preview.can_auto_merge);
        assert_eq!(preview.worktree, Some(workspace));
    }
}
