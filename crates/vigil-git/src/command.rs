use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Result of a git invocation whose exit code carries the answer
/// (`diff --quiet`, `merge-base --is-ancestor`, `show-ref --verify`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitProbe {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitProbe {
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run git and fail on a non-zero exit.
    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (rendered, output) = self.exec(cwd, args)?;
        let stdout = decode(&rendered, "stdout", output.stdout)?;
        let stderr = decode(&rendered, "stderr", output.stderr)?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(GitOutput { stdout, stderr })
    }

    /// Run git and hand back the exit status instead of failing on it. Only
    /// a failure to start the binary is an error.
    pub fn probe<I, S>(&self, cwd: &Path, args: I) -> Result<GitProbe, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (_, output) = self.exec(cwd, args)?;
        Ok(GitProbe {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn exec<I, S>(&self, cwd: &Path, args: I) -> Result<(String, Output), GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        command.current_dir(cwd).args(&owned_args);

        let rendered = render_command(&self.binary, &owned_args);
        let output = command.output().map_err(|source| GitError::Io {
            command: rendered.clone(),
            source,
        })?;
        Ok((rendered, output))
    }
}

fn decode(command: &str, stream: &'static str, bytes: Vec<u8>) -> Result<String, GitError> {
    String::from_utf8(bytes).map_err(|source| GitError::NonUtf8Output {
        command: command.to_string(),
        stream,
        source,
    })
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::GitCli;
    use crate::error::GitError;

    #[test]
    fn run_returns_stdout_for_successful_command() {
        let git = GitCli::default();
        let cwd = tempfile::tempdir().expect("tempdir");

        let output = git
            .run(cwd.path(), ["--version"])
            .expect("git --version should succeed");

        assert!(output.stdout.to_ascii_lowercase().contains("git version"));
    }

    #[test]
    fn run_classifies_non_zero_exit_as_command_failed() {
        let git = GitCli::default();
        let cwd = tempfile::tempdir().expect("tempdir");

        let err = git
            .run(cwd.path(), ["definitely-not-a-real-git-subcommand"])
            .expect_err("unknown git subcommand should fail");
        match err {
            GitError::CommandFailed {
                command, status, ..
            } => {
                assert!(command.contains("definitely-not-a-real-git-subcommand"));
                assert!(status.is_some());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn probe_reports_non_zero_exit_without_error() {
        let git = GitCli::default();
        let cwd = tempfile::tempdir().expect("tempdir");

        let probe = git
            .probe(cwd.path(), ["definitely-not-a-real-git-subcommand"])
            .expect("probe should not fail on exit status");
        assert!(!probe.succeeded());
        assert!(probe.status.is_some());
    }

    #[test]
    fn missing_binary_is_io_error_for_both_modes() {
        let git = GitCli::new("/definitely/missing/git-binary");
        let cwd = tempfile::tempdir().expect("tempdir");

        let err = git
            .run(cwd.path(), ["status"])
            .expect_err("missing binary should fail");
        assert!(matches!(
            err,
            GitError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound
        ));

        let err = git
            .probe(cwd.path(), ["status"])
            .expect_err("missing binary should fail probe too");
        assert!(matches!(err, GitError::Io { .. }));
    }
}
