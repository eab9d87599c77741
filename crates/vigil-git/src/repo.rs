use std::path::{Path, PathBuf};

use crate::command::GitCli;
use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub root: PathBuf,
    pub git_dir: PathBuf,
}

pub fn discover_repo(start_path: &Path, git: &GitCli) -> Result<RepoHandle, GitError> {
    let inside = git
        .probe(start_path, ["rev-parse", "--is-inside-work-tree"])?
        .stdout
        .trim()
        .eq("true");

    if !inside {
        return Err(GitError::NotARepository {
            path: start_path.to_path_buf(),
        });
    }

    let root_raw = git.run(start_path, ["rev-parse", "--show-toplevel"])?;
    let root = PathBuf::from(root_raw.stdout.trim());

    let git_dir_raw = git.run(&root, ["rev-parse", "--git-dir"])?;
    let git_dir_rel = PathBuf::from(git_dir_raw.stdout.trim());
    let git_dir = if git_dir_rel.is_absolute() {
        git_dir_rel
    } else {
        root.join(git_dir_rel)
    };

    Ok(RepoHandle { root, git_dir })
}

/// True when the index differs from HEAD, i.e. something is staged.
pub fn has_staged_changes(repo: &RepoHandle, git: &GitCli) -> Result<bool, GitError> {
    let probe = git.probe(&repo.root, ["diff", "--cached", "--quiet"])?;
    match probe.status {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        status => Err(GitError::CommandFailed {
            command: "git diff --cached --quiet".to_string(),
            status,
            stdout: probe.stdout,
            stderr: probe.stderr,
        }),
    }
}

pub fn staged_files(repo: &RepoHandle, git: &GitCli) -> Result<Vec<String>, GitError> {
    let output = git.run(&repo.root, ["diff", "--cached", "--name-only"])?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn branch_exists(repo: &RepoHandle, git: &GitCli, branch: &str) -> Result<bool, GitError> {
    let reference = format!("refs/heads/{branch}");
    let probe = git.probe(&repo.root, ["show-ref", "--verify", "--quiet", reference.as_str()])?;
    Ok(probe.succeeded())
}

/// Whether `branch` is already contained in HEAD. A missing branch is
/// reported as not merged.
pub fn is_branch_merged(repo: &RepoHandle, git: &GitCli, branch: &str) -> Result<bool, GitError> {
    if !branch_exists(repo, git, branch)? {
        return Ok(false);
    }
    let probe = git.probe(&repo.root, ["merge-base", "--is-ancestor", branch, "HEAD"])?;
    match probe.status {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        status => Err(GitError::CommandFailed {
            command: format!("git merge-base --is-ancestor {branch} HEAD"),
            status,
            stdout: probe.stdout,
            stderr: probe.stderr,
        }),
    }
}
