use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vigil_core::types::SpecId;

use crate::command::GitCli;
use crate::error::GitError;
use crate::repo::RepoHandle;

pub const DEFAULT_WORKTREE_ROOT: &str = ".vigil/worktrees";
pub const SPEC_BRANCH_PREFIX: &str = "vigil/";

/// Isolated workspace an agent builds a spec in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecWorkspace {
    pub spec_id: SpecId,
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

pub fn spec_branch(spec_id: &SpecId) -> String {
    format!("{SPEC_BRANCH_PREFIX}{}", spec_id.0)
}

pub fn spec_workspace(project_root: &Path, spec_id: &SpecId) -> SpecWorkspace {
    SpecWorkspace {
        spec_id: spec_id.clone(),
        branch: spec_branch(spec_id),
        path: project_root.join(DEFAULT_WORKTREE_ROOT).join(&spec_id.0),
    }
}

pub fn list_worktrees(repo: &RepoHandle, git: &GitCli) -> Result<Vec<ListedWorktree>, GitError> {
    let output = git.run(&repo.root, ["worktree", "list", "--porcelain"])?;
    parse_worktree_list(&output.stdout)
}

/// Worktree currently checked out on the spec's branch, if any.
pub fn find_spec_worktree(
    repo: &RepoHandle,
    git: &GitCli,
    spec_id: &SpecId,
) -> Result<Option<ListedWorktree>, GitError> {
    let branch = spec_branch(spec_id);
    Ok(list_worktrees(repo, git)?
        .into_iter()
        .find(|worktree| worktree.branch.as_deref() == Some(branch.as_str())))
}

fn parse_worktree_list(raw: &str) -> Result<Vec<ListedWorktree>, GitError> {
    let mut listed = Vec::new();
    let mut current: Option<ListedWorktree> = None;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(done) = current.take() {
                listed.push(done);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            current = Some(ListedWorktree {
                path: PathBuf::from(rest.trim()),
                branch: None,
                head: None,
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            return Err(GitError::Parse {
                context: format!("attribute before worktree line: {line}"),
            });
        };
        if let Some(rest) = line.strip_prefix("branch ") {
            entry.branch = Some(rest.trim().trim_start_matches("refs/heads/").to_string());
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            entry.head = Some(rest.trim().to_string());
        }
    }

    Ok(listed)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use vigil_core::types::SpecId;

    use super::{parse_worktree_list, spec_branch, spec_workspace};
    use crate::error::GitError;

    #[test]
    fn spec_workspace_lives_under_vigil_worktrees() {
        let spec = SpecId::new("003-dark-mode");
        let workspace = spec_workspace(Path::new("/repo"), &spec);
        assert_eq!(workspace.branch, "vigil/003-dark-mode");
        assert_eq!(
            workspace.path,
            PathBuf::from("/repo/.vigil/worktrees/003-dark-mode")
        );
        assert_eq!(spec_branch(&spec), workspace.branch);
    }

    #[test]
    fn parses_porcelain_listing() {
        let raw = "worktree /repo\nHEAD 1111\nbranch refs/heads/main\n\nworktree /repo/.vigil/worktrees/001\nHEAD 2222\nbranch refs/heads/vigil/001\n\nworktree /repo/detached\nHEAD 3333\ndetached\n";
        let listed = parse_worktree_list(raw).expect("parse listing");

        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].branch.as_deref(), Some("main"));
        assert_eq!(listed[1].branch.as_deref(), Some("vigil/001"));
        assert_eq!(listed[1].head.as_deref(), Some("2222"));
        assert_eq!(listed[2].branch, None);
    }

    #[test]
    fn attribute_without_worktree_is_a_parse_error() {
        let err = parse_worktree_list("HEAD 1111\n").expect_err("orphan attribute");
        assert!(matches!(err, GitError::Parse { .. }));
    }

    #[test]
    fn empty_listing_is_empty() {
        assert!(parse_worktree_list("").expect("empty").is_empty());
    }
}
