use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vigil_core::config::AgentConfig;
use vigil_core::types::{ProcessKind, SpecId};

use crate::env::EnvLayers;
use crate::error::AgentError;

/// Fully resolved launch: executable, ordered args, environment, cwd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub kind: ProcessKind,
    pub project_dir: PathBuf,
    pub spec_id: Option<SpecId>,
    /// Free-text task for spec creation.
    pub task_description: Option<String>,
    pub extra_args: Vec<String>,
}

impl AgentRequest {
    pub fn new(kind: ProcessKind, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            project_dir: project_dir.into(),
            spec_id: None,
            task_description: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_spec(mut self, spec_id: SpecId) -> Self {
        self.spec_id = Some(spec_id);
        self
    }

    pub fn with_task_description(mut self, description: impl Into<String>) -> Self {
        self.task_description = Some(description.into());
        self
    }
}

/// Builds argument lists for the agent backend's entry scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInvocation {
    config: AgentConfig,
}

impl BackendInvocation {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn command_for(
        &self,
        request: &AgentRequest,
        env: &EnvLayers,
    ) -> Result<AgentCommand, AgentError> {
        let project = path_arg(&request.project_dir);
        let mut args = match request.kind {
            ProcessKind::TaskExecution | ProcessKind::QaProcess => {
                let spec_id = require_spec(request)?;
                let mut args = self.run_script_args(spec_id, &project);
                args.push(if request.kind == ProcessKind::QaProcess {
                    "--qa".to_string()
                } else {
                    "--auto-continue".to_string()
                });
                args
            }
            ProcessKind::SpecCreation => {
                let description = request
                    .task_description
                    .as_deref()
                    .map(str::trim)
                    .filter(|description| !description.is_empty())
                    .ok_or_else(|| AgentError::InvalidRequest {
                        kind: request.kind,
                        message: "task description must not be empty".to_string(),
                    })?;
                vec![
                    self.script(&self.config.spec_runner_script),
                    "--task".to_string(),
                    description.to_string(),
                    "--project-dir".to_string(),
                    project,
                ]
            }
            ProcessKind::Ideation => vec![
                self.script(&self.config.ideation_script),
                "--project".to_string(),
                project,
            ],
            ProcessKind::Roadmap => vec![
                self.script(&self.config.roadmap_script),
                "--project".to_string(),
                project,
            ],
        };
        args.extend(request.extra_args.iter().cloned());
        Ok(self.command(args, env))
    }

    pub fn merge_command(
        &self,
        project_dir: &Path,
        spec_id: &SpecId,
        no_commit: bool,
        env: &EnvLayers,
    ) -> AgentCommand {
        let mut args = self.run_script_args(spec_id, &path_arg(project_dir));
        args.push("--merge".to_string());
        if no_commit {
            args.push("--no-commit".to_string());
        }
        self.command(args, env)
    }

    pub fn merge_preview_command(
        &self,
        project_dir: &Path,
        spec_id: &SpecId,
        env: &EnvLayers,
    ) -> AgentCommand {
        let mut args = self.run_script_args(spec_id, &path_arg(project_dir));
        args.push("--merge-preview".to_string());
        self.command(args, env)
    }

    fn run_script_args(&self, spec_id: &SpecId, project: &str) -> Vec<String> {
        vec![
            self.script(&self.config.run_script),
            "--spec".to_string(),
            spec_id.0.clone(),
            "--project-dir".to_string(),
            project.to_string(),
        ]
    }

    fn script(&self, name: &str) -> String {
        path_arg(&self.config.backend_dir.join(name))
    }

    fn command(&self, args: Vec<String>, env: &EnvLayers) -> AgentCommand {
        AgentCommand {
            executable: self.config.interpreter.clone(),
            args,
            env: env.build(),
            working_dir: self.config.backend_dir.clone(),
        }
    }
}

fn require_spec(request: &AgentRequest) -> Result<&SpecId, AgentError> {
    request
        .spec_id
        .as_ref()
        .filter(|spec| !spec.0.trim().is_empty())
        .ok_or_else(|| AgentError::InvalidRequest {
            kind: request.kind,
            message: "spec id is required".to_string(),
        })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
