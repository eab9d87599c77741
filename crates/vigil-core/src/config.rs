//! Configuration for the supervisor daemon and CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::events::RateLimitProvider;

pub const DEFAULT_CONFIG_PATH: &str = ".vigil/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VigilConfig {
    pub agent: AgentConfig,
    pub supervisor: SupervisorConfig,
    pub merge: MergeConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    /// Project-level environment, layered above the system environment.
    pub env: BTreeMap<String, String>,
}

/// Where the agent backend lives and how it is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub interpreter: String,
    pub backend_dir: PathBuf,
    pub run_script: String,
    pub spec_runner_script: String,
    pub ideation_script: String,
    pub roadmap_script: String,
    /// Provider assumed when rate-limit output does not name one.
    pub provider: RateLimitProvider,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            backend_dir: PathBuf::from("auto-claude"),
            run_script: "run.py".to_string(),
            spec_runner_script: "runners/spec_runner.py".to_string(),
            ideation_script: "runners/ideation_runner.py".to_string(),
            roadmap_script: "runners/roadmap_runner.py".to_string(),
            provider: RateLimitProvider::Claude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Size of the rolling output window scanned for rate limits.
    pub rolling_buffer_bytes: usize,
    /// How long `stop` waits after SIGTERM before SIGKILL.
    pub stop_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            rolling_buffer_bytes: 10 * 1024,
            stop_grace_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub timeout_secs: u64,
    pub kill_grace_secs: u64,
    /// Phrases that indicate the merge did its work even if the process hung.
    pub success_markers: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            kill_grace_secs: 5,
            success_markers: vec![
                "successfully merged".to_string(),
                "changes added to your project".to_string(),
                "staged".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub capture_initial_delay_ms: u64,
    pub capture_interval_ms: u64,
    pub capture_max_attempts: u32,
    /// Root of the agent CLI's per-project session store. Defaults to
    /// `$HOME/.claude/projects` when unset.
    pub agent_projects_dir: Option<PathBuf>,
    pub output_buffer_bytes: usize,
    pub shell: Option<String>,
    pub agent_command: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_initial_delay_ms: 2_000,
            capture_interval_ms: 1_000,
            capture_max_attempts: 10,
            agent_projects_dir: None,
            output_buffer_bytes: 100_000,
            shell: None,
            agent_command: "claude".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn resolved_agent_projects_dir(&self) -> Option<PathBuf> {
        self.agent_projects_dir.clone().or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".claude").join("projects"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
    pub event_log_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from(".vigil/state.sqlite"),
            event_log_root: PathBuf::from(".vigil/events"),
        }
    }
}

pub fn parse_config(contents: &str) -> Result<VigilConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<VigilConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<VigilConfig, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(VigilConfig::default());
    }
    load_config(path_ref)
}

pub fn save_config(path: impl AsRef<Path>, config: &VigilConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    let parent = path_ref.parent().map(Path::to_path_buf);
    if let Some(parent_dir) = parent {
        fs::create_dir_all(&parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir,
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse_config("").expect("parse empty config");
        assert_eq!(config, VigilConfig::default());
        assert_eq!(config.supervisor.rolling_buffer_bytes, 10_240);
        assert_eq!(config.merge.timeout_secs, 120);
        assert_eq!(config.session.capture_max_attempts, 10);
        assert_eq!(config.session.capture_initial_delay_ms, 2_000);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = parse_config(
            r#"
[agent]
interpreter = "/opt/venv/bin/python"
provider = "codex"

[merge]
timeout_secs = 30

[env]
ANTHROPIC_BASE_URL = "http://localhost:8080"
"#,
        )
        .expect("parse config");

        assert_eq!(config.agent.interpreter, "/opt/venv/bin/python");
        assert_eq!(config.agent.provider, RateLimitProvider::Codex);
        assert_eq!(config.agent.run_script, "run.py");
        assert_eq!(config.merge.timeout_secs, 30);
        assert_eq!(config.merge.kill_grace_secs, 5);
        assert_eq!(
            config.env.get("ANTHROPIC_BASE_URL").map(String::as_str),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let mut config = VigilConfig::default();
        config.session.agent_projects_dir = Some(PathBuf::from("/tmp/projects"));
        config.env.insert("FOO".to_string(), "bar".to_string());

        save_config(&path, &config).expect("save config");
        let loaded = load_config(&path).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_classifies_read_and_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        let err = load_config(&missing).expect_err("missing file should fail");
        assert!(matches!(err, ConfigError::Read { path, .. } if path == missing));

        let invalid = dir.path().join("invalid.toml");
        fs::write(&invalid, "[merge\ntimeout_secs = ").expect("write invalid config");
        let err = load_config(&invalid).expect_err("invalid config should fail");
        assert!(matches!(err, ConfigError::Parse { path, .. } if path == invalid));
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            load_config_or_default(dir.path().join("absent.toml")).expect("defaults for missing");
        assert_eq!(config, VigilConfig::default());
    }
}
