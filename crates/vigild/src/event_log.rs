use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;
use vigil_core::events::SupervisorEvent;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only JSONL record of supervisor events: one global file plus one
/// file per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub global_file: PathBuf,
    pub key_dir: PathBuf,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let global_file = root.join("global.jsonl");
        let key_dir = root.join("keys");
        Self {
            root,
            global_file,
            key_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        for dir in [&self.root, &self.key_dir] {
            fs::create_dir_all(dir).map_err(|source| EventLogError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn append(&self, event: &SupervisorEvent) -> Result<(), EventLogError> {
        self.ensure_layout()?;
        let line =
            serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
        append_line(&self.global_file, &line)?;
        append_line(&self.key_log_path(&event.key.0), &line)
    }

    pub fn key_log_path(&self, key: &str) -> PathBuf {
        self.key_dir.join(format!("{}.jsonl", sanitize_file_stem(key)))
    }

    pub fn global_log_path(&self) -> &Path {
        self.global_file.as_path()
    }

    /// Persist everything published on `rx` until the channel closes. Write
    /// failures are logged and skipped.
    pub fn spawn_sink(self, mut rx: broadcast::Receiver<SupervisorEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(err) = self.append(&event) {
                            warn!(error = %err, key = %event.key, "event log append failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event log fell behind; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn sanitize_file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn append_line(path: &Path, line: &str) -> Result<(), EventLogError> {
    let append_err = |source| EventLogError::Append {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(append_err)?;
    file.write_all(line.as_bytes()).map_err(append_err)?;
    file.write_all(b"\n").map_err(append_err)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use vigil_core::events::{SupervisorEvent, SupervisorEventKind};
    use vigil_core::types::TaskKey;

    use super::JsonlEventLog;
    use crate::events::EventBus;

    #[test]
    fn append_writes_global_and_per_key_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path().join("events"));
        let event = SupervisorEvent::now(
            TaskKey::new("proj/task 1"),
            SupervisorEventKind::Error {
                message: "boom".to_string(),
            },
        );

        log.append(&event).expect("append");
        log.append(&event).expect("append again");

        let global = fs::read_to_string(log.global_log_path()).expect("global log");
        assert_eq!(global.lines().count(), 2);
        let per_key_path = log.key_log_path("proj/task 1");
        assert!(per_key_path.ends_with("proj_task_1.jsonl"));
        let per_key = fs::read_to_string(per_key_path).expect("key log");
        let decoded: SupervisorEvent =
            serde_json::from_str(per_key.lines().next().expect("line")).expect("decode");
        assert_eq!(decoded.key, event.key);
    }

    #[tokio::test]
    async fn sink_drains_bus_until_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path());
        let bus = EventBus::default();
        let handle = log.clone().spawn_sink(bus.subscribe());

        bus.emit(
            &TaskKey::new("task-7"),
            SupervisorEventKind::TerminalExit { code: Some(0) },
        );
        drop(bus);
        handle.await.expect("sink task");

        let per_key = fs::read_to_string(log.key_log_path("task-7")).expect("key log");
        assert!(per_key.contains("terminal_exit"));
    }
}
