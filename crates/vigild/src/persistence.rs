use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Persisted state of an interactive terminal. Survives process exit; only
/// an explicit delete removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub id: String,
    pub title: String,
    pub working_path: PathBuf,
    pub project_path: Option<PathBuf>,
    /// Whether the terminal is running the agent CLI interactively.
    pub agent_mode: bool,
    pub agent_session_id: Option<String>,
    pub output_buffer: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl TerminalSession {
    pub fn new(id: impl Into<String>, working_path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            working_path: working_path.into(),
            project_path: None,
            agent_mode: false,
            agent_session_id: None,
            output_buffer: String::new(),
            created_at: now,
            last_active_at: now,
        }
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS terminal_sessions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    working_path TEXT NOT NULL,
    project_path TEXT,
    agent_mode INTEGER NOT NULL DEFAULT 0,
    agent_session_id TEXT,
    output_buffer TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_terminal_sessions_project ON terminal_sessions(project_path);
CREATE INDEX IF NOT EXISTS idx_terminal_sessions_active ON terminal_sessions(last_active_at);
"#,
        )?;
        Ok(())
    }

    pub fn upsert_session(&self, session: &TerminalSession) -> Result<(), PersistenceError> {
        self.conn.execute(
            r#"
INSERT INTO terminal_sessions (
    id, title, working_path, project_path, agent_mode, agent_session_id,
    output_buffer, created_at, last_active_at
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT(id) DO UPDATE SET
  title = excluded.title,
  working_path = excluded.working_path,
  project_path = excluded.project_path,
  agent_mode = excluded.agent_mode,
  agent_session_id = excluded.agent_session_id,
  output_buffer = excluded.output_buffer,
  last_active_at = excluded.last_active_at
"#,
            params![
                session.id,
                session.title,
                session.working_path.to_string_lossy(),
                session
                    .project_path
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
                session.agent_mode,
                session.agent_session_id,
                session.output_buffer,
                session.created_at.to_rfc3339(),
                session.last_active_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self, id: &str) -> Result<Option<TerminalSession>, PersistenceError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM terminal_sessions WHERE id = ?1"),
                params![id],
                RawSession::from_row,
            )
            .optional()?;
        raw.map(RawSession::into_session).transpose()
    }

    /// Most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<TerminalSession>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM terminal_sessions ORDER BY last_active_at DESC, id ASC"
        ))?;
        let rows = stmt.query_map([], RawSession::from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }

    pub fn delete_session(&self, id: &str) -> Result<bool, PersistenceError> {
        let removed = self
            .conn
            .execute("DELETE FROM terminal_sessions WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn update_title(&self, id: &str, title: &str, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
        self.update(
            "UPDATE terminal_sessions SET title = ?2, last_active_at = ?3 WHERE id = ?1",
            params![id, title, at.to_rfc3339()],
        )
    }

    pub fn update_agent_mode(&self, id: &str, agent_mode: bool, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
        self.update(
            "UPDATE terminal_sessions SET agent_mode = ?2, last_active_at = ?3 WHERE id = ?1",
            params![id, agent_mode, at.to_rfc3339()],
        )
    }

    pub fn set_agent_session_id(
        &self,
        id: &str,
        agent_session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.update(
            "UPDATE terminal_sessions SET agent_session_id = ?2, last_active_at = ?3 WHERE id = ?1",
            params![id, agent_session_id, at.to_rfc3339()],
        )
    }

    pub fn update_output(&self, id: &str, output: &str, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
        self.update(
            "UPDATE terminal_sessions SET output_buffer = ?2, last_active_at = ?3 WHERE id = ?1",
            params![id, output, at.to_rfc3339()],
        )
    }

    fn update(&self, sql: &str, params: impl rusqlite::Params) -> Result<bool, PersistenceError> {
        Ok(self.conn.execute(sql, params)? > 0)
    }
}

const SESSION_COLUMNS: &str = "id, title, working_path, project_path, agent_mode, agent_session_id, \
     output_buffer, created_at, last_active_at";

struct RawSession {
    id: String,
    title: String,
    working_path: String,
    project_path: Option<String>,
    agent_mode: bool,
    agent_session_id: Option<String>,
    output_buffer: String,
    created_at: String,
    last_active_at: String,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            working_path: row.get(2)?,
            project_path: row.get(3)?,
            agent_mode: row.get(4)?,
            agent_session_id: row.get(5)?,
            output_buffer: row.get(6)?,
            created_at: row.get(7)?,
            last_active_at: row.get(8)?,
        })
    }

    fn into_session(self) -> Result<TerminalSession, PersistenceError> {
        Ok(TerminalSession {
            created_at: parse_timestamp(&self.created_at)?,
            last_active_at: parse_timestamp(&self.last_active_at)?,
            id: self.id,
            title: self.title,
            working_path: PathBuf::from(self.working_path),
            project_path: self.project_path.map(PathBuf::from),
            agent_mode: self.agent_mode,
            agent_session_id: self.agent_session_id,
            output_buffer: self.output_buffer,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|source| PersistenceError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rusqlite::params;
    use std::path::PathBuf;

    use super::{PersistenceError, SqliteStore, TerminalSession};

    fn mk_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open sqlite");
        store.migrate().expect("migrate");
        store
    }

    fn mk_session(id: &str, minutes: i64) -> TerminalSession {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("time")
            + Duration::minutes(minutes);
        TerminalSession::new(id, "/work/app", at)
    }

    #[test]
    fn upsert_and_load_session_roundtrip() {
        let store = mk_store();
        let mut session = mk_session("term-1", 0);
        session.project_path = Some(PathBuf::from("/work"));
        session.output_buffer = "$ ls\r\nsrc\r\n".to_string();
        store.upsert_session(&session).expect("upsert");

        let loaded = store.load_session("term-1").expect("load").expect("exists");
        assert_eq!(loaded, session);
        assert!(store.load_session("missing").expect("load").is_none());
    }

    #[test]
    fn upsert_keeps_original_creation_time() {
        let store = mk_store();
        let session = mk_session("term-1", 0);
        store.upsert_session(&session).expect("insert");

        let mut later = mk_session("term-1", 30);
        later.title = "renamed".to_string();
        store.upsert_session(&later).expect("update");

        let loaded = store.load_session("term-1").expect("load").expect("exists");
        assert_eq!(loaded.created_at, session.created_at);
        assert_eq!(loaded.last_active_at, later.last_active_at);
        assert_eq!(loaded.title, "renamed");
    }

    #[test]
    fn field_updates_touch_only_their_column() {
        let store = mk_store();
        store.upsert_session(&mk_session("term-1", 0)).expect("upsert");
        let at = mk_session("x", 5).created_at;

        assert!(store.update_title("term-1", "api", at).expect("title"));
        assert!(store.update_agent_mode("term-1", true, at).expect("mode"));
        assert!(store.set_agent_session_id("term-1", "abc-123", at).expect("session id"));
        assert!(store.update_output("term-1", "hello", at).expect("output"));
        assert!(!store.update_title("missing", "x", at).expect("missing row"));

        let loaded = store.load_session("term-1").expect("load").expect("exists");
        assert_eq!(loaded.title, "api");
        assert!(loaded.agent_mode);
        assert_eq!(loaded.agent_session_id.as_deref(), Some("abc-123"));
        assert_eq!(loaded.output_buffer, "hello");
        assert_eq!(loaded.last_active_at, at);
    }

    #[test]
    fn list_sessions_orders_by_last_activity() {
        let store = mk_store();
        store.upsert_session(&mk_session("old", 0)).expect("upsert");
        store.upsert_session(&mk_session("new", 10)).expect("upsert");
        store.upsert_session(&mk_session("mid", 5)).expect("upsert");

        let ids: Vec<String> = store
            .list_sessions()
            .expect("list")
            .into_iter()
            .map(|session| session.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn delete_session_reports_whether_a_row_was_removed() {
        let store = mk_store();
        store.upsert_session(&mk_session("term-1", 0)).expect("upsert");
        assert!(store.delete_session("term-1").expect("delete"));
        assert!(!store.delete_session("term-1").expect("delete again"));
        assert!(store.list_sessions().expect("list").is_empty());
    }

    #[test]
    fn corrupt_timestamp_is_reported() {
        let store = mk_store();
        store
            .conn
            .execute(
                "INSERT INTO terminal_sessions (id, title, working_path, created_at, last_active_at) \
                 VALUES (?1, ?1, '/w', 'yesterday', 'yesterday')",
                params!["bad"],
            )
            .expect("insert raw row");
        let err = store.load_session("bad").expect_err("bad timestamp");
        assert!(matches!(err, PersistenceError::TimestampParse { value, .. } if value == "yesterday"));
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.sqlite");
        let store = SqliteStore::open(&path).expect("open");
        store.migrate().expect("migrate");
        assert!(path.exists());
    }
}
