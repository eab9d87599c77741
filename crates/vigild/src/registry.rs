//! In-memory bookkeeping of live agent processes.
//!
//! The registry never touches the OS: the supervisor owns the child and
//! records its pid here so `stop` can signal it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::types::{ProcessKind, SpawnToken, TaskKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub key: TaskKey,
    pub token: SpawnToken,
    /// Set once the OS process has started.
    pub pid: Option<u32>,
    pub kind: ProcessKind,
    pub working_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("process already registered for {key} ({existing})")]
    Conflict { key: TaskKey, existing: SpawnToken },
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<TaskKey, ProcessRecord>,
    killed: HashSet<SpawnToken>,
}

#[derive(Debug)]
pub struct ProcessRegistry {
    inner: Mutex<RegistryInner>,
    next_token: AtomicU64,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint_spawn_token(&self) -> SpawnToken {
        SpawnToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Fails if a record already exists for the key; the caller must stop
    /// and remove it first.
    pub fn register(&self, record: ProcessRecord) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.records.get(&record.key) {
            return Err(RegistryError::Conflict {
                key: record.key.clone(),
                existing: existing.token,
            });
        }
        inner.records.insert(record.key.clone(), record);
        Ok(())
    }

    /// Mint a token and install the record built from it under one lock,
    /// handing back whatever it displaced. The live record for a key always
    /// carries the newest token minted for that key; the caller stops the
    /// displaced process.
    pub fn replace_fresh<F>(&self, build: F) -> (SpawnToken, Option<ProcessRecord>)
    where
        F: FnOnce(SpawnToken) -> ProcessRecord,
    {
        let mut inner = self.lock();
        let token = self.mint_spawn_token();
        let record = build(token);
        let displaced = inner.records.insert(record.key.clone(), record);
        (token, displaced)
    }

    pub fn get(&self, key: &TaskKey) -> Option<ProcessRecord> {
        self.lock().records.get(key).cloned()
    }

    pub fn delete(&self, key: &TaskKey) -> Option<ProcessRecord> {
        self.lock().records.remove(key)
    }

    /// Remove the record only if it still belongs to `token`. A newer
    /// spawn for the same key is left alone.
    pub fn delete_if_token(&self, key: &TaskKey, token: SpawnToken) -> bool {
        let mut inner = self.lock();
        match inner.records.get(key) {
            Some(record) if record.token == token => {
                inner.records.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn set_pid(&self, key: &TaskKey, token: SpawnToken, pid: u32) -> bool {
        let mut inner = self.lock();
        match inner.records.get_mut(key) {
            Some(record) if record.token == token => {
                record.pid = Some(pid);
                true
            }
            _ => false,
        }
    }

    pub fn mark_killed(&self, token: SpawnToken) {
        self.lock().killed.insert(token);
    }

    /// Consumes the mark: a second call for the same token returns false.
    pub fn was_killed(&self, token: SpawnToken) -> bool {
        self.lock().killed.remove(&token)
    }

    /// Like [`was_killed`](Self::was_killed) but leaves the mark in place.
    pub fn is_marked_killed(&self, token: SpawnToken) -> bool {
        self.lock().killed.contains(&token)
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.lock().records.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
