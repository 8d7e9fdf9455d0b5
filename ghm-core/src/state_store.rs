//! Durable condition state
//!
//! Keeps the last-known lifecycle state of every tracked condition in memory
//! and mirrors it to a JSON file. Every write replaces the whole file with
//! write-new-then-swap (a fresh temp file next to it, fsync, rename), so the
//! file on disk is always either the previous or the next complete version.
//! Writes are serialized and numbered; a write that outlives its timeout
//! still finishes in the background but never lands on top of a newer one.
//!
//! A missing or unreadable file at startup is not fatal: the store starts
//! empty and logs a warning.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::condition::{ConditionKey, HealthCondition, LifecycleState};

/// Current on-disk format version
pub const STATE_FILE_VERSION: u32 = 1;

/// Persisted state of one condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStateRecord {
    pub key: ConditionKey,
    pub lifecycle_state: LifecycleState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Enough of the condition to rebuild it after a restart
    pub system: String,
    pub raw_message: String,
    #[serde(default)]
    pub serial: Option<String>,
    /// Event persisted but not yet acknowledged by the connector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<LifecycleState>,
}

impl PersistedStateRecord {
    /// Record a new observation, carrying over the first sighting time and
    /// any unacknowledged event
    pub fn observe(
        previous: Option<&PersistedStateRecord>,
        condition: &HealthCondition,
        state: LifecycleState,
    ) -> Self {
        Self {
            key: condition.key(),
            lifecycle_state: state,
            first_seen_at: previous
                .map(|r| r.first_seen_at)
                .unwrap_or(condition.observed_at),
            last_seen_at: condition.observed_at,
            system: condition.system.clone(),
            raw_message: condition.raw_message.clone(),
            serial: condition.serial.clone(),
            pending: previous.and_then(|r| r.pending),
        }
    }

    /// Rebuild the condition this record tracks
    pub fn to_condition(&self, node_name: &str) -> HealthCondition {
        HealthCondition {
            device_id: self.key.device_id.clone(),
            error_code: self.key.error_code.clone(),
            system: self.system.clone(),
            raw_message: self.raw_message.clone(),
            serial: self.serial.clone(),
            observed_at: self.last_seen_at,
            node_name: node_name.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    records: Vec<PersistedStateRecord>,
}

/// Errors raised while reading or writing the state file
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// IO error
    #[error("State file IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed
    #[error("State file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    /// The file was written by an unknown format version
    #[error("Unsupported state file version {0}")]
    UnsupportedVersion(u32),

    /// Operation timed out
    #[error("State file operation timed out after {0:?}")]
    Timeout(Duration),

    /// The blocking write task panicked or was cancelled
    #[error("State file write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Condition state keyed by device + code
pub struct StateStore {
    path: PathBuf,
    records: HashMap<ConditionKey, PersistedStateRecord>,
    io_timeout: Duration,
    /// Number of the last flush started
    generation: u64,
    /// Number of the last flush that reached the disk
    written: Arc<Mutex<u64>>,
}

impl StateStore {
    /// Open the store, loading existing records.
    ///
    /// Never fails: an absent, unreadable or corrupt file yields an empty
    /// store and a warning.
    pub async fn open(path: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        let path = path.into();
        let records = match Self::load(&path, io_timeout).await {
            Ok(records) => {
                info!(path = ?path, records = records.len(), "Loaded condition state");
                records
            }
            Err(StateStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = ?path, "State file not found, starting with empty state");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "State file unreadable, starting with empty state");
                HashMap::new()
            }
        };

        Self {
            path,
            records,
            io_timeout,
            generation: 0,
            written: Arc::new(Mutex::new(0)),
        }
    }

    async fn load(
        path: &Path,
        io_timeout: Duration,
    ) -> Result<HashMap<ConditionKey, PersistedStateRecord>, StateStoreError> {
        let bytes = tokio::time::timeout(io_timeout, tokio::fs::read(path))
            .await
            .map_err(|_| StateStoreError::Timeout(io_timeout))??;

        let file: StateFile = serde_json::from_slice(&bytes)?;
        if file.version != STATE_FILE_VERSION {
            return Err(StateStoreError::UnsupportedVersion(file.version));
        }

        Ok(file
            .records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &ConditionKey) -> Option<&PersistedStateRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &PersistedStateRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record and persist the store.
    ///
    /// The in-memory state is updated even if persisting fails; the next
    /// successful write carries it to disk.
    pub async fn put(&mut self, record: PersistedStateRecord) -> Result<(), StateStoreError> {
        self.records.insert(record.key.clone(), record);
        self.flush().await
    }

    /// Remove a record and persist the store
    pub async fn delete(
        &mut self,
        key: &ConditionKey,
    ) -> Result<Option<PersistedStateRecord>, StateStoreError> {
        let removed = self.records.remove(key);
        if removed.is_some() {
            self.flush().await?;
        }
        Ok(removed)
    }

    /// Update `last_seen_at` in memory only; written out with the next change
    pub fn touch(&mut self, key: &ConditionKey, seen_at: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(key) {
            record.last_seen_at = seen_at;
        }
    }

    /// Clear a record's pending event once the connector acknowledged it.
    ///
    /// Returns whether anything changed.
    pub async fn settle(&mut self, key: &ConditionKey) -> Result<bool, StateStoreError> {
        let Some(record) = self.records.get_mut(key) else {
            return Ok(false);
        };
        if record.pending.take().is_none() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Atomically replace the state file with the in-memory records
    async fn flush(&mut self) -> Result<(), StateStoreError> {
        let mut records: Vec<&PersistedStateRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        let count = records.len();
        let payload = serde_json::to_vec_pretty(&serde_json::json!({
            "version": STATE_FILE_VERSION,
            "records": records,
        }))?;

        self.generation += 1;
        let generation = self.generation;
        let path = self.path.clone();
        let written = Arc::clone(&self.written);
        let write = tokio::task::spawn_blocking(move || -> Result<(), StateStoreError> {
            let mut last = match written.lock() {
                Ok(last) => last,
                Err(poisoned) => poisoned.into_inner(),
            };
            // A newer flush already reached the disk
            if *last > generation {
                return Ok(());
            }
            write_and_swap(&path, &payload)?;
            *last = generation;
            Ok(())
        });

        tokio::time::timeout(self.io_timeout, write)
            .await
            .map_err(|_| StateStoreError::Timeout(self.io_timeout))???;

        debug!(path = ?self.path, records = count, generation, "Persisted condition state");
        Ok(())
    }
}

fn write_and_swap(path: &Path, payload: &[u8]) -> Result<(), StateStoreError> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".ghm-state-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
