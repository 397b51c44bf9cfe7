//! # Persistence
//!
//! Atomic JSON snapshotting of the three pools and host state, following
//! the teacher's "serialize, write to temp file, rename" pattern (see the
//! storage module's upsert discipline) rather than a database — the spec's
//! persisted representation is a single file, not a store with query needs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::event::Event;
use crate::pool::EventMetadata;

/// One entry of the sending pool as persisted: the event plus its retry
/// count, so a restart resumes retry accounting exactly where it left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSendEntry {
    pub event: Event,
    pub retry_count: u32,
}

/// The full on-disk snapshot (spec §4.6, field-exact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub incoming_events: Vec<Event>,
    pub processing_events: Vec<Event>,
    pub events_to_send: Vec<PersistedSendEntry>,
    pub state: Value,
}

impl Snapshot {
    pub fn from_pools(
        incoming: &[EventMetadata],
        processing: &[EventMetadata],
        sending: &[EventMetadata],
        state: Value,
    ) -> Self {
        Self {
            incoming_events: incoming.iter().map(|m| m.event.clone()).collect(),
            processing_events: processing.iter().map(|m| m.event.clone()).collect(),
            events_to_send: sending
                .iter()
                .map(|m| PersistedSendEntry {
                    event: m.event.clone(),
                    retry_count: m.retry_count,
                })
                .collect(),
            state,
        }
    }
}

/// Writes and loads `Snapshot`s for one configured path.
pub struct PersistenceStore {
    path: PathBuf,
}

impl PersistenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot` to a temp file in the same directory, then rename
    /// over the configured path — the rename is atomic on the same
    /// filesystem, so a crash mid-write never corrupts the previous
    /// snapshot.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "eventmesh-state.json".to_string());
        let tmp_path = dir.join(format!(".{file_name}.tmp"));

        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|e| EngineError::persistence(e.to_string(), tmp_path.display().to_string()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| EngineError::persistence(e.to_string(), self.path.display().to_string()))?;
        Ok(())
    }

    /// Load a snapshot if the configured path exists; returns `Ok(None)`
    /// when there is nothing to rehydrate (first boot).
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::persistence(e.to_string(), self.path.display().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_metadata(ts_offset_us: i64) -> EventMetadata {
        let mut event = Event::new("a", "127.0.0.1", 1, "b", "127.0.0.1", 2, "ping", Value::Null);
        event.timestamp += chrono::Duration::microseconds(ts_offset_us);
        EventMetadata {
            event,
            added_at: chrono::Utc::now(),
            retry_count: 2,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_all_three_pools_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = PersistenceStore::new(&path);

        let incoming = vec![sample_metadata(0)];
        let processing = vec![sample_metadata(1)];
        let sending = vec![sample_metadata(2)];
        let snapshot = Snapshot::from_pools(&incoming, &processing, &sending, json!({"k": "v"}));

        store.save(&snapshot).await.unwrap();
        let loaded = store.load().await.unwrap().expect("snapshot should exist");

        assert_eq!(loaded.incoming_events.len(), 1);
        assert_eq!(loaded.processing_events.len(), 1);
        assert_eq!(loaded.events_to_send.len(), 1);
        assert_eq!(loaded.events_to_send[0].retry_count, 2);
        assert_eq!(loaded.state, json!({"k": "v"}));
    }

    #[tokio::test]
    async fn load_returns_none_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("missing.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = PersistenceStore::new(&path);
        let snapshot = Snapshot::from_pools(&[], &[], &[], json!({}));
        store.save(&snapshot).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["snapshot.json".to_string()]);
    }
}
