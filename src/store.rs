//! Persistence for the tracking state. One flat JSON file maps issue keys to
//! start instants; every mutation rewrites the whole file under an exclusive
//! lock so concurrent invocations can't lose each other's updates.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

use crate::utils::time::{from_unix_seconds, to_unix_seconds};

pub const TRACKING_FILE: &str = "tracking.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access tracking state at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tracking state at {path:?} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// In-memory image of the persisted state. Keys are tracker-native issue
/// identifiers, values are start instants as float UNIX seconds.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingSet {
    entries: BTreeMap<String, f64>,
}

impl TrackingSet {
    pub fn insert(&mut self, issue_key: &str, started_at: DateTime<Utc>) {
        self.entries
            .insert(issue_key.to_string(), to_unix_seconds(started_at));
    }

    /// Entries with unreadable timestamps are treated as absent.
    pub fn started_at(&self, issue_key: &str) -> Option<DateTime<Utc>> {
        self.entries
            .get(issue_key)
            .copied()
            .and_then(from_unix_seconds)
    }

    pub fn remove(&mut self, issue_key: &str) -> Option<DateTime<Utc>> {
        self.entries.remove(issue_key).and_then(from_unix_seconds)
    }

    /// Removes every entry except `issue_key` and returns them. Used by the
    /// state machine to force stale records closed before starting a new one.
    pub fn take_others(&mut self, issue_key: &str) -> Vec<(String, DateTime<Utc>)> {
        let others = self
            .entries
            .keys()
            .filter(|key| key.as_str() != issue_key)
            .cloned()
            .collect::<Vec<_>>();

        others
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|started_at| (key, started_at)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<DateTime<Utc>>)> {
        self.entries
            .iter()
            .map(|(key, seconds)| (key.as_str(), from_unix_seconds(*seconds)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to the tracking file. Cheap to create; every operation opens the
/// file anew so locks never outlive a single call.
pub struct TrackingStore {
    path: PathBuf,
}

impl TrackingStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(TRACKING_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only snapshot under a shared lock. A missing file is an empty
    /// set, not an error.
    pub async fn load(&self) -> Result<TrackingSet, StoreError> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No tracking file at {:?}, starting empty", self.path);
                return Ok(TrackingSet::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        file.lock_shared().map_err(|e| self.io_error(e))?;
        let mut contents = String::new();
        let read = file
            .read_to_string(&mut contents)
            .await
            .map_err(|e| self.io_error(e));
        file.unlock_async().await.map_err(|e| self.io_error(e))?;
        read?;

        self.parse(&contents)
    }

    /// Runs one read-modify-write cycle under an exclusive lock and returns
    /// whatever the closure produced. The file is fully rewritten, so the
    /// closure's view is also the state any concurrent invocation will see
    /// next.
    pub async fn update<T>(
        &self,
        apply: impl FnOnce(&mut TrackingSet) -> T,
    ) -> Result<T, StoreError> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        file.lock_exclusive().map_err(|e| self.io_error(e))?;
        let result = self.update_locked(&mut file, apply).await;
        file.unlock_async().await.map_err(|e| self.io_error(e))?;
        result
    }

    async fn update_locked<T>(
        &self,
        file: &mut File,
        apply: impl FnOnce(&mut TrackingSet) -> T,
    ) -> Result<T, StoreError> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .await
            .map_err(|e| self.io_error(e))?;
        let mut set = self.parse(&contents)?;

        let value = apply(&mut set);

        let mut serialized = serde_json::to_vec(&set).map_err(|e| StoreError::Malformed {
            path: self.path.clone(),
            source: e,
        })?;
        serialized.push(b'\n');

        file.rewind().await.map_err(|e| self.io_error(e))?;
        file.set_len(0).await.map_err(|e| self.io_error(e))?;
        file.write_all(&serialized)
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        Ok(value)
    }

    fn parse(&self, contents: &str) -> Result<TrackingSet, StoreError> {
        if contents.trim().is_empty() {
            return Ok(TrackingSet::default());
        }
        serde_json::from_str(contents).map_err(|e| StoreError::Malformed {
            path: self.path.clone(),
            source: e,
        })
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::{StoreError, TrackingStore, TRACKING_FILE};

    #[tokio::test]
    async fn test_missing_file_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let store = TrackingStore::new(dir.path());

        let set = store.load().await?;

        assert!(set.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_insert_and_reload() -> Result<()> {
        let dir = tempdir()?;
        let store = TrackingStore::new(dir.path());
        let started_at = Utc.with_ymd_and_hms(2019, 8, 21, 9, 0, 0).unwrap();

        store
            .update(|set| set.insert("PROJ-1", started_at))
            .await?;

        let set = store.load().await?;
        assert_eq!(set.len(), 1);
        assert_eq!(set.started_at("PROJ-1"), Some(started_at));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_format_is_float_seconds() -> Result<()> {
        let dir = tempdir()?;
        let store = TrackingStore::new(dir.path());
        let started_at = Utc.with_ymd_and_hms(2019, 8, 21, 9, 0, 0).unwrap();

        store
            .update(|set| set.insert("PROJ-1", started_at))
            .await?;

        let raw = std::fs::read_to_string(dir.path().join(TRACKING_FILE))?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)?;
        assert_eq!(
            parsed["PROJ-1"].as_f64(),
            Some(started_at.timestamp() as f64)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_happens_exactly_once() -> Result<()> {
        let dir = tempdir()?;
        let store = TrackingStore::new(dir.path());
        let started_at = Utc.with_ymd_and_hms(2019, 8, 21, 9, 0, 0).unwrap();
        store
            .update(|set| set.insert("PROJ-1", started_at))
            .await?;

        let first = store.update(|set| set.remove("PROJ-1")).await?;
        let second = store.update(|set| set.remove("PROJ-1")).await?;

        assert_eq!(first, Some(started_at));
        assert_eq!(second, None);
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_take_others_keeps_only_target() -> Result<()> {
        let dir = tempdir()?;
        let store = TrackingStore::new(dir.path());
        let started_at = Utc.with_ymd_and_hms(2019, 8, 21, 9, 0, 0).unwrap();

        let displaced = store
            .update(|set| {
                set.insert("PROJ-1", started_at);
                set.insert("PROJ-2", started_at);
                set.insert("PROJ-3", started_at);
                set.take_others("PROJ-3")
            })
            .await?;

        assert_eq!(
            displaced,
            vec![
                ("PROJ-1".to_string(), started_at),
                ("PROJ-2".to_string(), started_at)
            ]
        );
        let set = store.load().await?;
        assert_eq!(set.len(), 1);
        assert!(set.started_at("PROJ-3").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(TRACKING_FILE), "not json at all")?;
        let store = TrackingStore::new(dir.path());

        let result = store.load().await;

        assert!(matches!(result, Err(StoreError::Malformed { .. })));
        Ok(())
    }
}
