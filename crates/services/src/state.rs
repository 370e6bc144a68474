//! Small persisted markers kept per service: epoch and update timestamps.

use std::{collections::HashMap, path::PathBuf, sync::Mutex};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    mememo_common::Result,
    tokio::fs,
    tracing::warn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// Orchestrator epoch that last refreshed the scope.
    Epoch,
    LastUpdate,
    NextUpdate,
    /// Last fetch, reset and `setup`; the `refresh` interval counts from it.
    LastRefresh,
}

impl StateKey {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Epoch => "instance.id",
            Self::LastUpdate => "last_update.dt",
            Self::NextUpdate => "next_update.dt",
            Self::LastRefresh => "last_refresh.dt",
        }
    }
}

/// Get/set of opaque string markers by `(scope, key)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, scope: &str, key: StateKey) -> Result<Option<String>>;
    async fn set(&self, scope: &str, key: StateKey, value: &str) -> Result<()>;

    /// Read a marker as an RFC 3339 timestamp. Unparseable values read as unset.
    async fn get_time(&self, scope: &str, key: StateKey) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.get(scope, key).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
            Err(e) => {
                warn!(scope, file = key.file_name(), error = %e, "ignoring unparseable timestamp");
                Ok(None)
            },
        }
    }

    async fn set_time(&self, scope: &str, key: StateKey, value: DateTime<Utc>) -> Result<()> {
        self.set(scope, key, &value.to_rfc3339()).await
    }
}

// ── File store ───────────────────────────────────────────────────────────────

/// One file per marker at `<root>/<scope>/<key file>`.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, scope: &str, key: StateKey) -> PathBuf {
        self.root.join(scope).join(key.file_name())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, scope: &str, key: StateKey) -> Result<Option<String>> {
        match fs::read_to_string(self.path(scope, key)).await {
            Ok(value) => Ok(Some(value.trim_end().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file then rename over the target.
    async fn set(&self, scope: &str, key: StateKey, value: &str) -> Result<()> {
        let path = self.path(scope, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ── Memory store ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryStateStore {
    values: Mutex<HashMap<(String, StateKey), String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, scope: &str, key: StateKey) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(&(scope.to_string(), key)).cloned())
    }

    async fn set(&self, scope: &str, key: StateKey, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert((scope.to_string(), key), value.to_string());
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    #[tokio::test]
    async fn file_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.get("weather", StateKey::Epoch).await.unwrap().is_none());

        store.set("weather", StateKey::Epoch, "abc").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("weather/instance.id")).unwrap(),
            "abc"
        );
        assert_eq!(
            store.get("weather", StateKey::Epoch).await.unwrap().as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn timestamps_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        store.set_time(".manager", StateKey::NextUpdate, at).await.unwrap();
        assert_eq!(
            store.get_time(".manager", StateKey::NextUpdate).await.unwrap(),
            Some(at)
        );
        assert!(
            dir.path()
                .join(".manager/next_update.dt")
                .exists()
        );
    }

    #[tokio::test]
    async fn garbage_timestamp_reads_as_unset() {
        let store = InMemoryStateStore::new();
        store.set("x", StateKey::LastUpdate, "yesterday").await.unwrap();
        assert!(store.get_time("x", StateKey::LastUpdate).await.unwrap().is_none());
    }
}
