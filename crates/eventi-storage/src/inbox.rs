use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info};

use crate::{StoreError, StoreResult};

const PENDING_EXTENSION: &str = "json";
const CONSUMED_EXTENSION: &str = "processed";

/// One producer output batch awaiting load, identified by its file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchRef {
    pub name: String,
}

impl BatchRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Pending-input set consumed by the staging loader.
#[async_trait]
pub trait BatchInbox: Send + Sync {
    /// Pending batches in name order.
    async fn pending(&self) -> StoreResult<Vec<BatchRef>>;
    async fn read(&self, batch: &BatchRef) -> StoreResult<Vec<u8>>;
    /// Move a batch out of the pending set so a retried load skips it.
    async fn mark_consumed(&self, batch: &BatchRef, at: DateTime<Utc>) -> StoreResult<()>;
    /// Delete consumed batches older than `retention`; returns how many were removed.
    async fn purge_consumed(&self, retention: Duration) -> StoreResult<usize>;
}

/// Directory of `*.json` producer outputs; consumed files are renamed to
/// `<stem>.<YYYYmmddHHMMSS>.processed`.
#[derive(Debug, Clone)]
pub struct FsInbox {
    root: PathBuf,
}

impl FsInbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn consumed_name(name: &str, at: DateTime<Utc>) -> String {
        let stem = name
            .strip_suffix(&format!(".{PENDING_EXTENSION}"))
            .unwrap_or(name);
        format!("{stem}.{}.{CONSUMED_EXTENSION}", at.format("%Y%m%d%H%M%S"))
    }

    async fn list_files(&self) -> StoreResult<Vec<(String, PathBuf)>> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                out.push((name.to_string(), entry.path()));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl BatchInbox for FsInbox {
    async fn pending(&self) -> StoreResult<Vec<BatchRef>> {
        Ok(self
            .list_files()
            .await?
            .into_iter()
            .filter(|(_, path)| {
                path.extension().and_then(|e| e.to_str()) == Some(PENDING_EXTENSION)
            })
            .map(|(name, _)| BatchRef::new(name))
            .collect())
    }

    async fn read(&self, batch: &BatchRef) -> StoreResult<Vec<u8>> {
        Ok(fs::read(self.root.join(&batch.name)).await?)
    }

    async fn mark_consumed(&self, batch: &BatchRef, at: DateTime<Utc>) -> StoreResult<()> {
        let from = self.root.join(&batch.name);
        let mut to = self.root.join(Self::consumed_name(&batch.name, at));
        let mut attempt = 1;
        while fs::try_exists(&to).await? {
            let base = Self::consumed_name(&batch.name, at);
            let base = base.trim_end_matches(&format!(".{CONSUMED_EXTENSION}"));
            to = self
                .root
                .join(format!("{base}-{attempt}.{CONSUMED_EXTENSION}"));
            attempt += 1;
        }
        fs::rename(&from, &to).await.map_err(|err| {
            StoreError::Message(format!(
                "archiving batch {} -> {}: {err}",
                from.display(),
                to.display()
            ))
        })?;
        debug!(batch = %batch.name, archived = %to.display(), "batch consumed");
        Ok(())
    }

    async fn purge_consumed(&self, retention: Duration) -> StoreResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for (name, path) in self.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some(CONSUMED_EXTENSION) {
                continue;
            }
            let modified = fs::metadata(&path).await?.modified()?;
            if modified < cutoff {
                fs::remove_file(&path).await?;
                info!(file = %name, "removed old processed batch");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone)]
struct MemoryBatch {
    name: String,
    bytes: Vec<u8>,
    consumed: bool,
}

/// Inbox held in memory, for tests and for batches pushed through the API.
#[derive(Debug, Default)]
pub struct MemoryInbox {
    batches: Mutex<Vec<MemoryBatch>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> StoreResult<()> {
        self.lock()?.push(MemoryBatch {
            name: name.into(),
            bytes: bytes.into(),
            consumed: false,
        });
        Ok(())
    }

    pub fn consumed_names(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|b| b.consumed)
            .map(|b| b.name.clone())
            .collect())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Vec<MemoryBatch>>> {
        self.batches
            .lock()
            .map_err(|_| StoreError::Message("in-memory inbox lock poisoned".to_string()))
    }
}

#[async_trait]
impl BatchInbox for MemoryInbox {
    async fn pending(&self) -> StoreResult<Vec<BatchRef>> {
        let mut names = self
            .lock()?
            .iter()
            .filter(|b| !b.consumed)
            .map(|b| BatchRef::new(b.name.clone()))
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    async fn read(&self, batch: &BatchRef) -> StoreResult<Vec<u8>> {
        self.lock()?
            .iter()
            .find(|b| b.name == batch.name && !b.consumed)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| StoreError::Message(format!("no pending batch named {}", batch.name)))
    }

    async fn mark_consumed(&self, batch: &BatchRef, _at: DateTime<Utc>) -> StoreResult<()> {
        let mut batches = self.lock()?;
        let entry = batches
            .iter_mut()
            .find(|b| b.name == batch.name && !b.consumed)
            .ok_or_else(|| StoreError::Message(format!("no pending batch named {}", batch.name)))?;
        entry.consumed = true;
        Ok(())
    }

    async fn purge_consumed(&self, _retention: Duration) -> StoreResult<usize> {
        let mut batches = self.lock()?;
        let before = batches.len();
        batches.retain(|b| !b.consumed);
        Ok(before - batches.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts")
    }

    #[test]
    fn consumed_name_replaces_json_extension() {
        assert_eq!(
            FsInbox::consumed_name("city_today_milano.json", ts()),
            "city_today_milano.20260224120000.processed"
        );
    }

    #[tokio::test]
    async fn fs_inbox_lists_only_pending_json_in_name_order() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("zero_milano.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("city_today_roma.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("old.20260101000000.processed"), b"[]").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let inbox = FsInbox::new(dir.path());
        let pending = inbox.pending().await.unwrap();
        assert_eq!(
            pending.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
            vec!["city_today_roma.json", "zero_milano.json"]
        );
    }

    #[tokio::test]
    async fn fs_inbox_consumes_by_rename_without_clobbering() {
        let dir = tempdir().expect("tempdir");
        let inbox = FsInbox::new(dir.path());
        std::fs::write(dir.path().join("a.json"), b"[1]").unwrap();
        inbox.mark_consumed(&BatchRef::new("a.json"), ts()).await.unwrap();
        std::fs::write(dir.path().join("a.json"), b"[2]").unwrap();
        inbox.mark_consumed(&BatchRef::new("a.json"), ts()).await.unwrap();

        assert!(inbox.pending().await.unwrap().is_empty());
        assert!(dir.path().join("a.20260224120000.processed").exists());
        assert!(dir.path().join("a.20260224120000-1.processed").exists());
    }

    #[tokio::test]
    async fn fs_inbox_purge_keeps_recent_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.20260224120000.processed"), b"[]").unwrap();
        let inbox = FsInbox::new(dir.path());
        assert_eq!(inbox.purge_consumed(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(inbox.purge_consumed(Duration::ZERO).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_inbox_dir_has_no_pending_batches() {
        let dir = tempdir().expect("tempdir");
        let inbox = FsInbox::new(dir.path().join("nope"));
        assert!(inbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_inbox_tracks_consumption() {
        let inbox = MemoryInbox::new();
        inbox.push("b.json", "[]").unwrap();
        inbox.push("a.json", "[]").unwrap();
        inbox.mark_consumed(&BatchRef::new("a.json"), ts()).await.unwrap();
        assert_eq!(inbox.pending().await.unwrap(), vec![BatchRef::new("b.json")]);
        assert_eq!(inbox.consumed_names().unwrap(), vec!["a.json".to_string()]);
    }
}
