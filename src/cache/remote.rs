//! Remote archive tier abstraction
//!
//! A remote archive stores files by (deposit id, file name). The cache store
//! keeps `<key>.json` metadata and `<key>.tar.gz` bundles there; datasets
//! read their files from it.

use crate::error::ManuResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A file listed in a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
}

/// Remote archive operations
#[async_trait]
pub trait RemoteArchive: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// List the files of a deposit
    async fn list(&self, deposit: &str) -> ManuResult<Vec<RemoteFile>>;

    /// Fetch a file by name; `None` if the deposit has no such file
    async fn fetch(&self, deposit: &str, name: &str) -> ManuResult<Option<Vec<u8>>>;

    /// Upload a file, replacing nothing: callers check `list` first
    async fn upload(&self, deposit: &str, name: &str, data: Vec<u8>) -> ManuResult<()>;
}

/// Call counters of a [`MemoryArchive`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub fetch: usize,
    pub upload: usize,
}

/// Archive held in process memory, with call counters
#[derive(Debug, Default)]
pub struct MemoryArchive {
    deposits: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    offline: AtomicBool,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without counting an upload
    pub fn insert(&self, deposit: &str, name: &str, data: impl Into<Vec<u8>>) {
        self.deposits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(deposit.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }

    /// Read a stored file without counting a fetch
    pub fn get(&self, deposit: &str, name: &str) -> Option<Vec<u8>> {
        self.deposits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(deposit)
            .and_then(|files| files.get(name).cloned())
    }

    /// Names stored in a deposit
    pub fn names(&self, deposit: &str) -> Vec<String> {
        self.deposits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(deposit)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every call fail as if the service were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            list: self.list_calls.load(Ordering::SeqCst),
            fetch: self.fetch_calls.load(Ordering::SeqCst),
            upload: self.upload_calls.load(Ordering::SeqCst),
        }
    }

    pub fn reset_calls(&self) {
        self.list_calls.store(0, Ordering::SeqCst);
        self.fetch_calls.store(0, Ordering::SeqCst);
        self.upload_calls.store(0, Ordering::SeqCst);
    }

    fn check_online(&self) -> ManuResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(crate::error::ManuError::unavailable("memory archive is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteArchive for MemoryArchive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, deposit: &str) -> ManuResult<Vec<RemoteFile>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self
            .deposits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(deposit)
            .map(|files| {
                files
                    .iter()
                    .map(|(name, data)| RemoteFile {
                        name: name.clone(),
                        size: data.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(&self, deposit: &str, name: &str) -> ManuResult<Option<Vec<u8>>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.get(deposit, name))
    }

    async fn upload(&self, deposit: &str, name: &str, data: Vec<u8>) -> ManuResult<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.insert(deposit, name, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_archive_counts_calls() {
        let archive = MemoryArchive::new();
        archive.insert("42", "a.csv", b"1,2".to_vec());

        assert_eq!(archive.fetch("42", "a.csv").await.unwrap(), Some(b"1,2".to_vec()));
        assert_eq!(archive.fetch("42", "b.csv").await.unwrap(), None);
        archive.upload("42", "b.csv", b"3".to_vec()).await.unwrap();

        let listed = archive.list("42").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            archive.calls(),
            CallCounts {
                list: 1,
                fetch: 2,
                upload: 1
            }
        );
    }

    #[tokio::test]
    async fn offline_archive_is_unavailable() {
        let archive = MemoryArchive::new();
        archive.set_offline(true);
        let err = archive.list("42").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
