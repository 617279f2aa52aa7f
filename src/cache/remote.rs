//! Remote object store boundary
//!
//! The engine talks to the S3-compatible store only through [`RemoteStore`]
//! and [`RemoteWriter`]. Every committed object carries the per-key version
//! it was written with; the store keeps the highest version it has seen.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::range::BlockRange;
use crate::error::{Error, Result};

/// Object metadata as seen by listings and commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub length: u64,
    pub last_modified: DateTime<Utc>,
    pub version: i64,
}

/// Data returned by a remote read
#[derive(Debug, Clone)]
pub struct RemoteObject {
    /// Metadata of the whole object
    pub info: ObjectInfo,
    /// Range the data covers; `None` for an empty object
    pub range: Option<BlockRange>,
    pub data: Bytes,
}

/// Remote object store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a writer for a new object version
    async fn create_writer(
        &self,
        bucket: &str,
        key: &str,
        known_length: Option<u64>,
    ) -> Result<Box<dyn RemoteWriter>>;

    /// Read an object, optionally a byte range of it
    async fn read(
        &self,
        bucket: &str,
        key: &str,
        range: Option<BlockRange>,
    ) -> Result<Option<RemoteObject>>;

    /// Object metadata
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;

    /// Delete an object
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

    /// List objects under a prefix
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// Streaming writer for one remote object
#[async_trait]
pub trait RemoteWriter: Send {
    /// Send bytes
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Version the object is committed under
    fn set_version(&mut self, version: i64);

    /// Flush buffered bytes; no more writes follow
    async fn close(&mut self) -> Result<()>;

    /// Commit the object; false if the store refused it
    async fn complete_file(&mut self) -> Result<bool>;

    /// Discard everything sent so far
    async fn abort(&mut self);

    /// Metadata of the object being written
    fn object(&self) -> ObjectInfo;

    /// True once the upload spans more than one part
    fn is_uploading_multipart(&self) -> bool;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Remote store statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteStoreStats {
    pub object_count: u64,
    pub reads: u64,
    pub commits: u64,
    pub stale_commits: u64,
    pub deletes: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    info: ObjectInfo,
}

#[derive(Debug)]
struct StoreInner {
    /// bucket -> key -> object
    storage: DashMap<String, DashMap<String, StoredObject>>,
    fail_commits: AtomicBool,
    multipart_threshold: u64,
    reads: AtomicU64,
    commits: AtomicU64,
    stale_commits: AtomicU64,
    deletes: AtomicU64,
}

/// In-memory remote store for tests and standalone runs
#[derive(Debug, Clone)]
pub struct InMemoryRemoteStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    /// Default part size above which uploads count as multipart (8MB)
    pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_multipart_threshold(Self::DEFAULT_MULTIPART_THRESHOLD)
    }

    pub fn with_multipart_threshold(threshold: u64) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage: DashMap::new(),
                fail_commits: AtomicBool::new(false),
                multipart_threshold: threshold,
                reads: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                stale_commits: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
            }),
        }
    }

    /// Make every following commit fail (or succeed again)
    pub fn set_fail_commits(&self, fail: bool) {
        self.inner.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Store an object directly, as another gateway would
    pub fn insert(&self, bucket: &str, key: &str, data: Bytes, version: i64) -> ObjectInfo {
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            length: data.len() as u64,
            last_modified: Utc::now(),
            version,
        };
        self.inner.commit(StoredObject {
            data,
            info: info.clone(),
        });
        info
    }

    /// Full contents of a stored object
    pub fn get(&self, bucket: &str, key: &str) -> Option<(Bytes, ObjectInfo)> {
        self.inner.lookup(bucket, key).map(|o| (o.data, o.info))
    }

    pub fn stats(&self) -> RemoteStoreStats {
        RemoteStoreStats {
            object_count: self.inner.storage.iter().map(|b| b.len() as u64).sum(),
            reads: self.inner.reads.load(Ordering::Relaxed),
            commits: self.inner.commits.load(Ordering::Relaxed),
            stale_commits: self.inner.stale_commits.load(Ordering::Relaxed),
            deletes: self.inner.deletes.load(Ordering::Relaxed),
        }
    }
}

impl StoreInner {
    fn lookup(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.storage
            .get(bucket)
            .and_then(|objects| objects.get(key).map(|o| o.clone()))
    }

    /// Highest version wins; older commits are dropped silently
    fn commit(&self, object: StoredObject) -> bool {
        let objects = self
            .storage
            .entry(object.info.bucket.clone())
            .or_insert_with(DashMap::new);
        match objects.entry(object.info.key.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get().info.version;
                if current > object.info.version {
                    self.stale_commits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        bucket = %object.info.bucket,
                        key = %object.info.key,
                        version = object.info.version,
                        current,
                        "Ignoring stale remote commit"
                    );
                    return false;
                }
                existing.insert(object);
            }
            Entry::Vacant(slot) => {
                slot.insert(object);
            }
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create_writer(
        &self,
        bucket: &str,
        key: &str,
        _known_length: Option<u64>,
    ) -> Result<Box<dyn RemoteWriter>> {
        Ok(Box::new(InMemoryRemoteWriter {
            store: self.inner.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            buffer: BytesMut::new(),
            version: 0,
            last_modified: Utc::now(),
            closed: false,
            aborted: false,
        }))
    }

    async fn read(
        &self,
        bucket: &str,
        key: &str,
        range: Option<BlockRange>,
    ) -> Result<Option<RemoteObject>> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        let Some(object) = self.inner.lookup(bucket, key) else {
            return Ok(None);
        };
        let length = object.info.length;
        if length == 0 {
            return Ok(Some(RemoteObject {
                info: object.info,
                range: None,
                data: Bytes::new(),
            }));
        }

        let full = BlockRange::with_len(0, length);
        let range = match range {
            Some(requested) => requested.intersect(&full).ok_or(Error::InvalidRange {
                start: requested.start,
                stop: requested.stop,
            })?,
            None => full,
        };
        let data = object
            .data
            .slice(range.start as usize..=range.stop as usize);
        Ok(Some(RemoteObject {
            info: object.info,
            range: Some(range),
            data,
        }))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        Ok(self.inner.lookup(bucket, key).map(|o| o.info))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .inner
            .storage
            .get(bucket)
            .map(|objects| objects.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut infos: Vec<ObjectInfo> = self
            .inner
            .storage
            .get(bucket)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|o| o.key().starts_with(prefix))
                    .map(|o| o.info.clone())
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

struct InMemoryRemoteWriter {
    store: Arc<StoreInner>,
    bucket: String,
    key: String,
    buffer: BytesMut,
    version: i64,
    last_modified: DateTime<Utc>,
    closed: bool,
    aborted: bool,
}

#[async_trait]
impl RemoteWriter for InMemoryRemoteWriter {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        if self.closed || self.aborted {
            return Err(Error::Remote(format!(
                "write to finished upload of {}/{}",
                self.bucket, self.key
            )));
        }
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    async fn complete_file(&mut self) -> Result<bool> {
        if self.aborted {
            return Ok(false);
        }
        self.closed = true;
        if self.store.fail_commits.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.last_modified = Utc::now();
        let object = StoredObject {
            data: self.buffer.clone().freeze(),
            info: self.object(),
        };
        self.store.commit(object);
        Ok(true)
    }

    async fn abort(&mut self) {
        self.aborted = true;
        self.buffer.clear();
    }

    fn object(&self) -> ObjectInfo {
        ObjectInfo {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            length: self.buffer.len() as u64,
            last_modified: self.last_modified,
            version: self.version,
        }
    }

    fn is_uploading_multipart(&self) -> bool {
        self.buffer.len() as u64 > self.store.multipart_threshold
    }
}

// =============================================================================
// Tests
// =============================================================================
