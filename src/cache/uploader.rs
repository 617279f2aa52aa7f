//! Write-back uploader
//!
//! Pushes objects closed with asynchronous upload to the remote store. Jobs
//! carry read handles on their source copies, so eviction can unmap the
//! copies without freeing the bytes an upload still reads. A job is skipped
//! once a newer version of its key exists.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::file::{CacheFile, FileReadHandle};
use super::key::CacheKey;
use super::range::BlockRange;
use super::remote::RemoteStore;
use super::session::read_stitched;
use super::stats::{LatencyTracker, StatisticsSink};
use super::tier::TierManager;
use super::version::VersionCounter;
use super::CacheTier;
use crate::config::UploadConfig;
use crate::error::{Error, Result};

/// One object version waiting for upload
#[derive(Debug)]
pub struct UploadJob {
    pub key: CacheKey,
    pub version: i64,
    pub length: u64,
    pub last_modified: DateTime<Utc>,
    /// Copies that together hold every byte, read in order
    pub sources: Vec<FileReadHandle>,
}

/// Uploader counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploaderSnapshot {
    pub in_flight: usize,
    pub uploaded: u64,
    pub uploaded_bytes: u64,
    pub skipped_stale: u64,
    pub retries: u64,
    pub failed: u64,
}

/// Background uploader for write-back objects
pub struct Uploader {
    config: UploadConfig,
    remote: Arc<dyn RemoteStore>,
    versions: Arc<VersionCounter>,
    memory: Option<Arc<TierManager>>,
    disk: Option<Arc<TierManager>>,
    stats: Arc<dyn StatisticsSink>,

    tx: mpsc::Sender<UploadJob>,
    rx: Mutex<mpsc::Receiver<UploadJob>>,
    permits: Arc<Semaphore>,

    /// Jobs enqueued and not yet finished
    in_flight: AtomicUsize,
    idle: Notify,

    uploaded: AtomicU64,
    uploaded_bytes: AtomicU64,
    skipped_stale: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

impl Uploader {
    pub fn new(
        config: UploadConfig,
        remote: Arc<dyn RemoteStore>,
        versions: Arc<VersionCounter>,
        memory: Option<Arc<TierManager>>,
        disk: Option<Arc<TierManager>>,
        stats: Arc<dyn StatisticsSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let permits = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Self {
            config,
            remote,
            versions,
            memory,
            disk,
            stats,
            tx,
            rx: Mutex::new(rx),
            permits,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            uploaded: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
            skipped_stale: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Queue a job, waiting while the queue is full
    pub async fn enqueue(&self, job: UploadJob) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(job).await {
            self.finish_job();
            return Err(Error::Internal(format!(
                "upload queue closed, dropping {} v{}",
                e.0.key, e.0.version
            )));
        }
        Ok(())
    }

    /// Run the upload loop until cancelled
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Starting uploader: {} parallel, {} retries",
            self.config.max_parallel, self.config.max_retries
        );
        let mut rx = self.rx.lock().await;
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = rx.recv() => job,
            };
            let Some(job) = job else { break };

            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish_job();
                    break;
                }
                permit = self.permits.clone().acquire_owned() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Upload permits closed: {}", e);
                    self.finish_job();
                    break;
                }
            };

            let uploader = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                uploader.process(job).await;
            });
        }
        info!("Uploader stopped");
    }

    /// Wait until every queued job has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_job(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn is_stale(&self, job: &UploadJob) -> bool {
        self.versions.latest(&job.key) > job.version
    }

    async fn process(&self, job: UploadJob) {
        let timer = LatencyTracker::start();
        let mut delay = self.config.retry_delay();
        let mut attempt = 0u32;

        loop {
            if self.is_stale(&job) {
                debug!(key = %job.key, version = job.version, "Skipping superseded upload");
                self.skipped_stale.fetch_add(1, Ordering::Relaxed);
                break;
            }

            match self.upload(&job).await {
                Ok(true) => {
                    self.on_uploaded(&job);
                    self.stats
                        .on_put(CacheTier::Remote, job.length, timer.elapsed());
                    break;
                }
                Ok(false) | Err(_) if attempt < self.config.max_retries => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Upload of {} v{} failed, retry {}/{} in {:?}",
                        job.key, job.version, attempt, self.config.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Ok(false) => {
                    error!("Upload of {} v{} rejected, giving up", job.key, job.version);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    error!("Upload of {} v{} failed, giving up: {}", job.key, job.version, e);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }

        drop(job);
        self.finish_job();
    }

    async fn upload(&self, job: &UploadJob) -> Result<bool> {
        let mut writer = self
            .remote
            .create_writer(job.key.bucket(), job.key.key(), Some(job.length))
            .await?;
        writer.set_version(job.version);

        let sources: Vec<&CacheFile> = job.sources.iter().map(|h| h.file().as_ref()).collect();
        let chunk = self.config.read_chunk_size.max(1) as u64;
        let mut cursor = 0u64;
        while cursor < job.length {
            let len = chunk.min(job.length - cursor);
            let part = BlockRange::with_len(cursor as i64, len);
            let data = match read_stitched(&sources, part) {
                Ok(data) => data,
                Err(e) => {
                    writer.abort().await;
                    return Err(e);
                }
            };
            if let Err(e) = writer.write(data).await {
                writer.abort().await;
                return Err(e);
            }
            cursor += len;
        }

        writer.close().await?;
        let committed = writer.complete_file().await?;
        if !committed {
            writer.abort().await;
        }
        Ok(committed)
    }

    fn on_uploaded(&self, job: &UploadJob) {
        // the handles first, so copies evicted meanwhile are released too
        for source in &job.sources {
            if let Err(e) = source.mark_uploaded() {
                debug!(key = %job.key, error = %e, "Source copy not marked uploaded");
            }
        }
        for tier in [&self.memory, &self.disk].into_iter().flatten() {
            tier.mark_uploaded(&job.key, job.version);
        }
        self.uploaded.fetch_add(1, Ordering::Relaxed);
        self.uploaded_bytes.fetch_add(job.length, Ordering::Relaxed);
        debug!(key = %job.key, version = job.version, bytes = job.length, "Uploaded");
    }

    pub fn snapshot(&self) -> UploaderSnapshot {
        UploaderSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            skipped_stale: self.skipped_stale.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .field("max_parallel", &self.config.max_parallel)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::Ranking;
    use crate::cache::file::FileState;
    use crate::cache::remote::InMemoryRemoteStore;
    use crate::cache::stats::CacheMetrics;
    use crate::cache::tier::tests::{finished_file, memory_tier};
    use std::time::Duration;

    struct Fixture {
        remote: InMemoryRemoteStore,
        versions: Arc<VersionCounter>,
        memory: Arc<TierManager>,
        uploader: Arc<Uploader>,
    }

    fn fixture(fail_commits: bool) -> Fixture {
        let remote = InMemoryRemoteStore::new();
        remote.set_fail_commits(fail_commits);
        let versions = Arc::new(VersionCounter::new());
        let memory = Arc::new(memory_tier(1 << 20, Ranking::Lru));
        let config = UploadConfig {
            max_retries: 1,
            retry_delay_ms: 1,
            read_chunk_size: 7,
            ..Default::default()
        };
        let uploader = Arc::new(Uploader::new(
            config,
            Arc::new(remote.clone()),
            versions.clone(),
            Some(memory.clone()),
            None,
            Arc::new(CacheMetrics::new()),
        ));
        Fixture {
            remote,
            versions,
            memory,
            uploader,
        }
    }

    fn pending_job(fx: &Fixture, key: &str, data: &[u8]) -> UploadJob {
        let cache_key = CacheKey::new("bucket", key);
        let version = fx.versions.next(&cache_key);
        let file = finished_file(&fx.memory, key, version, data);
        file.to_be_pushed().unwrap();
        fx.memory.put(file.clone());
        UploadJob {
            key: cache_key,
            version,
            length: data.len() as u64,
            last_modified: Utc::now(),
            sources: vec![file.open_reader().unwrap()],
        }
    }

    #[tokio::test]
    async fn test_upload_reaches_remote() {
        let fx = fixture(false);
        let cancel = CancellationToken::new();
        tokio::spawn(fx.uploader.clone().run(cancel.clone()));

        let job = pending_job(&fx, "obj", b"write-back payload");
        fx.uploader.enqueue(job).await.unwrap();
        fx.uploader.wait_idle().await;

        let (data, info) = fx.remote.get("bucket", "obj").unwrap();
        assert_eq!(&data[..], b"write-back payload");
        assert_eq!(info.version, 1);
        let local = fx.memory.peek(&CacheKey::new("bucket", "obj")).unwrap();
        assert_eq!(local.state(), FileState::Complete);
        assert_eq!(fx.uploader.snapshot().uploaded, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_superseded_upload_skipped() {
        let fx = fixture(false);
        let cancel = CancellationToken::new();
        tokio::spawn(fx.uploader.clone().run(cancel.clone()));

        let job = pending_job(&fx, "obj", b"old");
        fx.versions.next(&job.key);
        fx.uploader.enqueue(job).await.unwrap();
        fx.uploader.wait_idle().await;

        assert!(fx.remote.get("bucket", "obj").is_none());
        assert_eq!(fx.uploader.snapshot().skipped_stale, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_copy_pending() {
        let fx = fixture(true);
        let cancel = CancellationToken::new();
        tokio::spawn(fx.uploader.clone().run(cancel.clone()));

        let job = pending_job(&fx, "obj", b"payload");
        fx.uploader.enqueue(job).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), fx.uploader.wait_idle())
            .await
            .unwrap();

        let snapshot = fx.uploader.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retries, 1);
        let local = fx.memory.peek(&CacheKey::new("bucket", "obj")).unwrap();
        assert_eq!(local.state(), FileState::ToBePushed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let fx = fixture(false);
        tokio::time::timeout(Duration::from_millis(100), fx.uploader.wait_idle())
            .await
            .unwrap();
    }
}
