//! Tiergate Integration Tests
//!
//! End-to-end scenarios through the public engine API:
//! - Write fan-out, continuation and rollback
//! - Reads across tiers, shared cache fills and deletion under readers
//! - Eviction, write-back uploads and disk recovery

use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tiergate::cache::{BlockRange, CacheMetrics, FanoutState, FileState, PutOutcome};
use tiergate::config::{
    AdmissionConfig, DiskTierConfig, EvictionConfig, ItemPolicyKind, MemoryTierConfig, WriteConfig,
};
use tiergate::{CacheConfig, CacheEngine, CacheKey, CacheTier, Error, InMemoryRemoteStore};

// =============================================================================
// Helpers
// =============================================================================

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn base_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        memory: MemoryTierConfig {
            capacity_bytes: 1 << 20,
            segment_size: 64,
            ..Default::default()
        },
        disk: DiskTierConfig {
            capacity_bytes: 1 << 20,
            root: dir.path().to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build(config: CacheConfig) -> (CacheEngine, InMemoryRemoteStore, Arc<CacheMetrics>) {
    let remote = InMemoryRemoteStore::new();
    let metrics = Arc::new(CacheMetrics::new());
    let engine = CacheEngine::new(config, Arc::new(remote.clone()), metrics.clone())
        .expect("Failed to build engine");
    (engine, remote, metrics)
}

// =============================================================================
// Write path
// =============================================================================

mod write_tests {
    use super::*;

    #[tokio::test]
    async fn test_two_writers_fill_one_file() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = build(base_config(&dir));
        let memory = engine.memory().unwrap();
        let data = pattern(1000);

        let file = memory.create_file(CacheKey::new("b", "split"));
        let mut first = memory.writer(file.clone(), 0, Some(499));
        let mut second = memory.writer(file.clone(), 500, Some(999));
        second.write(&data[500..]).unwrap();
        first.write(&data[..500]).unwrap();
        first.finish().unwrap();
        second.finish().unwrap();

        assert_eq!(file.covered(), vec![BlockRange::new(0, 999)]);
        file.set_version(1);
        file.set_actual_size(Some(1000));
        file.complete().unwrap();
        assert!(file.is_full_file());
        assert_eq!(memory.put(file), PutOutcome::Inserted);

        let read = engine.read("b", "split", None).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[..]);
    }

    #[tokio::test]
    async fn test_memory_overflow_continues_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.memory.capacity_bytes = 1024;
        config.admission = AdmissionConfig {
            memory_max_object_bytes: 4096,
            disk_min_object_bytes: 4097,
            ..Default::default()
        };
        config.write = WriteConfig {
            chunk_size: 64,
            ..Default::default()
        };
        let (engine, remote, _) = build(config);
        let data = pattern(2000);

        let mut session = engine.create("b", "big", false, Some(2000)).await.unwrap();
        assert_eq!(session.active_tiers(), vec![CacheTier::Memory]);
        session.write(Bytes::from(data.clone())).await.unwrap();
        assert_eq!(session.active_tiers(), vec![CacheTier::Disk]);
        let info = session.close().await.unwrap();
        assert_eq!(info.length, 2000);

        let key = CacheKey::new("b", "big");
        let in_memory = engine.memory().unwrap().peek(&key).unwrap();
        let on_disk = engine.disk().unwrap().peek(&key).unwrap();
        assert_eq!(in_memory.covered(), vec![BlockRange::new(0, 1023)]);
        assert_eq!(on_disk.covered(), vec![BlockRange::new(1024, 1999)]);
        assert_eq!(remote.get("b", "big").unwrap().0.len(), 2000);

        let reads_before = remote.stats().reads;
        let read = engine.read("b", "big", None).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[..]);
        assert_eq!(remote.stats().reads, reads_before);
    }

    #[tokio::test]
    async fn test_write_back_switches_to_remote_when_memory_fills() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.memory.capacity_bytes = 256;
        config.disk.enabled = false;
        config.write = WriteConfig {
            chunk_size: 64,
            ..Default::default()
        };
        let (engine, remote, _) = build(config);
        let data = pattern(1000);

        let mut session = engine.create("b", "wt", true, Some(1000)).await.unwrap();
        session.write(Bytes::copy_from_slice(&data[..200])).await.unwrap();
        assert_eq!(session.state(), FanoutState::Local1(CacheTier::Memory));
        // the cached prefix is replayed to the remote store, then writes go through
        session.write(Bytes::copy_from_slice(&data[200..])).await.unwrap();
        assert_eq!(session.state(), FanoutState::RemoteOnly);
        assert!(session.active_tiers().is_empty());
        let info = session.close().await.unwrap();
        assert_eq!(info.length, 1000);

        let (stored, remote_info) = remote.get("b", "wt").unwrap();
        assert_eq!(&stored[..], &data[..]);
        assert_eq!(remote_info.version, info.version);

        let memory = engine.memory().unwrap();
        assert!(memory.peek(&CacheKey::new("b", "wt")).is_none());
        assert_eq!(memory.usage().used(), 0);
        assert_eq!(engine.snapshot().uploads.in_flight, 0);

        let read = engine.read("b", "wt", None).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[..]);
    }

    #[tokio::test]
    async fn test_failed_remote_commit_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (engine, remote, _) = build(base_config(&dir));
        remote.set_fail_commits(true);

        let result = engine
            .put("b", "k", Bytes::from_static(b"never visible"), false)
            .await;
        assert_matches!(result, Err(Error::RemoteCommitFailure { .. }));

        let key = CacheKey::new("b", "k");
        assert!(engine.memory().unwrap().peek(&key).is_none());
        assert!(engine.disk().unwrap().peek(&key).is_none());
        assert_eq!(engine.memory().unwrap().usage().used(), 0);
        assert!(remote.get("b", "k").is_none());
        assert_eq!(engine.snapshot().pending_writes, 0);
    }
}

// =============================================================================
// Cache fills
// =============================================================================

mod fill_tests {
    use super::*;

    #[tokio::test]
    async fn test_overlapping_fills_share_one_file() {
        let dir = TempDir::new().unwrap();
        let (engine, remote, _) = build(base_config(&dir));
        let data = pattern(1000);
        remote.insert("b", "cold", Bytes::from(data.clone()), 7);

        let (left, right) = tokio::join!(
            engine.read("b", "cold", Some((0, 599))),
            engine.read("b", "cold", Some((400, 999))),
        );
        assert_eq!(&left.unwrap().unwrap()[..], &data[..600]);
        assert_eq!(&right.unwrap().unwrap()[..], &data[400..]);

        let memory = engine.memory().unwrap();
        assert_eq!(memory.len(), 1);
        let copy = memory.peek(&CacheKey::new("b", "cold")).unwrap();
        assert_eq!(copy.version(), 7);
        assert_eq!(copy.covered(), vec![BlockRange::new(0, 999)]);
        assert!(copy.is_full_file());
        // the overlap [400, 599] is stored once
        assert_eq!(memory.usage().used(), 1000);
        assert_eq!(copy.size(), 1000);

        let reads_before = remote.stats().reads;
        let whole = engine.read("b", "cold", None).await.unwrap().unwrap();
        assert_eq!(&whole[..], &data[..]);
        assert_eq!(remote.stats().reads, reads_before);
    }
}

// =============================================================================
// Versions and deletion
// =============================================================================

mod version_tests {
    use super::*;

    #[tokio::test]
    async fn test_newest_version_stays_visible() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = build(base_config(&dir));
        let memory = engine.memory().unwrap();
        let key = CacheKey::new("b", "v");

        let finished = |version: i64, data: &[u8]| {
            let file = memory.create_file(key.clone());
            let mut writer = memory.writer(file.clone(), 0, Some(data.len() as i64 - 1));
            writer.write(data).unwrap();
            writer.finish().unwrap();
            file.set_version(version);
            file.set_actual_size(Some(data.len() as u64));
            file.complete().unwrap();
            file
        };

        let v3 = finished(3, b"three");
        let v5 = finished(5, b"five!");
        assert_eq!(memory.put(v5), PutOutcome::Inserted);
        assert_eq!(memory.put(v3.clone()), PutOutcome::Rejected);
        assert!(v3.is_deleted());
        assert_eq!(memory.version_of(&key), Some(5));

        let read = engine.read("b", "v", None).await.unwrap().unwrap();
        assert_eq!(&read[..], b"five!");
    }

    #[tokio::test]
    async fn test_delete_waits_for_readers() {
        let dir = TempDir::new().unwrap();
        let (engine, _, _) = build(base_config(&dir));
        engine
            .put("b", "k", Bytes::from_static(b"still readable"), false)
            .await
            .unwrap();
        let memory = engine.memory().unwrap();
        let key = CacheKey::new("b", "k");

        let handle = memory.get(&key).unwrap();
        assert!(engine.delete("b", "k").await.unwrap());
        assert!(memory.peek(&key).is_none());
        assert_eq!(
            &handle.read(BlockRange::new(0, 13)).unwrap()[..],
            b"still readable"
        );

        drop(handle);
        assert_eq!(memory.usage().used(), 0);
        assert!(engine.read("b", "k", None).await.unwrap().is_none());
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_evicts_oldest_object() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.memory.capacity_bytes = 1124;
        config.disk.enabled = false;
        config.eviction = EvictionConfig {
            item_policy: ItemPolicyKind::Fifo,
            ..Default::default()
        };
        let (engine, _, metrics) = build(config);

        engine.put("b", "first", Bytes::from(pattern(1024)), false).await.unwrap();
        engine.put("b", "second", Bytes::from(pattern(100)), false).await.unwrap();
        // a read of the oldest object does not move it under FIFO
        engine.read("b", "first", Some((0, 9))).await.unwrap().unwrap();

        let report = engine.run_eviction_once();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.evicted_bytes, 1024);
        report.wait().await;

        let memory = engine.memory().unwrap();
        assert!(memory.peek(&CacheKey::new("b", "first")).is_none());
        assert!(memory.peek(&CacheKey::new("b", "second")).is_some());
        assert_eq!(memory.usage().used(), 100);
        assert_eq!(metrics.evictions(CacheTier::Memory), 1);
    }
}

// =============================================================================
// Write-back and recovery
// =============================================================================

mod write_back_tests {
    use super::*;

    #[tokio::test]
    async fn test_async_upload_reaches_remote() {
        let dir = TempDir::new().unwrap();
        let (engine, remote, _) = build(base_config(&dir));
        let cancel = CancellationToken::new();
        let tasks = engine.start_background(cancel.clone());

        let data = Bytes::from(pattern(300));
        let info = engine.put("b", "wb", data.clone(), true).await.unwrap();
        assert_eq!(info.version, 1);

        engine.wait_for_uploads().await;
        let (stored, remote_info) = remote.get("b", "wb").unwrap();
        assert_eq!(stored, data);
        assert_eq!(remote_info.version, 1);

        let copy = engine.memory().unwrap().peek(&CacheKey::new("b", "wb")).unwrap();
        assert_eq!(copy.state(), FileState::Complete);
        assert_eq!(engine.snapshot().uploads.uploaded, 1);

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_spilled_write_back_survives_eviction() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.memory.capacity_bytes = 1024;
        config.admission = AdmissionConfig {
            memory_max_object_bytes: 4096,
            disk_min_object_bytes: 4097,
            ..Default::default()
        };
        config.write = WriteConfig {
            chunk_size: 64,
            ..Default::default()
        };
        let (engine, remote, _) = build(config);
        let data = pattern(2000);
        let key = CacheKey::new("b", "spill");

        // acknowledged before any upload runs
        engine.put("b", "spill", Bytes::from(data.clone()), true).await.unwrap();
        let read = engine.read("b", "spill", None).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[..]);
        assert_eq!(
            engine.disk().unwrap().peek(&key).unwrap().covered(),
            vec![BlockRange::new(1024, 1999)]
        );

        let report = engine.run_eviction_once();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.wait().await, 1);
        assert!(engine.memory().unwrap().peek(&key).is_none());
        let merged = engine.disk().unwrap().peek(&key).unwrap();
        assert_eq!(merged.covered(), vec![BlockRange::new(0, 1999)]);
        assert_eq!(merged.state(), FileState::ToBePushed);

        let read = engine.read("b", "spill", None).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[..]);
        assert_eq!(remote.stats().reads, 0);

        let cancel = CancellationToken::new();
        let tasks = engine.start_background(cancel.clone());
        engine.wait_for_uploads().await;

        let (stored, info) = remote.get("b", "spill").unwrap();
        assert_eq!(&stored[..], &data[..]);
        assert_eq!(info.version, 1);
        assert_eq!(engine.disk().unwrap().peek(&key).unwrap().state(), FileState::Complete);
        // the evicted memory prefix is released once the upload lets go of it
        assert_eq!(engine.memory().unwrap().usage().used(), 0);

        let read = engine.read("b", "spill", None).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[..]);

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pending_upload_survives_restart() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.memory.enabled = false;
        let data = Bytes::from(pattern(700));

        {
            // background tasks never run, so the upload stays queued
            let (engine, remote, _) = build(config.clone());
            engine.put("b", "durable", data.clone(), true).await.unwrap();
            let copy = engine.disk().unwrap().peek(&CacheKey::new("b", "durable")).unwrap();
            assert_eq!(copy.state(), FileState::ToBePushed);
            assert!(remote.get("b", "durable").is_none());
        }

        let (engine, remote, _) = build(config);
        let cancel = CancellationToken::new();
        let tasks = engine.start_background(cancel.clone());
        let report = engine.recover().await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.bytes, 700);

        engine.wait_for_uploads().await;
        let (stored, info) = remote.get("b", "durable").unwrap();
        assert_eq!(stored, data);
        assert_eq!(info.version, 1);

        let read = engine.read("b", "durable", Some((100, 199))).await.unwrap().unwrap();
        assert_eq!(&read[..], &data[100..200]);

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
