//! Integration tests for the public `LogSerializer` API.
//!
//! These tests drive the whole stack (I/O pool → data extents → LBA log →
//! metablock ring) through the public `logser` surface only.
//!
//! ## Coverage areas
//! - **Recovery**: committed batches survive a crash (file copied while the
//!   store is still running) and a clean reopen
//! - **Ordering**: metablock sequence ids keep growing across reopens
//! - **Concurrency**: writers and readers on several threads
//! - **Diff log**: patches stored in serializer blocks reload after reopen
//! - **Config validation**: geometry and dynamic settings are checked
//! - **Shutdown**: every operation is refused afterwards

use logser::diff::PatchOwner;
use logser::{
    BatchOp, BufPatch, DiffCoreStorage, DiffError, DiffOocoreStorage, DynamicConfig, IoAccount,
    LogBlockSelection, LogSerializer, SerializerError, SerializerState, StaticConfig,
};
use std::{fs, path::Path, sync::Arc, thread};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Four 128-byte blocks per extent.
fn geometry() -> StaticConfig {
    StaticConfig {
        block_size: 128,
        blocks_per_extent: 4,
    }
}

fn config() -> DynamicConfig {
    init_tracing();
    DynamicConfig {
        io_threads: 2,
        ..DynamicConfig::default()
    }
}

fn payload(block_id: u64, version: u8) -> Vec<u8> {
    let mut data = vec![version; 100];
    data[..8].copy_from_slice(&block_id.to_le_bytes());
    data
}

fn commit(store: &LogSerializer, ops: Vec<BatchOp>, recency: u64) -> u64 {
    let batch = store
        .write_batch(ops, recency, &IoAccount::default())
        .expect("write_batch");
    batch.wait().expect("commit")
}

fn writes(ids: impl IntoIterator<Item = u64>, version: u8) -> Vec<BatchOp> {
    ids.into_iter()
        .map(|block_id| BatchOp::Write {
            block_id,
            data: payload(block_id, version),
        })
        .collect()
}

fn read(store: &LogSerializer, block_id: u64) -> Option<Vec<u8>> {
    let token = store.index_read(block_id).unwrap()?;
    Some(store.block_read(&token, &IoAccount::default()).unwrap())
}

/// Copies the store file as it is on disk right now.
fn snapshot(from: &Path, to: &Path) {
    fs::copy(from, to).expect("copy store file");
}

// ================================================================================================
// Recovery
// ================================================================================================

/// # Scenario
/// Six blocks are committed in one batch, then the process "dies".
///
/// # Starting environment
/// Fresh store with 4 blocks per extent.
///
/// # Actions
/// 1. Commit blocks 0..6 in one batch.
/// 2. Copy the file while the store is still open (the crash image).
/// 3. Open the copy.
///
/// # Expected behavior
/// `max_block_id()` is 6, blocks 0..6 read back their payloads and block 6
/// is absent.
#[test]
fn committed_batch_survives_crash() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live.db");
    let crashed = dir.path().join("crashed.db");

    let store = LogSerializer::create_new(&live, &geometry(), config()).unwrap();
    commit(&store, writes(0..6, 1), 1);
    snapshot(&live, &crashed);
    store.shutdown().unwrap();

    let recovered = LogSerializer::open_path(&crashed, config()).unwrap();
    assert_eq!(recovered.max_block_id().unwrap(), 6);
    for id in 0..6 {
        assert_eq!(read(&recovered, id), Some(payload(id, 1)));
    }
    assert_eq!(read(&recovered, 6), None);
    assert!(recovered.get_delete_bit(6).unwrap());
    recovered.shutdown().unwrap();
}

/// # Scenario
/// Payloads are written but their index write is never submitted before
/// the crash.
///
/// # Expected behavior
/// The recovered store knows only the committed version.
#[test]
fn uncommitted_writes_are_invisible_after_crash() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("live.db");
    let crashed = dir.path().join("crashed.db");

    let store = LogSerializer::create_new(&live, &geometry(), config()).unwrap();
    commit(&store, writes([0], 1), 1);
    let tokens = store
        .block_writes(
            &[logser::BufWriteInfo {
                block_id: 0,
                data: payload(0, 2),
            }],
            &IoAccount::default(),
        )
        .unwrap();
    tokens[0].wait_written().unwrap();
    snapshot(&live, &crashed);
    drop(tokens);
    store.shutdown().unwrap();

    let recovered = LogSerializer::open_path(&crashed, config()).unwrap();
    assert_eq!(read(&recovered, 0), Some(payload(0, 1)));
    assert_eq!(recovered.max_block_id().unwrap(), 1);
    recovered.shutdown().unwrap();
}

#[test]
fn overwrites_and_deletes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    {
        let store = LogSerializer::create_new(&path, &geometry(), config()).unwrap();
        commit(&store, writes(0..10, 1), 1);
        commit(&store, writes(0..5, 2), 2);
        commit(
            &store,
            vec![BatchOp::Delete { block_id: 7 }, BatchOp::Delete { block_id: 8 }],
            3,
        );
        store.shutdown().unwrap();
    }

    let store = LogSerializer::open_path(&path, config()).unwrap();
    assert_eq!(store.max_block_id().unwrap(), 10);
    for id in 0..5 {
        assert_eq!(read(&store, id), Some(payload(id, 2)));
        assert_eq!(store.get_recency(id).unwrap(), 2);
    }
    for id in [5, 6, 9] {
        assert_eq!(read(&store, id), Some(payload(id, 1)));
    }
    for id in [7, 8] {
        assert_eq!(read(&store, id), None);
        assert_eq!(store.get_recency(id).unwrap(), 3);
    }
    store.shutdown().unwrap();
}

/// # Scenario
/// Transactions are committed across three open/close cycles.
///
/// # Expected behavior
/// Every returned block sequence id is larger than all earlier ones.
#[test]
fn sequence_ids_grow_across_reopens() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");

    let mut last = 0;
    for round in 0..3u8 {
        let store = if round == 0 {
            LogSerializer::create_new(&path, &geometry(), config()).unwrap()
        } else {
            LogSerializer::open_path(&path, config()).unwrap()
        };
        for i in 0..5u64 {
            let seq = commit(&store, writes([i], round), round as u64);
            assert!(seq > last, "{seq} after {last}");
            last = seq;
        }
        store.shutdown().unwrap();
    }
}

// ================================================================================================
// Concurrency
// ================================================================================================

#[test]
fn concurrent_writers_and_readers() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        LogSerializer::create_new(dir.path().join("store.db"), &geometry(), config()).unwrap(),
    );
    commit(&store, writes(0..8, 0), 0);

    let mut threads = Vec::new();
    for t in 0..4u64 {
        let store = Arc::clone(&store);
        threads.push(thread::spawn(move || {
            for version in 1..=10u8 {
                commit(&store, writes([t * 2, t * 2 + 1], version), version as u64);
            }
        }));
    }
    for _ in 0..2 {
        let store = Arc::clone(&store);
        threads.push(thread::spawn(move || {
            for _ in 0..50 {
                for id in 0..8 {
                    let data = read(&store, id).expect("block stays live");
                    assert_eq!(&data[..8], &id.to_le_bytes());
                }
            }
        }));
    }
    for handle in threads {
        handle.join().unwrap();
    }

    for id in 0..8 {
        assert_eq!(read(&store, id), Some(payload(id, 10)));
    }
    store.shutdown().unwrap();
}

// ================================================================================================
// Diff log
// ================================================================================================

/// Every target block exists and has no patch applied yet.
struct FreshTargets;

impl PatchOwner for FreshTargets {
    fn applied_patch_counter(&self, _block_id: u64) -> Option<u64> {
        Some(0)
    }

    fn flush_block(&mut self, block_id: u64, _patches: &[BufPatch]) -> Result<(), DiffError> {
        Err(DiffError::Flush {
            block_id,
            reason: "not expected".into(),
        })
    }
}

/// # Scenario
/// A diff log of four serializer blocks records patches, is written back,
/// and the store is reopened.
///
/// # Expected behavior
/// All patches are reloaded and reproduce the patched images.
#[test]
fn diff_log_persists_in_serializer_blocks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let log_start = 1000;

    let mut expected = vec![0u8; 64];
    {
        let store = LogSerializer::create_new(&path, &geometry(), config()).unwrap();
        let mut log = DiffOocoreStorage::new(
            store.get_block_size() as usize,
            LogBlockSelection::OldestFirst,
        );
        log.init(log_start, 4).unwrap();
        let mut core = DiffCoreStorage::new();

        for counter in 1..=12u64 {
            let patch = BufPatch::new(5, counter, (counter * 3) as u32, vec![counter as u8; 6]);
            patch.apply_to(&mut expected).unwrap();
            assert!(log.store_patch(&patch, &core));
            core.store_patch(patch);
        }
        assert_eq!(log.writeback(&store).unwrap(), 4);
        store.shutdown().unwrap();
    }

    let store = LogSerializer::open_path(&path, config()).unwrap();
    assert!(store.max_block_id().unwrap() >= log_start + 4);
    let mut log = DiffOocoreStorage::new(
        store.get_block_size() as usize,
        LogBlockSelection::OldestFirst,
    );
    log.init(log_start, 4).unwrap();
    let mut core = DiffCoreStorage::new();
    assert_eq!(log.load_patches(&store, &FreshTargets, &mut core).unwrap(), 12);

    let mut image = vec![0u8; 64];
    assert_eq!(core.apply_patches(5, &mut image).unwrap(), 12);
    assert_eq!(image, expected);
    store.shutdown().unwrap();
}

// ================================================================================================
// Config validation and shutdown
// ================================================================================================

#[test]
fn invalid_geometry_rejected() {
    let dir = TempDir::new().unwrap();
    let bad = StaticConfig {
        block_size: 0,
        blocks_per_extent: 4,
    };
    assert!(matches!(
        LogSerializer::create_new(dir.path().join("a.db"), &bad, config()),
        Err(SerializerError::InvalidConfig(_))
    ));
    assert!(!dir.path().join("a.db").exists());

    let bad = DynamicConfig {
        lba_compaction_ratio: 0.5,
        ..config()
    };
    assert!(matches!(
        LogSerializer::create_new(dir.path().join("b.db"), &geometry(), bad),
        Err(SerializerError::InvalidConfig(_))
    ));
}

#[test]
fn operations_refused_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let store =
        LogSerializer::create_new(dir.path().join("store.db"), &geometry(), config()).unwrap();
    commit(&store, writes([0], 1), 1);
    store.shutdown().unwrap();

    assert_eq!(store.state(), SerializerState::ShutDown);
    assert!(matches!(
        store.write_batch(writes([1], 1), 1, &IoAccount::default()),
        Err(SerializerError::NotReady(_))
    ));
    assert!(matches!(store.get_recency(0), Err(SerializerError::NotReady(_))));
    assert!(matches!(store.shutdown(), Err(SerializerError::NotReady(_))));
}
