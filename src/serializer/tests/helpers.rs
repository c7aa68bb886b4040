use crate::io::IoAccount;
use crate::serializer::{BatchOp, LogSerializer};
use crate::{DynamicConfig, StaticConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 64-byte blocks, 8 per extent (704-byte extents).
pub fn small_geometry() -> StaticConfig {
    StaticConfig {
        block_size: 64,
        blocks_per_extent: 8,
    }
}

/// Garbage collection only runs when asked for.
pub fn manual_gc_config() -> DynamicConfig {
    init_tracing();
    DynamicConfig {
        gc_high_ratio: 1.0,
        gc_low_ratio: 0.0,
        io_threads: 2,
        ..DynamicConfig::default()
    }
}

pub fn store_path(dir: &Path) -> PathBuf {
    dir.join("blocks.db")
}

pub fn create_store(dir: &Path, config: DynamicConfig) -> LogSerializer {
    LogSerializer::create_new(store_path(dir), &small_geometry(), config).unwrap()
}

/// Payload identifying `block_id` and `version`.
pub fn payload(block_id: u64, version: u8) -> Vec<u8> {
    let mut data = format!("block-{block_id}-v{version}").into_bytes();
    data.resize(40, version);
    data
}

/// Writes and commits every block id in `ids`, waiting for the commit.
pub fn write_blocks(store: &LogSerializer, ids: impl IntoIterator<Item = u64>, version: u8) -> u64 {
    let ops = ids
        .into_iter()
        .map(|block_id| BatchOp::Write {
            block_id,
            data: payload(block_id, version),
        })
        .collect();
    let batch = store
        .write_batch(ops, version as u64, &IoAccount::default())
        .unwrap();
    batch.wait().unwrap()
}

/// Committed payload of `block_id`, if it is live.
pub fn read_block(store: &LogSerializer, block_id: u64) -> Option<Vec<u8>> {
    let token = store.index_read(block_id).unwrap()?;
    Some(store.block_read(&token, &IoAccount::default()).unwrap())
}
