//! Index-write transactions and the commit thread.
//!
//! Callers enqueue [`Transaction`]s; the commit thread takes them one at a
//! time, in submission order. A transaction is applied in three steps:
//!
//! 1. wait (without the state lock) until every payload it installs is on disk,
//! 2. append its LBA entries, fsync, write the next metablock,
//! 3. apply the entries to the in-memory index and data-extent usage.
//!
//! Step 3 never runs unless step 2 completed, so nothing observes a
//! transaction whose metablock is not durable.

use super::gc::{self, GcStats};
use super::{Recency, SerializerError, SerializerInner, Shared};
use crate::io::{IoCompletion, IoError};
use crate::lba::LbaEntry;
use crate::metablock::Metablock;
use crate::token::BlockToken;
use crossbeam::channel::Receiver;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, atomic::Ordering},
};
use tracing::{debug, trace, warn};

pub(crate) type Outcome<T> = Result<T, Arc<SerializerError>>;

/// Work items of the commit thread.
pub(crate) enum CommitRequest {
    Txn(Transaction),
    Gc(Arc<IoCompletion<Outcome<GcStats>>>),
}

pub(crate) struct Transaction {
    pub(crate) ops: Vec<IndexWriteOp>,
    pub(crate) done: Arc<IoCompletion<Outcome<u64>>>,
}

// ------------------------------------------------------------------------------------------------
// Public operation types
// ------------------------------------------------------------------------------------------------

/// What an index write does to a block's location.
#[derive(Debug, Clone)]
pub enum TokenUpdate {
    /// Leave the location as it is (only recency changes).
    Keep,
    /// Point the block at the slot behind this token.
    Set(BlockToken),
    /// Mark the block deleted.
    Delete,
}

/// One entry of an index-write transaction.
#[derive(Debug, Clone)]
pub struct IndexWriteOp {
    pub block_id: u64,
    pub token: TokenUpdate,
    /// `None` keeps the block's current recency.
    pub recency: Option<Recency>,
}

impl IndexWriteOp {
    pub fn set(block_id: u64, token: BlockToken, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Set(token),
            recency: Some(recency),
        }
    }

    pub fn delete(block_id: u64, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Delete,
            recency: Some(recency),
        }
    }

    pub fn touch(block_id: u64, recency: Recency) -> Self {
        Self {
            block_id,
            token: TokenUpdate::Keep,
            recency: Some(recency),
        }
    }
}

/// One element of [`LogSerializer::write_batch`](super::LogSerializer::write_batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Write { block_id: u64, data: Vec<u8> },
    Delete { block_id: u64 },
}

/// Completion of a queued index write.
#[derive(Debug, Clone)]
pub struct CommitHandle {
    done: Arc<IoCompletion<Outcome<u64>>>,
}

impl CommitHandle {
    pub(crate) fn new(done: Arc<IoCompletion<Outcome<u64>>>) -> Self {
        Self { done }
    }

    /// Blocks until the transaction's metablock is durable and returns its
    /// block sequence id.
    pub fn wait(&self) -> Result<u64, SerializerError> {
        match self.done.wait() {
            Ok(Ok(seq)) => Ok(seq),
            Ok(Err(e)) => Err(resurface(&e)),
            Err(e) => Err(SerializerError::CommitFailed(e.to_string())),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.done.peek(), Some(Ok(Ok(_))))
    }
}

/// Tokens of a batch's payload writes plus the handle of its index write.
#[derive(Debug)]
pub struct PendingBatch {
    pub tokens: Vec<BlockToken>,
    pub commit: CommitHandle,
}

impl PendingBatch {
    /// Waits for the batch to commit.
    pub fn wait(&self) -> Result<u64, SerializerError> {
        self.commit.wait()
    }
}

/// Rebuilds an error stored in a shared completion.
pub(crate) fn resurface(e: &SerializerError) -> SerializerError {
    match e {
        SerializerError::OutOfSpace => SerializerError::OutOfSpace,
        SerializerError::Failed => SerializerError::Failed,
        SerializerError::NotReady(state) => SerializerError::NotReady(*state),
        SerializerError::InvalidOperation(msg) => SerializerError::InvalidOperation(msg.clone()),
        other => SerializerError::CommitFailed(other.to_string()),
    }
}

// ------------------------------------------------------------------------------------------------
// Commit thread
// ------------------------------------------------------------------------------------------------

/// Body of the commit thread. Returns once every sender is gone and the
/// queue is drained.
pub(crate) fn commit_loop(shared: Arc<Shared>, requests: Receiver<CommitRequest>) {
    for request in requests.iter() {
        match request {
            CommitRequest::Txn(txn) => {
                let count = txn.ops.len();
                let result = shared.check(commit_transaction(&shared, txn.ops));
                match &result {
                    Ok(seq) => trace!(seq, ops = count, "transaction committed"),
                    Err(e) => warn!(error = %e, ops = count, "transaction rejected"),
                }
                let committed = result.is_ok();
                txn.done.finish(Ok(result.map_err(Arc::new)));
                if committed {
                    maybe_collect_garbage(&shared);
                }
            }
            CommitRequest::Gc(done) => {
                let result = shared.check(gc::run_gc_pass(&shared, true));
                done.finish(Ok(result.map_err(Arc::new)));
            }
        }
    }
    debug!("commit thread exiting");
}

fn maybe_collect_garbage(shared: &Shared) {
    let wanted = match shared.lock() {
        Ok(inner) => inner.data.gc_wanted(),
        Err(_) => false,
    };
    if !wanted {
        return;
    }
    if let Err(e) = shared.check(gc::run_gc_pass(shared, false)) {
        warn!(error = %e, "garbage collection pass failed");
    }
}

fn commit_transaction(shared: &Shared, ops: Vec<IndexWriteOp>) -> Result<u64, SerializerError> {
    if shared.failed.load(Ordering::Acquire) {
        return Err(SerializerError::Failed);
    }

    for op in &ops {
        if let TokenUpdate::Set(token) = &op.token {
            token.wait_written().map_err(|e| match e {
                IoError::PoolClosed => SerializerError::CommitFailed(
                    "payload write was never issued".into(),
                ),
                other => SerializerError::IoPool(other),
            })?;
        }
    }

    let mut guard = shared.lock()?;
    let inner = &mut *guard;
    let entries = build_entries(inner, &ops)?;
    commit_entries(shared, inner, &entries, &[])
}

/// Resolves every op against the committed index.
fn build_entries(
    inner: &mut SerializerInner,
    ops: &[IndexWriteOp],
) -> Result<Vec<LbaEntry>, SerializerError> {
    let mut claimed: HashMap<u64, u64> = HashMap::new();
    let mut entries = Vec::with_capacity(ops.len());

    for op in ops {
        let recency = op
            .recency
            .unwrap_or_else(|| inner.lba.get_recency(op.block_id));
        let entry = match &op.token {
            TokenUpdate::Keep => match inner.lba.lookup(op.block_id) {
                Some(location) => LbaEntry {
                    block_id: op.block_id,
                    offset: Some(location.offset),
                    recency,
                    size: location.size,
                },
                None => tombstone(op.block_id, recency),
            },
            TokenUpdate::Delete => tombstone(op.block_id, recency),
            TokenUpdate::Set(token) => {
                let offset = inner.registry.offset_of(token)?;
                let current = inner.lba.lookup(op.block_id).map(|l| l.offset);
                if inner.data.is_index_live(offset) && current != Some(offset) {
                    return Err(SerializerError::InvalidOperation(format!(
                        "slot at {offset} already holds another block"
                    )));
                }
                if let Some(other) = claimed.insert(offset, op.block_id) {
                    if other != op.block_id {
                        return Err(SerializerError::InvalidOperation(format!(
                            "slot at {offset} installed for blocks {other} and {}",
                            op.block_id
                        )));
                    }
                }
                LbaEntry {
                    block_id: op.block_id,
                    offset: Some(offset),
                    recency,
                    size: token.size(),
                }
            }
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn tombstone(block_id: u64, recency: Recency) -> LbaEntry {
    LbaEntry {
        block_id,
        offset: None,
        recency,
        size: 0,
    }
}

/// Makes `entries` durable under a new metablock, then applies them.
/// `remaps` moves block tokens from relocated slots to their new ones.
pub(crate) fn commit_entries(
    shared: &Shared,
    inner: &mut SerializerInner,
    entries: &[LbaEntry],
    remaps: &[(u64, u64)],
) -> Result<u64, SerializerError> {
    inner.extents.begin_transaction()?;
    let checkpoint = inner.lba.checkpoint();
    let owned_before: HashSet<u64> = inner.lba.owned_extents().into_iter().collect();

    if let Err(e) = write_log(shared, inner, entries) {
        let _discarded = inner.extents.end_transaction();
        let attempted = inner.lba.owned_extents();
        inner.lba.rollback(checkpoint);
        for extent in attempted {
            if !owned_before.contains(&extent) {
                if let Err(free_err) = inner.extents.free(extent) {
                    warn!(extent, error = %free_err, "could not release extent of a failed commit");
                }
            }
        }
        return Err(e);
    }

    let mb = Metablock {
        block_sequence_id: inner.next_sequence(),
        extent: inner.extents.mixin(),
        lba: inner.lba.mixin(),
        data: inner.data.mixin(),
    };
    let written = inner.metablocks.write(&shared.file, &mb);
    let txn = inner.extents.end_transaction()?;
    written?;
    shared.counters.record_metablock_write();
    inner.extents.commit(txn);
    inner.lba.commit_compaction();

    for entry in entries {
        if let Some(previous) = inner.lba.apply(entry) {
            inner.data.mark_garbage(previous)?;
        }
        if let Some(offset) = entry.offset {
            inner.data.mark_live(offset)?;
        }
    }
    for (old, new) in remaps {
        inner.registry.remap(*old, *new);
    }
    inner
        .data
        .reclaim_free_extents(&mut inner.registry, &mut inner.extents)?;

    Ok(mb.block_sequence_id)
}

fn write_log(
    shared: &Shared,
    inner: &mut SerializerInner,
    entries: &[LbaEntry],
) -> Result<(), SerializerError> {
    if inner.lba.needs_compaction() {
        inner.lba.compact(&shared.file, &mut inner.extents)?;
    }
    inner
        .lba
        .append_writes(entries, &shared.file, &mut inner.extents)?;
    shared.file.sync()?;
    Ok(())
}
