//! # Log Serializer
//!
//! Composes the extent manager, LBA index, data block manager, metablock
//! manager and token registry into the block store API used by the cache.
//!
//! ## Threads
//!
//! - **Callers** allocate slots and issue payload writes/reads; payload I/O
//!   runs on the [`IoPool`] so `block_writes` returns immediately.
//! - **Commit thread** consumes the ordered transaction queue (a crossbeam
//!   channel). For each transaction it waits for the payload writes of the
//!   tokens it installs, then appends the LBA entries, writes the metablock
//!   and only then applies the new mappings in memory. Because the queue is
//!   FIFO and drained by one thread, metablocks reach disk in submission
//!   order even when payload writes complete out of order. Garbage
//!   collection runs on this thread too, between transactions.
//!
//! All in-memory state lives in one `Mutex<SerializerInner>`. Dropping a
//! [`BlockToken`] never takes that lock; releases are queued on a channel
//! and drained under the lock.
//!
//! ## Lifecycle
//!
//! `Unstarted → StartingUp → Ready → ShuttingDown → ShutDown`. Everything
//! except construction and shutdown fails with
//! [`SerializerError::NotReady`] outside `Ready`. A failed disk write or
//! metablock write marks the instance failed; from then on every operation
//! returns [`SerializerError::Failed`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

mod gc;
pub mod shutdown;
mod stats;
mod txn;

pub use gc::GcStats;
pub use stats::SerializerStats;
pub use shutdown::{ShutdownHandle, ShutdownListener, ShutdownState};
pub use txn::{BatchOp, CommitHandle, IndexWriteOp, PendingBatch, TokenUpdate};

use crate::data_block::{self, BlockHeader, DataBlockError, DataBlockManager, Geometry};
use crate::encoding::EncodingError;
use crate::extent::{ExtentError, ExtentManager};
use crate::file::{DbFile, FileError, FilepathFileOpener, SerializerFileOpener};
use crate::io::{IoAccount, IoCompletion, IoError, IoPool, IoSignal};
use crate::lba::{LbaError, LbaIndex, LbaMixin};
use crate::metablock::{
    self, Metablock, MetablockError, MetablockManager, STATIC_REGION_SIZE, StaticHeader,
};
use crate::token::{BlockToken, TokenError, TokenRegistry};
use crate::{DynamicConfig, StaticConfig};
use crossbeam::channel::{self, Sender};
use shutdown::ShutdownMachine;
use stats::SerializerCounters;
use std::{
    fmt, io,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};
use txn::CommitRequest;

/// Logical timestamp attached to every index write.
pub type Recency = u64;

/// Recency reported for blocks with no surviving index entry.
pub const INVALID_RECENCY: Recency = 0;

/// Exclusive upper bound on block ids.
pub const MAX_BLOCK_ID: u64 = 1 << 32;

const TOKEN_WAIT_POLL: Duration = Duration::from_millis(50);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Extent error: {0}")]
    Extent(#[source] ExtentError),

    #[error("LBA error: {0}")]
    Lba(#[source] LbaError),

    #[error("Data block error: {0}")]
    DataBlock(#[source] DataBlockError),

    #[error("Metablock error: {0}")]
    Metablock(#[from] MetablockError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("I/O pool error: {0}")]
    IoPool(#[from] IoError),

    /// A configuration parameter is out of range or does not match the file.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The operation was issued outside the `Ready` state.
    #[error("serializer is not ready (state {0:?})")]
    NotReady(SerializerState),

    /// An earlier I/O failure halted the serializer.
    #[error("serializer halted after an I/O failure")]
    Failed,

    /// No extent could be allocated under the configured file size limit.
    #[error("out of space")]
    OutOfSpace,

    /// The caller passed an argument the serializer cannot act on.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The transaction could not be committed.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// In-memory state contradicts itself.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ExtentError> for SerializerError {
    fn from(e: ExtentError) -> Self {
        match e {
            ExtentError::OutOfSpace { .. } => Self::OutOfSpace,
            other => Self::Extent(other),
        }
    }
}

impl From<LbaError> for SerializerError {
    fn from(e: LbaError) -> Self {
        match e {
            LbaError::Extent(ExtentError::OutOfSpace { .. }) | LbaError::SuperblockFull(_) => {
                Self::OutOfSpace
            }
            other => Self::Lba(other),
        }
    }
}

impl From<DataBlockError> for SerializerError {
    fn from(e: DataBlockError) -> Self {
        match e {
            DataBlockError::Extent(ExtentError::OutOfSpace { .. }) => Self::OutOfSpace,
            DataBlockError::PayloadTooLarge { .. } => Self::InvalidOperation(e.to_string()),
            other => Self::DataBlock(other),
        }
    }
}

impl SerializerError {
    /// Whether the error leaves on-disk or in-memory state untrustworthy.
    fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidConfig(_)
                | Self::NotReady(_)
                | Self::OutOfSpace
                | Self::InvalidOperation(_)
                | Self::Token(_)
                | Self::CommitFailed(_)
                | Self::Failed
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Lifecycle state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SerializerState {
    Unstarted,
    StartingUp,
    Ready,
    ShuttingDown,
    ShutDown,
}

impl SerializerState {
    /// Moves to `next`, which must be the immediate successor.
    fn advance(&mut self, next: SerializerState) -> Result<(), SerializerError> {
        let expected = match self {
            Self::Unstarted => Some(Self::StartingUp),
            Self::StartingUp => Some(Self::Ready),
            Self::Ready => Some(Self::ShuttingDown),
            Self::ShuttingDown => Some(Self::ShutDown),
            Self::ShutDown => None,
        };
        if expected != Some(next) {
            return Err(SerializerError::InvariantViolation(format!(
                "illegal state transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Public request types
// ------------------------------------------------------------------------------------------------

/// One payload to write through [`LogSerializer::block_writes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufWriteInfo {
    pub block_id: u64,
    pub data: Vec<u8>,
}

/// Receives blocks that happened to be read together with a requested one.
pub trait ReadAheadCallback: Send + Sync {
    /// Offers a block read from the same extent. The buffer is a snapshot;
    /// the token stays valid across garbage collection. Returns `true` if
    /// the block was taken, which stops it being offered to other callbacks.
    fn offer_read_ahead_buf(
        &self,
        block_id: u64,
        buf: &[u8],
        token: &BlockToken,
        recency: Recency,
    ) -> bool;
}

/// Registration handle of a read-ahead callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadAheadCbId(u64);

// ------------------------------------------------------------------------------------------------
// Internal state
// ------------------------------------------------------------------------------------------------

struct SerializerInner {
    state: SerializerState,
    extents: ExtentManager,
    lba: LbaIndex,
    data: DataBlockManager,
    metablocks: MetablockManager,
    registry: TokenRegistry,
    next_sequence: u64,
    read_ahead: Vec<(ReadAheadCbId, Arc<dyn ReadAheadCallback>)>,
    next_cb_id: u64,
}

impl SerializerInner {
    fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }
}

pub(crate) struct Shared {
    inner: Mutex<SerializerInner>,
    file: Arc<DbFile>,
    pool: IoPool,
    geometry: Geometry,
    config: DynamicConfig,
    failed: Arc<AtomicBool>,
    counters: Arc<SerializerCounters>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, SerializerInner>, SerializerError> {
        self.inner
            .lock()
            .map_err(|_| SerializerError::Internal("Mutex poisoned".into()))
    }

    /// Locks the inner state, failing unless the serializer is usable.
    fn lock_ready(&self) -> Result<MutexGuard<'_, SerializerInner>, SerializerError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(SerializerError::Failed);
        }
        let inner = self.lock()?;
        if inner.state != SerializerState::Ready {
            return Err(SerializerError::NotReady(inner.state));
        }
        Ok(inner)
    }

    fn fail(&self, cause: &SerializerError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!(error = %cause, "serializer halted");
        }
    }

    /// Marks the serializer failed if `result` carries a fatal error.
    fn check<T>(&self, result: Result<T, SerializerError>) -> Result<T, SerializerError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.fail(e);
            }
        }
        result
    }
}

// ------------------------------------------------------------------------------------------------
// LogSerializer
// ------------------------------------------------------------------------------------------------

/// The block store.
///
/// `LogSerializer` is `Send + Sync`; share it through an `Arc` when several
/// threads issue operations.
pub struct LogSerializer {
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<CommitRequest>>>,
    committer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl fmt::Debug for LogSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSerializer")
            .field("path", &self.shared.file.path())
            .field("geometry", &self.shared.geometry)
            .field("failed", &self.shared.failed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn reserved_extents(extent_size: u64) -> u64 {
    STATIC_REGION_SIZE.div_ceil(extent_size)
}

impl LogSerializer {
    // --------------------------------------------------------------------------------------------
    // Construction
    // --------------------------------------------------------------------------------------------

    /// Formats a new store: static header and metablock ring go into a
    /// temporary file, which is moved to its final path once durable.
    pub fn create(
        opener: &mut dyn SerializerFileOpener,
        config: &StaticConfig,
    ) -> Result<(), SerializerError> {
        config.validate()?;
        let geometry = config.geometry();
        let extent_size = geometry.extent_size();
        let reserved = reserved_extents(extent_size);

        let file = opener.open_serializer_file_create_temporary()?;
        file.set_len(reserved * extent_size)?;

        let header = StaticHeader {
            block_size: config.block_size,
            blocks_per_extent: config.blocks_per_extent,
        };
        let initial = Metablock {
            block_sequence_id: 1,
            extent: crate::extent::ExtentMixin {
                extent_count: reserved,
            },
            lba: LbaMixin::empty(),
            data: data_block::DataBlockMixin::empty(),
        };
        MetablockManager::create(&file, &header, &initial)?;
        drop(file);
        opener.move_serializer_file_to_permanent_location()?;

        info!(
            path = %opener.file_name().display(),
            block_size = config.block_size,
            blocks_per_extent = config.blocks_per_extent,
            "serializer file created"
        );
        Ok(())
    }

    /// Recovers an existing store and starts its threads.
    pub fn open(
        opener: &mut dyn SerializerFileOpener,
        config: DynamicConfig,
    ) -> Result<Self, SerializerError> {
        config.validate()?;
        let mut state = SerializerState::Unstarted;
        state.advance(SerializerState::StartingUp)?;

        let file = opener.open_serializer_file_existing()?;
        let image = file.map_readonly()?;

        let header = metablock::read_static_header(&image)?;
        let static_config = StaticConfig {
            block_size: header.block_size,
            blocks_per_extent: header.blocks_per_extent,
        };
        static_config
            .validate()
            .map_err(|e| SerializerError::InvalidConfig(format!("static header: {e}")))?;
        let geometry = static_config.geometry();
        let extent_size = geometry.extent_size();

        let (metablocks, mb) = MetablockManager::read_latest(&image)?;
        let mut extents = ExtentManager::start_existing(
            extent_size,
            reserved_extents(extent_size),
            config.max_file_size,
            &mb.extent,
        )?;
        let lba =
            LbaIndex::start_existing(&image, &mb.lba, &mut extents, config.lba_compaction_ratio)?;
        let data = DataBlockManager::start_existing(
            geometry,
            config.gc_config(),
            &mb.data,
            &lba,
            &mut extents,
        )?;
        drop(image);

        state.advance(SerializerState::Ready)?;
        let inner = SerializerInner {
            state,
            extents,
            lba,
            data,
            metablocks,
            registry: TokenRegistry::new(),
            next_sequence: mb.block_sequence_id + 1,
            read_ahead: Vec::new(),
            next_cb_id: 0,
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(inner),
            file: Arc::new(file),
            pool: IoPool::new(config.io_threads),
            geometry,
            config,
            failed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(SerializerCounters::default()),
        });

        let (tx, rx) = channel::unbounded::<CommitRequest>();
        let committer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("logser-commit".into())
                .spawn(move || txn::commit_loop(shared, rx))
                .expect("failed to spawn commit thread")
        };

        info!(
            path = %opener.file_name().display(),
            block_sequence_id = mb.block_sequence_id,
            max_block_id = mb.lba.max_block_id,
            "serializer opened"
        );

        Ok(Self {
            shared,
            queue: Mutex::new(Some(tx)),
            committer: Mutex::new(Some(committer)),
        })
    }

    /// Creates a store at `path` and opens it.
    pub fn create_new(
        path: impl AsRef<Path>,
        static_config: &StaticConfig,
        config: DynamicConfig,
    ) -> Result<Self, SerializerError> {
        let mut opener = FilepathFileOpener::new(path);
        Self::create(&mut opener, static_config)?;
        Self::open(&mut opener, config)
    }

    /// Opens the store at `path`.
    pub fn open_path(path: impl AsRef<Path>, config: DynamicConfig) -> Result<Self, SerializerError> {
        let mut opener = FilepathFileOpener::new(path);
        Self::open(&mut opener, config)
    }

    // --------------------------------------------------------------------------------------------
    // Buffers and accounts
    // --------------------------------------------------------------------------------------------

    pub fn get_block_size(&self) -> u32 {
        self.shared.geometry.block_size
    }

    /// Zero-filled buffer of one block.
    pub fn allocate_buffer(&self) -> Vec<u8> {
        vec![0u8; self.shared.geometry.block_size as usize]
    }

    /// Block-sized copy of `buf`, zero padded or truncated.
    pub fn clone_buffer(&self, buf: &[u8]) -> Vec<u8> {
        let mut copy = self.allocate_buffer();
        let len = buf.len().min(copy.len());
        copy[..len].copy_from_slice(&buf[..len]);
        copy
    }

    /// I/O account with the given priority and outstanding-request limit
    /// (`0` = unlimited).
    pub fn make_io_account(&self, priority: i32, outstanding_limit: usize) -> IoAccount {
        IoAccount::new(priority, outstanding_limit)
    }

    // --------------------------------------------------------------------------------------------
    // Read-ahead callbacks
    // --------------------------------------------------------------------------------------------

    pub fn register_read_ahead_cb(
        &self,
        cb: Arc<dyn ReadAheadCallback>,
    ) -> Result<ReadAheadCbId, SerializerError> {
        let mut inner = self.shared.lock_ready()?;
        let id = ReadAheadCbId(inner.next_cb_id);
        inner.next_cb_id += 1;
        inner.read_ahead.push((id, cb));
        Ok(id)
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister_read_ahead_cb(&self, id: ReadAheadCbId) -> Result<bool, SerializerError> {
        let mut inner = self.shared.lock()?;
        let before = inner.read_ahead.len();
        inner.read_ahead.retain(|(cb_id, _)| *cb_id != id);
        Ok(inner.read_ahead.len() != before)
    }

    // --------------------------------------------------------------------------------------------
    // Index queries
    // --------------------------------------------------------------------------------------------

    /// One past the highest block id ever written.
    pub fn max_block_id(&self) -> Result<u64, SerializerError> {
        Ok(self.shared.lock_ready()?.lba.max_block_id())
    }

    /// Recency of the block's last committed write, or [`INVALID_RECENCY`].
    pub fn get_recency(&self, block_id: u64) -> Result<Recency, SerializerError> {
        Ok(self.shared.lock_ready()?.lba.get_recency(block_id))
    }

    /// `true` if the block is deleted or was never written.
    pub fn get_delete_bit(&self, block_id: u64) -> Result<bool, SerializerError> {
        Ok(self.shared.lock_ready()?.lba.get_delete_bit(block_id))
    }

    /// Token for the committed version of `block_id`, if it is live.
    pub fn index_read(&self, block_id: u64) -> Result<Option<BlockToken>, SerializerError> {
        let mut guard = self.shared.lock_ready()?;
        let inner = &mut *guard;
        Ok(inner.lba.lookup(block_id).map(|location| {
            inner
                .registry
                .generate(location.offset, block_id, location.size, None)
        }))
    }

    pub fn state(&self) -> SerializerState {
        match self.shared.inner.lock() {
            Ok(inner) => inner.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Block reads
    // --------------------------------------------------------------------------------------------

    /// Reads the payload referenced by `token`.
    ///
    /// When read-ahead is enabled and callbacks are registered, the whole
    /// extent is fetched and the other live blocks in it are offered to the
    /// callbacks.
    pub fn block_read(
        &self,
        token: &BlockToken,
        account: &IoAccount,
    ) -> Result<Vec<u8>, SerializerError> {
        token.wait_written().map_err(|e| {
            let e = SerializerError::IoPool(e);
            self.shared.fail(&e);
            e
        })?;

        let (offset, pin, read_ahead) = {
            let mut inner = self.shared.lock_ready()?;
            let offset = inner.registry.offset_of(token)?;
            let pin = inner.registry.pin(offset);
            let read_ahead = self.shared.config.read_ahead && !inner.read_ahead.is_empty();
            (offset, pin, read_ahead)
        };

        if read_ahead {
            return self.read_with_read_ahead(token, offset, pin, account);
        }

        let file = Arc::clone(&self.shared.file);
        let size = token.size();
        let done = self.shared.pool.submit(account, move || {
            let result = data_block::read_block(&file, offset, size).map(|(_, payload)| payload);
            drop(pin);
            result.map_err(into_io_error)
        })?;
        let payload = self.shared.check(done.take().map_err(SerializerError::from))?;
        self.shared.counters.record_read(payload.len());
        Ok(payload)
    }

    fn read_with_read_ahead(
        &self,
        token: &BlockToken,
        offset: u64,
        pin: crate::token::OffsetPin,
        account: &IoAccount,
    ) -> Result<Vec<u8>, SerializerError> {
        let geometry = self.shared.geometry;
        let extent = offset - offset % geometry.extent_size();
        let file = Arc::clone(&self.shared.file);
        let done = self.shared.pool.submit(account, move || {
            let raw = file.read_at(extent, geometry.extent_size() as usize);
            drop(pin);
            raw
        })?;
        let raw = self.shared.check(done.take().map_err(SerializerError::from))?;

        let slot_size = geometry.slot_size() as usize;
        let at = (offset - extent) as usize;
        let (header, payload) = self
            .shared
            .check(data_block::decode_block(offset, &raw[at..at + slot_size]).map_err(Into::into))?;
        if header.payload_len != token.size() {
            let e = SerializerError::DataBlock(DataBlockError::Corrupt {
                offset,
                reason: "payload length does not match token".into(),
            });
            self.shared.fail(&e);
            return Err(e);
        }

        let (offers, callbacks) = {
            let mut guard = self.shared.lock_ready()?;
            let inner = &mut *guard;
            let mut offers = Vec::new();
            for (i, slot_offset) in inner.data.slot_offsets(extent).enumerate() {
                if slot_offset == offset || !inner.data.is_index_live(slot_offset) {
                    continue;
                }
                let start = i * slot_size;
                let Ok((header, buf)) =
                    data_block::decode_block(slot_offset, &raw[start..start + slot_size])
                else {
                    continue;
                };
                let Some(location) = inner.lba.lookup(header.block_id) else {
                    continue;
                };
                if location.offset != slot_offset {
                    continue;
                }
                let token =
                    inner
                        .registry
                        .generate(slot_offset, header.block_id, location.size, None);
                offers.push((header.block_id, buf, token, location.recency));
            }
            let callbacks: Vec<Arc<dyn ReadAheadCallback>> =
                inner.read_ahead.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (offers, callbacks)
        };

        self.shared.counters.record_read(payload.len());
        for (block_id, buf, token, recency) in offers {
            self.shared.counters.record_read_ahead_offer();
            for cb in &callbacks {
                if cb.offer_read_ahead_buf(block_id, &buf, &token, recency) {
                    break;
                }
            }
        }
        Ok(payload)
    }

    // --------------------------------------------------------------------------------------------
    // Block writes
    // --------------------------------------------------------------------------------------------

    /// Writes each payload to a fresh slot and returns one token per write.
    ///
    /// Returns as soon as the writes are queued; wait on a token with
    /// [`BlockToken::wait_written`]. The blocks only become visible through
    /// the index once an index write installs the tokens.
    pub fn block_writes(
        &self,
        writes: &[BufWriteInfo],
        account: &IoAccount,
    ) -> Result<Vec<BlockToken>, SerializerError> {
        let mut tokens = Vec::with_capacity(writes.len());
        let mut jobs = Vec::with_capacity(writes.len());
        {
            let mut guard = self.shared.lock_ready()?;
            let inner = &mut *guard;

            let mut lengths = Vec::with_capacity(writes.len());
            for write in writes {
                check_block_id(write.block_id)?;
                lengths.push(inner.data.check_payload(write.data.len())?);
            }

            for (write, len) in writes.iter().zip(lengths) {
                let offset = self.shared.check(
                    inner
                        .data
                        .allocate_slot(&mut inner.extents, &self.shared.file)
                        .map_err(SerializerError::from),
                )?;
                let header = BlockHeader {
                    block_id: write.block_id,
                    block_sequence_id: inner.next_sequence(),
                    payload_len: len,
                };
                let image = data_block::encode_block(&header, &write.data)?;
                let signal = Arc::new(IoSignal::new());
                tokens.push(inner.registry.generate(
                    offset,
                    write.block_id,
                    len,
                    Some(Arc::clone(&signal)),
                ));
                let pin = inner.registry.pin(offset);
                jobs.push((offset, image, signal, pin, len as usize));
            }
        }

        for (offset, image, signal, pin, len) in jobs {
            let file = Arc::clone(&self.shared.file);
            let failed = Arc::clone(&self.shared.failed);
            let counters = Arc::clone(&self.shared.counters);
            let done = Arc::clone(&signal);
            let submitted = self.shared.pool.submit_into(account, signal, move || {
                let result = file.write_at(offset, &image);
                match &result {
                    Ok(()) => counters.record_write(len),
                    Err(e) => {
                        if !failed.swap(true, Ordering::AcqRel) {
                            error!(offset, error = %e, "block write failed, serializer halted");
                        }
                    }
                }
                drop(pin);
                result
            });
            if let Err(e) = submitted {
                done.finish(Err(e.to_string()));
                return Err(e.into());
            }
        }
        Ok(tokens)
    }

    // --------------------------------------------------------------------------------------------
    // Index writes
    // --------------------------------------------------------------------------------------------

    /// Queues an index-write transaction behind every earlier one.
    pub fn submit_index_write(
        &self,
        ops: Vec<IndexWriteOp>,
    ) -> Result<CommitHandle, SerializerError> {
        for op in &ops {
            check_block_id(op.block_id)?;
        }
        drop(self.shared.lock_ready()?);

        let done: Arc<IoCompletion<txn::Outcome<u64>>> = Arc::new(IoCompletion::new());
        let queue = self
            .queue
            .lock()
            .map_err(|_| SerializerError::Internal("Mutex poisoned".into()))?;
        let sender = queue
            .as_ref()
            .ok_or(SerializerError::NotReady(SerializerState::ShuttingDown))?;
        sender
            .send(CommitRequest::Txn(txn::Transaction {
                ops,
                done: Arc::clone(&done),
            }))
            .map_err(|_| SerializerError::NotReady(SerializerState::ShuttingDown))?;
        Ok(CommitHandle::new(done))
    }

    /// Commits `ops` atomically and waits until the metablock is durable.
    /// Returns the block sequence id of that metablock.
    pub fn index_write(&self, ops: Vec<IndexWriteOp>) -> Result<u64, SerializerError> {
        self.submit_index_write(ops)?.wait()
    }

    /// Writes the payloads of `ops`, then commits all of them as one
    /// transaction stamped with `recency`. Returns without waiting.
    pub fn write_batch(
        &self,
        ops: Vec<BatchOp>,
        recency: Recency,
        account: &IoAccount,
    ) -> Result<PendingBatch, SerializerError> {
        let writes: Vec<BufWriteInfo> = ops
            .iter()
            .filter_map(|op| match op {
                BatchOp::Write { block_id, data } => Some(BufWriteInfo {
                    block_id: *block_id,
                    data: data.clone(),
                }),
                BatchOp::Delete { .. } => None,
            })
            .collect();
        let tokens = self.block_writes(&writes, account)?;

        let mut written = tokens.iter();
        let mut index_ops = Vec::with_capacity(ops.len());
        for op in &ops {
            let index_op = match op {
                BatchOp::Write { block_id, .. } => {
                    let token = written.next().ok_or_else(|| {
                        SerializerError::InvariantViolation("missing token for write".into())
                    })?;
                    IndexWriteOp::set(*block_id, token.clone(), recency)
                }
                BatchOp::Delete { block_id } => IndexWriteOp::delete(*block_id, recency),
            };
            index_ops.push(index_op);
        }

        let commit = self.submit_index_write(index_ops)?;
        Ok(PendingBatch { tokens, commit })
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Runs one garbage collection pass on the commit thread and waits for it.
    pub fn run_gc(&self) -> Result<GcStats, SerializerError> {
        drop(self.shared.lock_ready()?);
        let done: Arc<IoCompletion<txn::Outcome<GcStats>>> = Arc::new(IoCompletion::new());
        {
            let queue = self
                .queue
                .lock()
                .map_err(|_| SerializerError::Internal("Mutex poisoned".into()))?;
            let sender = queue
                .as_ref()
                .ok_or(SerializerError::NotReady(SerializerState::ShuttingDown))?;
            sender
                .send(CommitRequest::Gc(Arc::clone(&done)))
                .map_err(|_| SerializerError::NotReady(SerializerState::ShuttingDown))?;
        }
        match done.take() {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(e)) => Err(txn::resurface(&e)),
            Err(e) => Err(SerializerError::CommitFailed(e.to_string())),
        }
    }

    /// Returns a snapshot of serializer statistics.
    ///
    /// I/O and commit totals count since the store was opened; the space
    /// figures describe the committed state right now.
    pub fn stats(&self) -> Result<SerializerStats, SerializerError> {
        let inner = self.shared.lock_ready()?;
        Ok(SerializerStats {
            total_extents: inner.extents.extent_count(),
            data_extents: inner.data.extent_count() as u64,
            lba_extents: inner.lba.owned_extents().len() as u64,
            live_blocks: inner.lba.live_entries(),
            garbage_ratio: inner.data.garbage_ratio(),
            ..self.shared.counters.snapshot()
        })
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    /// Leaves `Ready` and hands the queue and commit thread to the caller.
    fn enter_shutdown(
        &self,
    ) -> Result<(Option<Sender<CommitRequest>>, Option<thread::JoinHandle<()>>), SerializerError>
    {
        {
            let mut inner = self.shared.lock()?;
            if inner.state != SerializerState::Ready {
                return Err(SerializerError::NotReady(inner.state));
            }
            inner.state.advance(SerializerState::ShuttingDown)?;
        }
        let queue = match self.queue.lock() {
            Ok(mut q) => q.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let committer = match self.committer.lock() {
            Ok(mut c) => c.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        info!("serializer shutting down");
        Ok((queue, committer))
    }

    /// Starts shutting down in the background and returns a handle to wait on.
    pub fn begin_shutdown(&self) -> Result<ShutdownHandle, SerializerError> {
        let (queue, committer) = self.enter_shutdown()?;
        let machine = ShutdownMachine::new();
        let state = machine.shared_state();
        let done = Arc::new(IoSignal::new());

        let shared = Arc::clone(&self.shared);
        let finished = Arc::clone(&done);
        let worker = thread::Builder::new()
            .name("logser-shutdown".into())
            .spawn(move || {
                let result = run_shutdown(&shared, queue, committer, machine, true);
                finished.finish(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                result
            })
            .expect("failed to spawn shutdown thread");

        Ok(ShutdownHandle::new(state, done, worker))
    }

    /// Shuts down on the calling thread, running every step as one chain.
    pub fn shutdown(&self) -> Result<(), SerializerError> {
        let (queue, committer) = self.enter_shutdown()?;
        run_shutdown(&self.shared, queue, committer, ShutdownMachine::new(), true)
    }
}

impl Drop for LogSerializer {
    fn drop(&mut self) {
        if self.state() != SerializerState::Ready {
            return;
        }
        let Ok((queue, committer)) = self.enter_shutdown() else {
            return;
        };
        if let Err(e) = run_shutdown(&self.shared, queue, committer, ShutdownMachine::new(), false)
        {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

/// Runs the shutdown chain. `wait_for_tokens == false` skips waiting for
/// outstanding block tokens.
fn run_shutdown(
    shared: &Shared,
    queue: Option<Sender<CommitRequest>>,
    committer: Option<thread::JoinHandle<()>>,
    mut machine: ShutdownMachine,
    wait_for_tokens: bool,
) -> Result<(), SerializerError> {
    machine.expect(ShutdownState::Begin)?;
    machine.advance();

    // Closing the queue lets the commit thread drain what is already queued.
    drop(queue);
    if let Some(committer) = committer {
        committer
            .join()
            .map_err(|_| SerializerError::Internal("commit thread panicked".into()))?;
    }
    machine.expect(ShutdownState::WaitingOnSerializer)?;
    machine.on_shutdown_complete();

    shared.pool.shutdown();
    shared.lock()?.data.shutdown(&mut machine)?;

    machine.expect(ShutdownState::WaitingOnBlockTokens)?;
    let releases = shared.lock()?.registry.release_receiver();
    loop {
        let outstanding = {
            let mut inner = shared.lock()?;
            inner.registry.live_tokens() + inner.registry.live_pins()
        };
        if outstanding == 0 {
            break;
        }
        if !wait_for_tokens {
            warn!(outstanding, "block tokens still held at shutdown");
            break;
        }
        if let Ok(msg) = releases.recv_timeout(TOKEN_WAIT_POLL) {
            shared.lock()?.registry.apply(msg);
        }
    }
    machine.on_shutdown_complete();

    {
        let mut inner = shared.lock()?;
        if !shared.failed.load(Ordering::Acquire) {
            shared.file.sync()?;
        }
        inner.lba.shutdown(&mut machine);
        machine.expect(ShutdownState::Done)?;
        inner.state.advance(SerializerState::ShutDown)?;
    }
    info!("serializer shut down");
    Ok(())
}

fn check_block_id(block_id: u64) -> Result<(), SerializerError> {
    if block_id >= MAX_BLOCK_ID {
        return Err(SerializerError::InvalidOperation(format!(
            "block id {block_id} exceeds {MAX_BLOCK_ID}"
        )));
    }
    Ok(())
}

fn into_io_error(e: DataBlockError) -> io::Error {
    match e {
        DataBlockError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}
