//! # Block Token Registry
//!
//! A [`BlockToken`] is a shared handle binding one logical block to the
//! physical slot its bytes live in. Tokens are handed out by
//! `index_read` and `block_writes` and are the only way to read a block's
//! payload.
//!
//! ## Representation
//!
//! The registry keeps an arena of slots addressed by generation-checked
//! [`TokenKey`]s, plus a multimap from file offset to the keys bound there.
//! A token never stores its offset; it is resolved through the registry on
//! every use, so [`TokenRegistry::remap`] (called when garbage collection
//! moves a block) transparently redirects every outstanding token.
//!
//! ## Release
//!
//! Cloning a `BlockToken` shares one handle. When the last clone is dropped
//! the handle posts a [`Release`] message on a lock-free channel instead of
//! touching the registry, so dropping a token never needs the serializer
//! lock. The registry drains that channel before answering any liveness
//! question ([`TokenRegistry::tokens_exist_for`]).
//!
//! ## Pins
//!
//! A read in flight pins the offset it reads ([`OffsetPin`]). Pins count as
//! references, so an extent cannot be reclaimed under a read even if GC
//! remaps the token while the read is outstanding.


use crate::io::IoSignal;
use crossbeam::channel::{self, Receiver, Sender};
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;
use tracing::trace;

/// Errors returned by the token registry.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token's slot was released and reused; the handle is stale.
    #[error("Stale block token {0:?}")]
    Stale(TokenKey),

    /// The token was issued by a different registry.
    #[error("Block token does not belong to this registry")]
    ForeignToken,
}

/// Arena address of a token: slot index plus the generation it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenKey {
    index: u32,
    generation: u32,
}

/// Message posted when a token handle or a pin is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Token(TokenKey),
    Unpin(u64),
}

// ------------------------------------------------------------------------------------------------
// Handles
// ------------------------------------------------------------------------------------------------

struct TokenHandle {
    key: TokenKey,
    registry_id: u64,
    block_id: u64,
    size: u32,
    write_done: Option<Arc<IoSignal>>,
    release: Sender<Release>,
}

impl Drop for TokenHandle {
    fn drop(&mut self) {
        // The receiver is gone once the serializer itself has been dropped.
        let _ = self.release.send(Release::Token(self.key));
    }
}

/// Shared handle to a block's physical location.
#[derive(Clone)]
pub struct BlockToken {
    handle: Arc<TokenHandle>,
}

impl BlockToken {
    pub fn key(&self) -> TokenKey {
        self.handle.key
    }

    /// Block id the token was issued for.
    pub fn block_id(&self) -> u64 {
        self.handle.block_id
    }

    /// Payload length of the referenced block.
    pub fn size(&self) -> u32 {
        self.handle.size
    }

    /// Blocks until the payload write behind this token (if any) is on disk.
    pub fn wait_written(&self) -> Result<(), crate::io::IoError> {
        match &self.handle.write_done {
            Some(signal) => signal.wait(),
            None => Ok(()),
        }
    }

    /// Returns `true` unless a payload write is still in flight.
    pub fn is_written(&self) -> bool {
        self.handle
            .write_done
            .as_ref()
            .is_none_or(|signal| signal.is_complete())
    }

    /// Number of live clones of this handle.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.handle)
    }
}

impl fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockToken")
            .field("key", &self.handle.key)
            .field("block_id", &self.handle.block_id)
            .field("size", &self.handle.size)
            .finish()
    }
}

/// Keeps an offset referenced while a read of it is in flight.
#[derive(Debug)]
pub struct OffsetPin {
    offset: u64,
    release: Sender<Release>,
}

impl OffsetPin {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Drop for OffsetPin {
    fn drop(&mut self) {
        let _ = self.release.send(Release::Unpin(self.offset));
    }
}

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    generation: u32,
    offset: Option<u64>,
}

#[derive(Debug)]
pub struct TokenRegistry {
    id: u64,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    by_offset: HashMap<u64, Vec<TokenKey>>,
    pins: HashMap<u64, usize>,
    live: usize,
    release_tx: Sender<Release>,
    release_rx: Receiver<Release>,
}

static NEXT_REGISTRY_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl TokenRegistry {
    pub fn new() -> Self {
        let (release_tx, release_rx) = channel::unbounded();
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            slots: Vec::new(),
            vacant: Vec::new(),
            by_offset: HashMap::new(),
            pins: HashMap::new(),
            live: 0,
            release_tx,
            release_rx,
        }
    }

    /// Issues a token bound to `offset`.
    pub fn generate(
        &mut self,
        offset: u64,
        block_id: u64,
        size: u32,
        write_done: Option<Arc<IoSignal>>,
    ) -> BlockToken {
        let key = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.offset = Some(offset);
                TokenKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    offset: Some(offset),
                });
                TokenKey {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_offset.entry(offset).or_default().push(key);
        self.live += 1;
        trace!(offset, block_id, ?key, "block token generated");

        BlockToken {
            handle: Arc::new(TokenHandle {
                key,
                registry_id: self.id,
                block_id,
                size,
                write_done,
                release: self.release_tx.clone(),
            }),
        }
    }

    /// Current offset of `token`.
    pub fn offset_of(&self, token: &BlockToken) -> Result<u64, TokenError> {
        if token.handle.registry_id != self.id {
            return Err(TokenError::ForeignToken);
        }
        let key = token.handle.key;
        match self.slots.get(key.index as usize) {
            Some(slot) if slot.generation == key.generation => {
                slot.offset.ok_or(TokenError::Stale(key))
            }
            _ => Err(TokenError::Stale(key)),
        }
    }

    /// Pins `offset` until the returned guard is dropped.
    pub fn pin(&mut self, offset: u64) -> OffsetPin {
        *self.pins.entry(offset).or_insert(0) += 1;
        OffsetPin {
            offset,
            release: self.release_tx.clone(),
        }
    }

    /// Rebinds every token at `old_offset` to `new_offset`. Pins stay where they are.
    pub fn remap(&mut self, old_offset: u64, new_offset: u64) {
        self.drain_releases();
        let Some(keys) = self.by_offset.remove(&old_offset) else {
            return;
        };
        for key in &keys {
            self.slots[key.index as usize].offset = Some(new_offset);
        }
        trace!(old_offset, new_offset, tokens = keys.len(), "block tokens remapped");
        self.by_offset.entry(new_offset).or_default().extend(keys);
    }

    /// Whether any token or pin still references `offset`.
    pub fn tokens_exist_for(&mut self, offset: u64) -> bool {
        self.drain_releases();
        self.by_offset.contains_key(&offset) || self.pins.contains_key(&offset)
    }

    /// Outstanding tokens (pins excluded).
    pub fn live_tokens(&mut self) -> usize {
        self.drain_releases();
        self.live
    }

    /// Outstanding pins.
    pub fn live_pins(&mut self) -> usize {
        self.drain_releases();
        self.pins.values().sum()
    }

    /// Receiver end of the release channel, for waiting without holding the
    /// registry. Messages taken from it must be passed to [`apply`](Self::apply).
    pub fn release_receiver(&self) -> Receiver<Release> {
        self.release_rx.clone()
    }

    /// Applies every queued release message.
    pub fn drain_releases(&mut self) {
        while let Ok(msg) = self.release_rx.try_recv() {
            self.apply(msg);
        }
    }

    pub fn apply(&mut self, msg: Release) {
        match msg {
            Release::Token(key) => self.release_token(key),
            Release::Unpin(offset) => {
                if let Some(count) = self.pins.get_mut(&offset) {
                    *count -= 1;
                    if *count == 0 {
                        self.pins.remove(&offset);
                    }
                }
            }
        }
    }

    fn release_token(&mut self, key: TokenKey) {
        let slot = &mut self.slots[key.index as usize];
        if slot.generation != key.generation {
            return;
        }
        let Some(offset) = slot.offset.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(key.index);
        self.live -= 1;

        if let Some(keys) = self.by_offset.get_mut(&offset) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_offset.remove(&offset);
            }
        }
        trace!(offset, ?key, "block token released");
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}
