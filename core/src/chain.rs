//! Chain adapter
//!
//! The overlay is a soft layer on top of the chain engine: it looks up
//! UTXOs, historical block hashes and the tip, and receives tip-update
//! notifications. `ChainView` is the read-only seam; `ChainState` is the
//! in-memory implementation backing tests and the daemon skeleton.
//!
//! Lock order: chain state owns its own lock and overlay managers always
//! query it *before* taking their own locks, never while holding them.

use crate::types::{Amount, BlockHash, OutPoint, PayScript, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Unspent output as seen by the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub value: Amount,
    /// Height of the block the output was confirmed in
    pub height: u64,
    /// Script the output is locked to
    pub script: PayScript,
}

pub trait ChainView: Send + Sync {
    /// Height of the active tip, `None` before genesis
    fn tip_height(&self) -> Option<u64>;

    fn block_hash(&self, height: u64) -> Option<BlockHash>;

    fn block_time(&self, height: u64) -> Option<i64>;

    /// Height of a known block hash
    fn block_height(&self, hash: &BlockHash) -> Option<u64>;

    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo>;

    /// Coinbase transaction of the block at `height`, when available
    fn coinbase(&self, height: u64) -> Option<Transaction>;

    /// Whether the chain engine considers initial block download finished
    fn is_synced(&self) -> bool;

    /// Confirmations of an output, by its recorded height
    fn confirmations(&self, outpoint: &OutPoint) -> Option<u64> {
        let utxo = self.utxo(outpoint)?;
        let tip = self.tip_height()?;
        Some(tip.saturating_sub(utxo.height) + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockEntry {
    hash: BlockHash,
    time: i64,
    coinbase: Option<Transaction>,
}

#[derive(Debug, Default)]
struct ChainInner {
    blocks: Vec<BlockEntry>,
    heights: HashMap<BlockHash, u64>,
    utxos: HashMap<OutPoint, Utxo>,
    synced: bool,
}

/// In-memory chain state
#[derive(Debug, Default)]
pub struct ChainState {
    inner: RwLock<ChainInner>,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ChainInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ChainInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a block; returns its height
    pub fn push_block(&self, hash: BlockHash, time: i64) -> u64 {
        self.push_block_with_coinbase(hash, time, None)
    }

    pub fn push_block_with_coinbase(
        &self,
        hash: BlockHash,
        time: i64,
        coinbase: Option<Transaction>,
    ) -> u64 {
        let mut inner = self.write();
        let height = inner.blocks.len() as u64;
        inner.heights.insert(hash, height);
        inner.blocks.push(BlockEntry {
            hash,
            time,
            coinbase,
        });
        height
    }

    pub fn add_utxo(&self, outpoint: OutPoint, utxo: Utxo) {
        self.write().utxos.insert(outpoint, utxo);
    }

    pub fn spend_utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.write().utxos.remove(outpoint)
    }

    pub fn set_synced(&self, synced: bool) {
        self.write().synced = synced;
    }

    /// Disconnect blocks above `height`, as a reorg would
    pub fn truncate_to(&self, height: u64) {
        let mut inner = self.write();
        let keep = (height + 1) as usize;
        while inner.blocks.len() > keep {
            if let Some(entry) = inner.blocks.pop() {
                inner.heights.remove(&entry.hash);
            }
        }
    }
}

impl ChainView for ChainState {
    fn tip_height(&self) -> Option<u64> {
        let inner = self.read();
        inner.blocks.len().checked_sub(1).map(|h| h as u64)
    }

    fn block_hash(&self, height: u64) -> Option<BlockHash> {
        self.read().blocks.get(height as usize).map(|b| b.hash)
    }

    fn block_time(&self, height: u64) -> Option<i64> {
        self.read().blocks.get(height as usize).map(|b| b.time)
    }

    fn block_height(&self, hash: &BlockHash) -> Option<u64> {
        self.read().heights.get(hash).copied()
    }

    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.read().utxos.get(outpoint).cloned()
    }

    fn coinbase(&self, height: u64) -> Option<Transaction> {
        self.read()
            .blocks
            .get(height as usize)
            .and_then(|b| b.coinbase.clone())
    }

    fn is_synced(&self) -> bool {
        self.read().synced
    }
}
