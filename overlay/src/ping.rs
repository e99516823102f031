//! Service-node liveness pings

use crate::error::{OverlayError, Result};
use crate::node::{ServiceNode, EXPIRATION_SECONDS, MIN_PING_SECONDS, PING_MAX_BLOCK_AGE};
use meridian_core::{BlockHash, ChainView, Hash256, OutPoint, SyncFlags};
use meridian_crypto::KeyPair;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How far below the tip the referenced block sits when a ping is built
pub const PING_BLOCK_DEPTH: u64 = 12;

/// Signed liveness message carrying a recent block hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub outpoint: OutPoint,
    /// Hash of the block at `tip - 12` when the ping was created
    pub block_hash: BlockHash,
    pub sign_time: i64,
    pub signature: String,
}

impl Ping {
    /// Build an unsigned ping for the current tip; `None` before height 12
    pub fn create(outpoint: OutPoint, chain: &dyn ChainView, now: i64) -> Option<Self> {
        let tip = chain.tip_height()?;
        if tip < PING_BLOCK_DEPTH {
            return None;
        }
        let block_hash = chain.block_hash(tip - PING_BLOCK_DEPTH)?;
        Some(Self {
            outpoint,
            block_hash,
            sign_time: now,
            signature: String::new(),
        })
    }

    fn canonical(&self) -> String {
        format!("{}{}{}", self.outpoint, self.block_hash, self.sign_time)
    }

    pub fn hash(&self) -> Hash256 {
        Hash256(meridian_crypto::hash256(
            format!("{}{}", self.outpoint, self.sign_time).as_bytes(),
        ))
    }

    pub fn sign(&mut self, node_key: &KeyPair, now: i64) {
        self.sign_time = now;
        self.signature = node_key.sign_message(&self.canonical());
    }

    pub fn check_signature(&self, node_pubkey: &str) -> Result<()> {
        meridian_crypto::verify_message(node_pubkey, &self.canonical(), &self.signature).map_err(
            |_| {
                OverlayError::validation(
                    format!("bad ping signature, servicenode={}", self.outpoint),
                    33,
                )
            },
        )
    }

    /// Stateless checks: sign time not in the future, block hash known
    pub fn simple_check(&self, chain: &dyn ChainView, now: i64) -> Result<()> {
        if self.sign_time > now + 60 * 60 {
            return Err(OverlayError::validation(
                format!("ping signature too far in the future, servicenode={}", self.outpoint),
                1,
            ));
        }
        if chain.block_height(&self.block_hash).is_none() {
            // we may be stuck or forked; reject without penalty
            return Err(OverlayError::validation(
                format!("ping references unknown block, servicenode={}", self.outpoint),
                0,
            ));
        }
        Ok(())
    }

    /// Full validation against a known record; on success the record's
    /// `last_ping` is replaced and the caller re-checks and relays.
    pub fn check_and_update(
        &self,
        node: &mut ServiceNode,
        from_new_announcement: bool,
        chain: &dyn ChainView,
        flags: &SyncFlags,
        now: i64,
    ) -> Result<()> {
        self.simple_check(chain, now)?;

        if !from_new_announcement {
            if node.is_update_required() {
                return Err(OverlayError::validation(
                    format!("servicenode protocol is outdated, servicenode={}", self.outpoint),
                    0,
                ));
            }
            if node.is_new_start_required() {
                return Err(OverlayError::validation(
                    format!("servicenode is completely expired, servicenode={}", self.outpoint),
                    0,
                ));
            }
        }

        if let (Some(height), Some(tip)) =
            (chain.block_height(&self.block_hash), chain.tip_height())
        {
            if height < tip.saturating_sub(PING_MAX_BLOCK_AGE) {
                return Err(OverlayError::validation(
                    format!("ping block hash is too old, servicenode={}", self.outpoint),
                    0,
                ));
            }
        }

        // drop pings arriving well inside the regular interval
        if node.is_pinged_within(MIN_PING_SECONDS - 60, self.sign_time) {
            return Err(OverlayError::Duplicate("ping arrived too early"));
        }

        self.check_signature(&node.node_pubkey)?;

        // a fresh ping for a long-quiet record while the list is still
        // syncing buys the sync stage more time
        if !flags.is_list_synced() && !node.is_pinged_within(EXPIRATION_SECONDS / 2, now) {
            debug!(servicenode = %self.outpoint, "bumping sync timeout");
            flags.note_list_progress(now);
        }

        debug!(servicenode = %self.outpoint, sign_time = self.sign_time, "ping accepted");
        node.last_ping = Some(self.clone());
        Ok(())
    }
}
