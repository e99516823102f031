//! Shared synchronization state
//!
//! The staged bootstrap is driven by the sync coordinator, but nearly every
//! overlay subsystem gates behavior on "how synced are we" and bumps the
//! coordinator's progress timestamps when fresh data arrives. `SyncFlags`
//! is that shared surface: plain atomics, readable from any thread without
//! touching the coordinator's lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

/// Assets fetched during staged sync, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAsset {
    Initial,
    Sporks,
    List,
    Votes,
    Finished,
    Failed,
}

impl SyncAsset {
    pub fn code(self) -> u32 {
        match self {
            SyncAsset::Initial => 0,
            SyncAsset::Sporks => 1,
            SyncAsset::List => 2,
            SyncAsset::Votes => 3,
            SyncAsset::Finished => 999,
            SyncAsset::Failed => u32::MAX,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => SyncAsset::Initial,
            1 => SyncAsset::Sporks,
            2 => SyncAsset::List,
            3 => SyncAsset::Votes,
            999 => SyncAsset::Finished,
            _ => SyncAsset::Failed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncAsset::Initial => "SYNC_INITIAL",
            SyncAsset::Sporks => "SYNC_SPORKS",
            SyncAsset::List => "SYNC_LIST",
            SyncAsset::Votes => "SYNC_VOTES",
            SyncAsset::Finished => "SYNC_FINISHED",
            SyncAsset::Failed => "SYNC_FAILED",
        }
    }
}

#[derive(Debug)]
pub struct SyncFlags {
    blockchain_synced: AtomicBool,
    asset: AtomicU32,
    last_list_progress: AtomicI64,
    last_vote_progress: AtomicI64,
}

impl SyncFlags {
    pub fn new() -> Self {
        Self {
            blockchain_synced: AtomicBool::new(false),
            asset: AtomicU32::new(SyncAsset::Initial.code()),
            last_list_progress: AtomicI64::new(0),
            last_vote_progress: AtomicI64::new(0),
        }
    }

    pub fn asset(&self) -> SyncAsset {
        SyncAsset::from_code(self.asset.load(Ordering::SeqCst))
    }

    pub fn set_asset(&self, asset: SyncAsset) {
        self.asset.store(asset.code(), Ordering::SeqCst);
    }

    pub fn is_blockchain_synced(&self) -> bool {
        self.blockchain_synced.load(Ordering::SeqCst)
    }

    pub fn set_blockchain_synced(&self, synced: bool) {
        self.blockchain_synced.store(synced, Ordering::SeqCst);
    }

    /// The node list stage is behind us
    pub fn is_list_synced(&self) -> bool {
        matches!(self.asset(), SyncAsset::Votes | SyncAsset::Finished)
    }

    /// The payment-vote stage is behind us
    pub fn is_winners_synced(&self) -> bool {
        matches!(self.asset(), SyncAsset::Finished)
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.asset(), SyncAsset::Finished)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.asset(), SyncAsset::Failed)
    }

    /// Record that a fresh list item arrived (bumps the list timeout)
    pub fn note_list_progress(&self, now: i64) {
        self.last_list_progress.store(now, Ordering::SeqCst);
    }

    pub fn note_vote_progress(&self, now: i64) {
        self.last_vote_progress.store(now, Ordering::SeqCst);
    }

    pub fn last_list_progress(&self) -> i64 {
        self.last_list_progress.load(Ordering::SeqCst)
    }

    pub fn last_vote_progress(&self) -> i64 {
        self.last_vote_progress.load(Ordering::SeqCst)
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_codes_round_trip() {
        for asset in [
            SyncAsset::Initial,
            SyncAsset::Sporks,
            SyncAsset::List,
            SyncAsset::Votes,
            SyncAsset::Finished,
            SyncAsset::Failed,
        ] {
            assert_eq!(SyncAsset::from_code(asset.code()), asset);
        }
    }

    #[test]
    fn list_synced_only_after_list_stage() {
        let flags = SyncFlags::new();
        assert!(!flags.is_list_synced());
        flags.set_asset(SyncAsset::List);
        assert!(!flags.is_list_synced());
        flags.set_asset(SyncAsset::Votes);
        assert!(flags.is_list_synced());
        assert!(!flags.is_synced());
        flags.set_asset(SyncAsset::Finished);
        assert!(flags.is_synced());
        assert!(flags.is_winners_synced());
    }

    #[test]
    fn failed_is_not_synced() {
        let flags = SyncFlags::new();
        flags.set_asset(SyncAsset::Failed);
        assert!(flags.is_failed());
        assert!(!flags.is_list_synced());
    }
}
