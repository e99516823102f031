//! Per-block payee election
//!
//! The ten best-ranked service nodes for a height each cast one signed vote
//! naming the record that should be paid. A coinbase is valid under
//! enforcement when it pays the payee holding at least six votes exactly
//! the protocol amount; with no clear winner the longest chain is accepted.

use crate::active::ActiveIdentity;
use crate::error::{OverlayError, Result};
use crate::manager::{ServiceNodeManager, RANK_BLOCK_OFFSET};
use crate::message::OverlayMessage;
use crate::spork::{SporkManager, SPORK_PAYMENT_ENFORCEMENT, SPORK_PAYMENT_START};
use meridian_core::{
    BlockHash, ChainView, Clock, Hash256, Network, OutPoint, Params, PayScript, SyncAsset,
    SyncFlags, Transaction, TxOut,
};
use meridian_crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Votes a payee needs before the coinbase must pay it
pub const SIGNATURES_REQUIRED: usize = 6;
/// Rank ceiling for voters
pub const SIGNATURES_TOTAL: usize = 10;
/// Future window for acceptable vote heights
pub const VOTE_FUTURE_LIMIT: u64 = 20;
/// Votes are produced this many blocks ahead of the tip
pub const VOTE_AHEAD: u64 = 5;
/// Payee look-ahead when deciding whether a record is already scheduled
pub const SCHEDULE_LOOKAHEAD: u64 = 8;
const STORAGE_COEFF: f64 = 1.25;
const MIN_BLOCKS_TO_STORE: u64 = 5000;
const PAYMENT_SYNC_TAG: &str = "mnwpaymentsync";

/// One service node's vote for the payee at a height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVote {
    pub voter: OutPoint,
    pub target_height: u64,
    pub payee: PayScript,
    pub signature: String,
}

impl PaymentVote {
    pub fn new(voter: OutPoint, target_height: u64, payee: PayScript) -> Self {
        Self {
            voter,
            target_height,
            payee,
            signature: String::new(),
        }
    }

    fn canonical(&self) -> String {
        format!("{}{}{}", self.voter, self.target_height, self.payee)
    }

    /// Identity is derived from (payee, height, voter)
    pub fn hash(&self) -> Hash256 {
        Hash256(meridian_crypto::hash256(
            format!("{}{}{}", self.payee, self.target_height, self.voter).as_bytes(),
        ))
    }

    pub fn sign(&mut self, node_key: &KeyPair) {
        self.signature = node_key.sign_message(&self.canonical());
    }

    pub fn check_signature(&self, node_pubkey: &str) -> bool {
        meridian_crypto::verify_message(node_pubkey, &self.canonical(), &self.signature).is_ok()
    }
}

/// Vote tally for one payee at one height
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayeeTally {
    pub script: PayScript,
    pub vote_hashes: Vec<Hash256>,
}

impl PayeeTally {
    pub fn votes(&self) -> usize {
        self.vote_hashes.len()
    }
}

/// All payees voted for at one height
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockPayees {
    pub height: u64,
    pub payees: Vec<PayeeTally>,
}

impl BlockPayees {
    fn new(height: u64) -> Self {
        Self {
            height,
            payees: Vec::new(),
        }
    }

    fn add_vote(&mut self, vote: &PaymentVote) {
        for tally in &mut self.payees {
            if tally.script == vote.payee {
                tally.vote_hashes.push(vote.hash());
                return;
            }
        }
        self.payees.push(PayeeTally {
            script: vote.payee.clone(),
            vote_hashes: vec![vote.hash()],
        });
    }

    /// Payee with the most votes
    pub fn best_payee(&self) -> Option<&PayeeTally> {
        self.payees.iter().max_by_key(|tally| tally.votes())
    }

    pub fn has_payee_with_votes(&self, script: &PayScript, required: usize) -> bool {
        self.payees
            .iter()
            .any(|tally| tally.votes() >= required && &tally.script == script)
    }

    /// A transaction is valid when no payee has the required vote count, or
    /// when it pays a qualifying payee exactly `amount`.
    pub fn is_transaction_valid(&self, tx: &Transaction, amount: u64) -> bool {
        let max_votes = self
            .payees
            .iter()
            .map(|tally| tally.votes())
            .max()
            .unwrap_or(0);
        if max_votes < SIGNATURES_REQUIRED {
            // no clear winner; approve whichever chain is longest
            return true;
        }
        let mut possible = Vec::new();
        for tally in &self.payees {
            if tally.votes() >= SIGNATURES_REQUIRED {
                if tx.pays(&tally.script, amount) {
                    return true;
                }
                possible.push(tally.script.to_hex());
            }
        }
        warn!(
            height = self.height,
            payees = %possible.join(","),
            amount,
            "missing required servicenode payment"
        );
        false
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVote {
    vote: PaymentVote,
    verified: bool,
}

#[derive(Default)]
struct PaymentsInner {
    votes: HashMap<Hash256, StoredVote>,
    blocks: BTreeMap<u64, BlockPayees>,
    last_vote: HashMap<OutPoint, u64>,
}

/// Persisted payment state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsSnapshot {
    votes: Vec<StoredVote>,
    last_vote: Vec<(OutPoint, u64)>,
}

pub struct PaymentManager {
    clock: Arc<dyn Clock>,
    chain: Arc<dyn ChainView>,
    params: Params,
    flags: Arc<SyncFlags>,
    sporks: Arc<SporkManager>,
    outbound: Arc<dyn crate::outbound::Outbound>,
    fulfilled: Arc<crate::fulfilled::FulfilledRequestCache>,
    manager: Arc<ServiceNodeManager>,
    identity: Arc<RwLock<Option<ActiveIdentity>>>,
    inner: RwLock<PaymentsInner>,
}

impl PaymentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        chain: Arc<dyn ChainView>,
        params: Params,
        flags: Arc<SyncFlags>,
        sporks: Arc<SporkManager>,
        outbound: Arc<dyn crate::outbound::Outbound>,
        fulfilled: Arc<crate::fulfilled::FulfilledRequestCache>,
        manager: Arc<ServiceNodeManager>,
        identity: Arc<RwLock<Option<ActiveIdentity>>>,
    ) -> Self {
        Self {
            clock,
            chain,
            params,
            flags,
            sporks,
            outbound,
            fulfilled,
            manager,
            identity,
            inner: RwLock::new(PaymentsInner::default()),
        }
    }

    /// Votes are retained for `max(registry_size * 1.25, 5000)` blocks
    pub async fn storage_limit(&self) -> u64 {
        let size = self.manager.count().await as f64;
        ((size * STORAGE_COEFF) as u64).max(MIN_BLOCKS_TO_STORE)
    }

    /// Handle MNWPAYMENTSYNC: stream our future votes to the peer
    pub async fn process_payment_sync(&self, peer: SocketAddr, _count_hint: u32) -> Result<()> {
        if !self.flags.is_synced() {
            return Err(OverlayError::NotReady("not synced, ignoring payment sync"));
        }
        if self.fulfilled.has(peer, PAYMENT_SYNC_TAG).await {
            // asking for the list repeatedly in a short window is no good
            let score = if self.params.network == Network::Testnet {
                0
            } else {
                20
            };
            return Err(OverlayError::validation(
                format!("peer {peer} already asked for payment sync"),
                score,
            ));
        }
        self.fulfilled.mark(peer, PAYMENT_SYNC_TAG).await;
        self.sync_to_peer(peer).await;
        Ok(())
    }

    /// Send only votes for future blocks; older blocks are requested
    /// individually via low-data asks.
    pub async fn sync_to_peer(&self, peer: SocketAddr) {
        let Some(tip) = self.chain.tip_height() else {
            return;
        };
        let to_send: Vec<PaymentVote> = {
            let inner = self.inner.read().await;
            let mut batch = Vec::new();
            for height in tip..tip + VOTE_FUTURE_LIMIT {
                if let Some(block) = inner.blocks.get(&height) {
                    for tally in &block.payees {
                        for hash in &tally.vote_hashes {
                            if let Some(stored) = inner.votes.get(hash) {
                                if stored.verified {
                                    batch.push(stored.vote.clone());
                                }
                            }
                        }
                    }
                }
            }
            batch
        };
        let count = to_send.len() as u32;
        for vote in to_send {
            self.outbound.send(peer, OverlayMessage::PaymentVote(vote));
        }
        self.outbound.send(
            peer,
            OverlayMessage::SyncStatusCount {
                asset: SyncAsset::Votes.code(),
                count,
            },
        );
        info!(%peer, count, "sent payment votes");
    }

    /// Handle an incoming payment vote
    pub async fn process_vote(&self, from: Option<SocketAddr>, vote: PaymentVote) -> Result<()> {
        if !self.flags.is_list_synced() {
            return Err(OverlayError::NotReady("list not synced, ignoring vote"));
        }
        let Some(tip) = self.chain.tip_height() else {
            return Err(OverlayError::ChainUnavailable);
        };
        let hash = vote.hash();

        {
            let mut inner = self.inner.write().await;
            if inner.votes.contains_key(&hash) {
                debug!(height = vote.target_height, "vote seen");
                return Err(OverlayError::Duplicate("payment vote"));
            }
            // remember the vote as unverified first; it is upgraded below
            // once everything checks out
            inner.votes.insert(
                hash,
                StoredVote {
                    vote: vote.clone(),
                    verified: false,
                },
            );
        }

        let first_block = tip.saturating_sub(self.storage_limit().await);
        if vote.target_height < first_block || vote.target_height > tip + VOTE_FUTURE_LIMIT {
            return Err(OverlayError::validation(
                format!(
                    "vote out of range: height {} not in [{}, {}]",
                    vote.target_height,
                    first_block,
                    tip + VOTE_FUTURE_LIMIT
                ),
                0,
            ));
        }

        self.validate_voter(from, &vote, tip).await?;

        // one vote per (voter, height)
        {
            let mut inner = self.inner.write().await;
            match inner.last_vote.get(&vote.voter) {
                Some(&height) if height == vote.target_height => {
                    return Err(OverlayError::Duplicate("voter already voted at this height"));
                }
                _ => {
                    inner.last_vote.insert(vote.voter, vote.target_height);
                }
            }
        }

        let voter = self
            .manager
            .get(&vote.voter)
            .await
            .ok_or(OverlayError::UnknownVoter(vote.voter))?;
        if !vote.check_signature(&voter.node_pubkey) {
            // our record of the voter may be outdated; ask for a refresh,
            // but the vote itself cannot be salvaged
            if let Some(peer) = from {
                self.manager.ask_for_record(peer, vote.voter).await;
            }
            let score = if self.flags.is_list_synced() && vote.target_height > tip {
                20
            } else {
                0
            };
            return Err(OverlayError::validation(
                format!("invalid vote signature from {}", vote.voter),
                score,
            ));
        }

        if !self.add_payment_vote(&vote).await {
            return Err(OverlayError::NotReady("vote block hash not available"));
        }
        debug!(
            payee = %vote.payee,
            height = vote.target_height,
            voter = %vote.voter,
            "payment vote accepted"
        );
        self.flags.note_vote_progress(self.clock.now());
        self.relay_vote(vote).await;
        Ok(())
    }

    async fn validate_voter(
        &self,
        from: Option<SocketAddr>,
        vote: &PaymentVote,
        tip: u64,
    ) -> Result<()> {
        let Some(voter) = self.manager.get(&vote.voter).await else {
            // only ask when synced and we still have no idea about the voter
            if self.flags.is_list_synced() {
                if let Some(peer) = from {
                    self.manager.ask_for_record(peer, vote.voter).await;
                }
            }
            return Err(OverlayError::UnknownVoter(vote.voter));
        };

        let min_proto = self.manager.min_protocol().await;
        if voter.protocol_version < min_proto {
            return Err(OverlayError::validation(
                format!(
                    "voter protocol too old: {} < {}",
                    voter.protocol_version, min_proto
                ),
                0,
            ));
        }

        // Regular clients only verify ranks for future votes; service nodes
        // check everything since they pick winners for upcoming blocks.
        let we_vote = self.identity.read().await.is_some();
        if !we_vote && vote.target_height < tip {
            return Ok(());
        }

        let rank_height = vote.target_height.saturating_sub(RANK_BLOCK_OFFSET);
        let Some(rank) = self.manager.rank(&vote.voter, rank_height).await else {
            debug!(voter = %vote.voter, "cannot calculate voter rank");
            return Err(OverlayError::validation("cannot rank voter", 0));
        };
        if rank as usize > SIGNATURES_TOTAL {
            // nodes mistakenly think they are in the top ten all the time;
            // only score peers pushing votes way out of bounds near the tip
            let score = if rank as usize > SIGNATURES_TOTAL * 2 && vote.target_height > tip {
                20
            } else {
                0
            };
            return Err(OverlayError::validation(
                format!(
                    "voter {} not in the top {} (rank {})",
                    vote.voter, SIGNATURES_TOTAL, rank
                ),
                score,
            ));
        }
        Ok(())
    }

    /// Store a validated vote in the per-height tally
    async fn add_payment_vote(&self, vote: &PaymentVote) -> bool {
        let rank_height = vote.target_height.saturating_sub(RANK_BLOCK_OFFSET);
        if self.chain.block_hash(rank_height).is_none() {
            return false;
        }
        let hash = vote.hash();
        let mut inner = self.inner.write().await;
        if inner
            .votes
            .get(&hash)
            .map(|stored| stored.verified)
            .unwrap_or(false)
        {
            return false;
        }
        inner.votes.insert(
            hash,
            StoredVote {
                vote: vote.clone(),
                verified: true,
            },
        );
        inner
            .blocks
            .entry(vote.target_height)
            .or_insert_with(|| BlockPayees::new(vote.target_height))
            .add_vote(vote);
        true
    }

    async fn relay_vote(&self, vote: PaymentVote) {
        // do not relay until synced; the tally is too incomplete to vouch for
        if !self.flags.is_winners_synced() {
            debug!("winners list not synced, not relaying vote");
            return;
        }
        self.outbound.relay(OverlayMessage::PaymentVote(vote));
    }

    /// Winning payee at a height, if any votes were tallied
    pub async fn get_block_payee(&self, height: u64) -> Option<PayScript> {
        let inner = self.inner.read().await;
        inner
            .blocks
            .get(&height)
            .and_then(|block| block.best_payee())
            .map(|tally| tally.script.clone())
    }

    /// Payee scripts scheduled for payment in the look-ahead window,
    /// excluding `skip_height`.
    pub async fn scheduled_payees(&self, skip_height: Option<u64>) -> HashSet<PayScript> {
        let Some(tip) = self.chain.tip_height() else {
            return HashSet::new();
        };
        let inner = self.inner.read().await;
        let mut scheduled = HashSet::new();
        for height in tip..=tip + SCHEDULE_LOOKAHEAD {
            if Some(height) == skip_height {
                continue;
            }
            if let Some(block) = inner.blocks.get(&height) {
                if let Some(tally) = block.best_payee() {
                    scheduled.insert(tally.script.clone());
                }
            }
        }
        scheduled
    }

    /// Does the tally at `height` list `payee` with at least `required` votes?
    pub async fn has_payee_with_votes(
        &self,
        height: u64,
        payee: &PayScript,
        required: usize,
    ) -> bool {
        let inner = self.inner.read().await;
        inner
            .blocks
            .get(&height)
            .map(|block| block.has_payee_with_votes(payee, required))
            .unwrap_or(false)
    }

    /// Heights near the tip with payees holding at least two votes, used to
    /// refresh last-paid caches.
    pub async fn paid_candidates(&self, max_back: u64) -> HashMap<u64, Vec<PayScript>> {
        let Some(tip) = self.chain.tip_height() else {
            return HashMap::new();
        };
        let floor = tip.saturating_sub(max_back);
        let inner = self.inner.read().await;
        let mut out: HashMap<u64, Vec<PayScript>> = HashMap::new();
        for (&height, block) in inner.blocks.range(floor..=tip) {
            let payees: Vec<PayScript> = block
                .payees
                .iter()
                .filter(|tally| tally.votes() >= 2)
                .map(|tally| tally.script.clone())
                .collect();
            if !payees.is_empty() {
                out.insert(height, payees);
            }
        }
        out
    }

    /// Pure tally check for a coinbase at a height
    pub async fn is_transaction_valid(&self, tx: &Transaction, height: u64) -> bool {
        let inner = self.inner.read().await;
        match inner.blocks.get(&height) {
            Some(block) => block.is_transaction_valid(tx, self.params.servicenode_payment(height)),
            None => true,
        }
    }

    /// Full policy check for a block's coinbase, gated by the kill switches.
    /// Returns `false` only when the block must be rejected.
    pub async fn is_block_payee_valid(&self, tx: &Transaction, height: u64) -> bool {
        if !self.sporks.is_active(SPORK_PAYMENT_START).await {
            // no payee validation yet; accept the longest chain
            return true;
        }
        if !self.flags.is_synced() {
            debug!("not synced, skipping block payee checks");
            return true;
        }
        if self.is_transaction_valid(tx, height).await {
            return true;
        }
        if self.sporks.is_active(SPORK_PAYMENT_ENFORCEMENT).await {
            return false;
        }
        warn!(height, "servicenode payment enforcement is disabled, accepting block");
        true
    }

    /// Add the service-node output to a block template
    pub async fn fill_block_payee(&self, tx: &mut Transaction, height: u64) -> Option<TxOut> {
        let amount = self.params.servicenode_payment(height);
        let payee = match self.get_block_payee(height).await {
            Some(payee) => Some(payee),
            None => {
                // no winner on record; fall back to our own selection
                let scheduled = self.scheduled_payees(Some(height)).await;
                let (candidate, _) = self.manager.next_payee_candidate(height, &scheduled).await;
                candidate.map(|node| node.payee_script())
            }
        };
        let payee = match payee {
            Some(payee) => payee,
            None if self.params.network == Network::Regtest => tx
                .outputs
                .first()
                .map(|out| out.script.clone())?,
            None => {
                warn!(height, "failed to detect servicenode to pay");
                return None;
            }
        };
        let out = TxOut {
            value: amount,
            script: payee,
        };
        tx.outputs.push(out.clone());
        info!(height, amount, payee = %out.script, "servicenode payment filled");
        Some(out)
    }

    /// Cast our vote for the payee at `height` when we rank high enough
    pub async fn process_block(&self, height: u64) -> Result<bool> {
        let Some(identity) = self.identity.read().await.clone() else {
            return Ok(false);
        };
        // with an unsynced winners list our chance to pick the right payee
        // is slim, but without the node list it is zero
        if !self.flags.is_list_synced() {
            return Ok(false);
        }

        let rank_height = height.saturating_sub(RANK_BLOCK_OFFSET);
        let Some(rank) = self.manager.rank(&identity.outpoint, rank_height).await else {
            debug!("own servicenode not ranked, not voting");
            return Ok(false);
        };
        if rank as usize > SIGNATURES_TOTAL {
            debug!(rank, "not in the top {SIGNATURES_TOTAL}, not voting");
            return Ok(false);
        }

        info!(height, "selecting payee to vote for");
        let scheduled = self.scheduled_payees(Some(height)).await;
        let (candidate, _) = self.manager.next_payee_candidate(height, &scheduled).await;
        let Some(candidate) = candidate else {
            warn!(height, "failed to find a servicenode to pay");
            return Ok(false);
        };

        let mut vote = PaymentVote::new(identity.outpoint, height, candidate.payee_script());
        vote.sign(&identity.node_key);
        if self.add_payment_vote(&vote).await {
            info!(height, payee = %vote.payee, "voted");
            self.inner
                .write()
                .await
                .last_vote
                .insert(identity.outpoint, height);
            self.relay_vote(vote).await;
            return Ok(true);
        }
        Ok(false)
    }

    /// Ask a peer for votes on heights we have little data for
    pub async fn request_low_data_blocks(&self, peer: SocketAddr) {
        let Some(tip) = self.chain.tip_height() else {
            return;
        };
        let limit = self.storage_limit().await;
        let floor = tip.saturating_sub(limit);
        let average_votes = (SIGNATURES_TOTAL + SIGNATURES_REQUIRED) / 2;

        let mut to_fetch: Vec<BlockHash> = Vec::new();
        {
            let inner = self.inner.read().await;
            for height in floor..=tip {
                match inner.blocks.get(&height) {
                    None => {
                        if let Some(hash) = self.chain.block_hash(height) {
                            to_fetch.push(hash);
                        }
                    }
                    Some(block) => {
                        let found = block
                            .payees
                            .iter()
                            .any(|tally| tally.votes() >= SIGNATURES_REQUIRED);
                        let total: usize = block.payees.iter().map(|tally| tally.votes()).sum();
                        if !found && total < average_votes {
                            if let Some(hash) = self.chain.block_hash(height) {
                                to_fetch.push(hash);
                            }
                        }
                    }
                }
            }
        }
        if to_fetch.is_empty() {
            return;
        }
        info!(%peer, blocks = to_fetch.len(), "asking for payment blocks");
        self.outbound
            .send(peer, OverlayMessage::GetPaymentBlocks(to_fetch));
    }

    /// Serve a low-data ask: send every verified vote for the named blocks
    pub async fn process_payment_block_request(&self, peer: SocketAddr, hashes: Vec<BlockHash>) {
        let to_send: Vec<PaymentVote> = {
            let inner = self.inner.read().await;
            let mut batch = Vec::new();
            for hash in hashes {
                let Some(height) = self.chain.block_height(&hash) else {
                    continue;
                };
                if let Some(block) = inner.blocks.get(&height) {
                    for tally in &block.payees {
                        for vote_hash in &tally.vote_hashes {
                            if let Some(stored) = inner.votes.get(vote_hash) {
                                if stored.verified {
                                    batch.push(stored.vote.clone());
                                }
                            }
                        }
                    }
                }
            }
            batch
        };
        for vote in to_send {
            self.outbound.send(peer, OverlayMessage::PaymentVote(vote));
        }
    }

    /// Evict votes beyond the storage window
    pub async fn check_and_remove(&self) {
        let Some(tip) = self.chain.tip_height() else {
            return;
        };
        let limit = self.storage_limit().await;
        let mut inner = self.inner.write().await;
        let mut removed_heights: HashSet<u64> = HashSet::new();
        inner.votes.retain(|_, stored| {
            let keep = tip.saturating_sub(stored.vote.target_height) <= limit;
            if !keep {
                removed_heights.insert(stored.vote.target_height);
            }
            keep
        });
        for height in removed_heights {
            inner.blocks.remove(&height);
            debug!(height, "removed old payment block");
        }
        inner
            .last_vote
            .retain(|_, &mut height| tip.saturating_sub(height) <= limit);
    }

    /// Rough completeness heuristic used by the sync coordinator
    pub async fn is_enough_data(&self) -> bool {
        let limit = self.storage_limit().await;
        let average_votes = ((SIGNATURES_TOTAL + SIGNATURES_REQUIRED) / 2) as u64;
        let inner = self.inner.read().await;
        (inner.blocks.len() as u64) > limit && (inner.votes.len() as u64) > limit * average_votes
    }

    pub async fn vote_count(&self) -> usize {
        self.inner.read().await.votes.len()
    }

    pub async fn block_count(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    pub async fn snapshot(&self) -> PaymentsSnapshot {
        let inner = self.inner.read().await;
        PaymentsSnapshot {
            votes: inner.votes.values().cloned().collect(),
            last_vote: inner
                .last_vote
                .iter()
                .map(|(op, height)| (*op, *height))
                .collect(),
        }
    }

    pub async fn restore(&self, snapshot: PaymentsSnapshot) {
        let mut inner = self.inner.write().await;
        inner.votes.clear();
        inner.blocks.clear();
        for stored in snapshot.votes {
            let hash = stored.vote.hash();
            if stored.verified {
                inner
                    .blocks
                    .entry(stored.vote.target_height)
                    .or_insert_with(|| BlockPayees::new(stored.vote.target_height))
                    .add_vote(&stored.vote);
            }
            inner.votes.insert(hash, stored);
        }
        inner.last_vote = snapshot.last_vote.into_iter().collect();
        info!(
            votes = inner.votes.len(),
            blocks = inner.blocks.len(),
            "payment state restored"
        );
    }
}
