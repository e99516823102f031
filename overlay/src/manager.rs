//! Service-node registry: gossip, ranking, payee queue and recovery
//!
//! The manager is the single owner of all records, keyed by collateral
//! outpoint. Everything else holds outpoints, never references into the
//! registry. Chain lookups go through the chain adapter, which owns its own
//! short-lived leaf lock and never calls back into the overlay, so querying
//! it while the registry lock is held cannot invert.

use crate::active::ActiveIdentity;
use crate::announce::Announcement;
use crate::error::{OverlayError, Result};
use crate::fulfilled::FulfilledRequestCache;
use crate::message::OverlayMessage;
use crate::node::{
    CheckContext, NodeState, ServiceNode, MIN_PING_SECONDS, NEW_START_REQUIRED_SECONDS,
    WATCHDOG_MAX_SECONDS,
};
use crate::outbound::Outbound;
use crate::ping::Ping;
use crate::spork::SporkManager;
use meridian_core::arith::Score;
use meridian_core::{ChainView, Clock, Hash256, OutPoint, Params, PayScript, SyncFlags};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How long a full-list request satisfies a peer
pub const DSEG_UPDATE_SECONDS: i64 = 3 * 60 * 60;
/// Blocks scanned backwards when refreshing last-paid data incrementally
pub const LAST_PAID_SCAN_BLOCKS: u64 = 100;
pub const MAX_POSE_CONNECTIONS: usize = 10;
pub const MAX_POSE_RANK: usize = 10;
/// Verification data older than this many blocks is dropped
pub const MAX_POSE_BLOCKS: u64 = 10;
pub const RECOVERY_QUORUM_TOTAL: usize = 10;
pub const RECOVERY_QUORUM_REQUIRED: usize = 6;
pub const RECOVERY_MAX_ASK_ENTRIES: usize = 10;
pub const RECOVERY_WAIT_SECONDS: i64 = 60;
pub const RECOVERY_RETRY_SECONDS: i64 = 3 * 60 * 60;
/// Ranking always keys off the block buried this deep under the target
pub const RANK_BLOCK_OFFSET: u64 = 101;
const MIN_INDEX_REBUILD_SECONDS: i64 = 3600;

/// Why a record does not qualify for the payee queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotQualified {
    NotValidForPayment,
    ProtocolTooOld { version: u32 },
    /// Already scheduled to be paid within the look-ahead window
    Scheduled,
    /// Announced too recently; qualifies once a full cycle has passed
    TooNew { qualifies_at: i64 },
    CollateralTooYoung { age: u64, required: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeenAnnouncement {
    first_seen: i64,
    announcement: Announcement,
}

#[derive(Debug, Clone, Default)]
struct RecoveryRequest {
    wait_until: i64,
    asked: HashSet<SocketAddr>,
}

#[derive(Default)]
struct ManagerInner {
    nodes: BTreeMap<OutPoint, ServiceNode>,
    seen_announcements: HashMap<Hash256, SeenAnnouncement>,
    seen_pings: HashMap<Hash256, Ping>,
    asked_us_for_list: HashMap<SocketAddr, i64>,
    we_asked_for_list: HashMap<SocketAddr, i64>,
    we_asked_for_entry: HashMap<OutPoint, HashMap<SocketAddr, i64>>,
    recovery_requests: HashMap<Hash256, RecoveryRequest>,
    recovery_replies: HashMap<Hash256, Vec<Announcement>>,
    scheduled_recovery_asks: Vec<(SocketAddr, OutPoint)>,
    last_watchdog_vote_time: i64,
    index: HashMap<OutPoint, u64>,
    next_index_id: u64,
    last_index_rebuild: i64,
    nodes_removed: bool,
}

/// Persisted registry state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    nodes: Vec<ServiceNode>,
    seen_announcements: Vec<(i64, Announcement)>,
    seen_pings: Vec<Ping>,
    last_watchdog_vote_time: i64,
    index: Vec<(OutPoint, u64)>,
    next_index_id: u64,
}

pub struct ServiceNodeManager {
    clock: Arc<dyn Clock>,
    chain: Arc<dyn ChainView>,
    params: Params,
    flags: Arc<SyncFlags>,
    sporks: Arc<SporkManager>,
    outbound: Arc<dyn Outbound>,
    fulfilled: Arc<FulfilledRequestCache>,
    identity: Arc<RwLock<Option<ActiveIdentity>>>,
    inner: RwLock<ManagerInner>,
}

impl ServiceNodeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        chain: Arc<dyn ChainView>,
        params: Params,
        flags: Arc<SyncFlags>,
        sporks: Arc<SporkManager>,
        outbound: Arc<dyn Outbound>,
        fulfilled: Arc<FulfilledRequestCache>,
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
            identity,
            inner: RwLock::new(ManagerInner::default()),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub async fn min_protocol(&self) -> u32 {
        self.sporks
            .min_protocol_version(
                self.params.min_protocol_version,
                self.params.protocol_version,
            )
            .await
    }

    async fn own_identity(&self) -> Option<ActiveIdentity> {
        self.identity.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn count_enabled(&self) -> usize {
        let min_proto = self.min_protocol().await;
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .count()
    }

    pub async fn has(&self, outpoint: &OutPoint) -> bool {
        self.inner.read().await.nodes.contains_key(outpoint)
    }

    pub async fn get(&self, outpoint: &OutPoint) -> Option<ServiceNode> {
        self.inner.read().await.nodes.get(outpoint).cloned()
    }

    pub async fn find_by_node_pubkey(&self, node_pubkey: &str) -> Option<ServiceNode> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .find(|node| node.node_pubkey == node_pubkey)
            .cloned()
    }

    pub async fn all(&self) -> Vec<ServiceNode> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    async fn check_context_inputs(&self) -> (i64, bool, u32) {
        let now = self.clock.now();
        let list_synced = self.flags.is_list_synced();
        let min_proto = self.min_protocol().await;
        (now, list_synced, min_proto)
    }

    fn build_ctx<'a>(
        &'a self,
        now: i64,
        list_synced: bool,
        min_proto: u32,
        watchdog_active: bool,
        our_node: bool,
        registry_size: usize,
    ) -> CheckContext<'a> {
        CheckContext {
            chain: self.chain.as_ref(),
            now,
            list_synced,
            watchdog_active,
            our_node,
            min_protocol: min_proto,
            registry_size,
        }
    }

    /// Handle an incoming announcement. `Ok(true)` means the registry
    /// learned something new.
    pub async fn process_announcement(
        &self,
        from: Option<SocketAddr>,
        announcement: Announcement,
    ) -> Result<bool> {
        let (now, list_synced, min_proto) = self.check_context_inputs().await;
        let hash = announcement.hash();
        let own = self.own_identity().await;
        let our_pubkey = own.as_ref().map(|id| id.node_key.public_key_hex());
        let watchdog_active = self.is_watchdog_active().await;

        // project the state a record built from this announcement would
        // land in; recovery bookkeeping below relies on it
        let registry_size = self.count().await;
        let projected_auto_start = {
            let mut candidate = announcement.clone().into_node(0);
            let ctx = self.build_ctx(now, list_synced, min_proto, watchdog_active, false, registry_size);
            candidate.check(&ctx, true);
            ServiceNode::is_valid_state_for_auto_start(candidate.state)
        };

        {
            let mut inner = self.inner.write().await;
            let mut seen = false;
            let mut newer_ping = false;
            if !announcement.recovery {
                if let Some(entry) = inner.seen_announcements.get_mut(&hash) {
                    seen = true;
                    debug!(servicenode = %announcement.outpoint, "announcement seen");
                    // fewer than two pings left before this record becomes
                    // non-recoverable: treat the duplicate as progress
                    if now - entry.first_seen
                        > NEW_START_REQUIRED_SECONDS - MIN_PING_SECONDS * 2
                    {
                        entry.first_seen = now;
                        self.flags.note_list_progress(now);
                    }
                    newer_ping = match (&announcement.last_ping, &entry.announcement.last_ping) {
                        (Some(new), Some(old)) => new.sign_time > old.sign_time,
                        (Some(_), None) => true,
                        _ => false,
                    };
                }
            }
            if seen {
                if let Some(peer) = from {
                    let mut good_reply = false;
                    if let Some(request) = inner.recovery_requests.get_mut(&hash) {
                        if now < request.wait_until && request.asked.remove(&peer) {
                            good_reply = newer_ping && projected_auto_start;
                        }
                    }
                    if good_reply {
                        debug!(servicenode = %announcement.outpoint, %peer, "recovery reply looks good");
                        inner
                            .recovery_replies
                            .entry(hash)
                            .or_default()
                            .push(announcement.clone());
                    }
                }
                return Ok(true);
            }
            inner.seen_announcements.insert(
                hash,
                SeenAnnouncement {
                    first_seen: now,
                    announcement: announcement.clone(),
                },
            );
        }
        debug!(servicenode = %announcement.outpoint, "announcement is new");

        let ping_ok = announcement.simple_check(&self.params, self.chain.as_ref(), min_proto, now)?;

        // known record: apply as an update
        {
            let mut inner = self.inner.write().await;
            let registry_size = inner.nodes.len();
            if let Some(node) = inner.nodes.get_mut(&announcement.outpoint) {
                let old_hash = Announcement::from_node(node).hash();
                announcement.update_existing(
                    node,
                    self.chain.as_ref(),
                    &self.flags,
                    our_pubkey.as_deref(),
                    now,
                )?;
                let our_record = our_pubkey.as_deref() == Some(node.node_pubkey.as_str());
                let ctx = CheckContext {
                    chain: self.chain.as_ref(),
                    now,
                    list_synced,
                    watchdog_active,
                    our_node: our_record,
                    min_protocol: min_proto,
                    registry_size,
                };
                node.check(&ctx, true);
                let ping = node.last_ping.clone();
                if hash != old_hash {
                    inner.seen_announcements.remove(&old_hash);
                }
                if let Some(ping) = ping {
                    inner.seen_pings.insert(ping.hash(), ping);
                }
                drop(inner);
                info!(servicenode = %announcement.outpoint, addr = %announcement.addr, "updated record");
                self.flags.note_list_progress(now);
                self.outbound
                    .relay(OverlayMessage::Announce(announcement));
                return Ok(true);
            }
        }

        // brand new record: prove the collateral
        announcement.check_signature()?;
        let collateral_height =
            match announcement.check_collateral(self.chain.as_ref(), &self.params, now) {
                Ok(height) => height,
                Err(err) => {
                    if matches!(err, OverlayError::NotReady(_) | OverlayError::ChainUnavailable) {
                        // a few blocks may be missing; allow a later retry
                        self.inner.write().await.seen_announcements.remove(&hash);
                    }
                    warn!(servicenode = %announcement.outpoint, error = %err, "rejected announcement");
                    return Err(err);
                }
            };

        let mut node = announcement.clone().into_node(collateral_height);
        if !ping_ok {
            // one of us is probably forked; keep the record but mark it
            // expired until a fresh ping arrives
            node.state = NodeState::Expired;
        }
        {
            let mut inner = self.inner.write().await;
            let id = inner.next_index_id;
            inner.next_index_id += 1;
            inner.index.insert(node.outpoint, id);
            let size = inner.nodes.len() + 1;
            info!(servicenode = %node.outpoint, addr = %node.addr, size, "new servicenode");
            if let Some(ping) = &node.last_ping {
                inner.seen_pings.insert(ping.hash(), ping.clone());
            }
            inner.nodes.insert(node.outpoint, node);
        }
        self.flags.note_list_progress(now);
        self.outbound.relay(OverlayMessage::Announce(announcement));
        Ok(true)
    }

    /// Handle an incoming ping
    pub async fn process_ping(&self, from: Option<SocketAddr>, ping: Ping) -> Result<()> {
        let (now, list_synced, min_proto) = self.check_context_inputs().await;
        let hash = ping.hash();
        let watchdog_active = self.is_watchdog_active().await;
        let own = self.own_identity().await;
        let our_pubkey = own.as_ref().map(|id| id.node_key.public_key_hex());

        let unknown = {
            let mut inner = self.inner.write().await;
            if inner.seen_pings.contains_key(&hash) {
                return Err(OverlayError::Duplicate("ping"));
            }
            inner.seen_pings.insert(hash, ping.clone());
            debug!(servicenode = %ping.outpoint, "ping is new");

            let registry_size = inner.nodes.len();
            match inner.nodes.get_mut(&ping.outpoint) {
                Some(node) if node.is_new_start_required() => {
                    // too late, a fresh announcement is required
                    return Ok(());
                }
                Some(node) => {
                    ping.check_and_update(node, false, self.chain.as_ref(), &self.flags, now)?;
                    let ctx = self.build_ctx(
                        now,
                        list_synced,
                        min_proto,
                        watchdog_active,
                        our_pubkey.as_deref() == Some(node.node_pubkey.as_str()),
                        registry_size,
                    );
                    node.check(&ctx, true);
                    let enabled = node.is_enabled();
                    let ann_hash = Announcement::from_node(node).hash();
                    if let Some(entry) = inner.seen_announcements.get_mut(&ann_hash) {
                        entry.announcement.last_ping = Some(ping.clone());
                    }
                    if !enabled {
                        return Ok(());
                    }
                    false
                }
                None => true,
            }
        };

        if unknown {
            if let Some(peer) = from {
                self.ask_for_record(peer, ping.outpoint).await;
            }
            return Err(OverlayError::NotReady("servicenode unknown, record requested"));
        }

        self.outbound.relay(OverlayMessage::Ping(ping));
        Ok(())
    }

    /// Serve a DSEG list request
    pub async fn process_list_request(
        &self,
        peer: SocketAddr,
        which: Option<OutPoint>,
    ) -> Result<()> {
        // a heavy request; don't serve it until we finished our own sync
        if !self.flags.is_synced() {
            return Err(OverlayError::NotReady("not synced, ignoring list request"));
        }
        let now = self.clock.now();

        let to_send: Vec<(Announcement, Option<Ping>)> = {
            let mut inner = self.inner.write().await;
            if which.is_none()
                && self.params.network == meridian_core::Network::Mainnet
                && !is_local_addr(&peer)
            {
                if let Some(&until) = inner.asked_us_for_list.get(&peer) {
                    if now < until {
                        return Err(OverlayError::validation(
                            format!("peer {peer} already asked for the list"),
                            34,
                        ));
                    }
                }
                inner.asked_us_for_list.insert(peer, now + DSEG_UPDATE_SECONDS);
            }

            let regtest = self.params.network == meridian_core::Network::Regtest;
            let mut batch = Vec::new();
            for node in inner.nodes.values() {
                if let Some(op) = which {
                    if op != node.outpoint {
                        continue;
                    }
                }
                if !regtest && is_local_addr(&node.addr) {
                    continue;
                }
                if node.is_update_required() {
                    continue;
                }
                batch.push((Announcement::from_node(node), node.last_ping.clone()));
                if which.is_some() {
                    break;
                }
            }
            for (announcement, _) in &batch {
                let hash = announcement.hash();
                inner
                    .seen_announcements
                    .entry(hash)
                    .or_insert_with(|| SeenAnnouncement {
                        first_seen: now,
                        announcement: announcement.clone(),
                    });
            }
            batch
        };

        let count = to_send.len() as u32;
        for (announcement, ping) in to_send {
            debug!(servicenode = %announcement.outpoint, %peer, "sending record");
            self.outbound
                .send(peer, OverlayMessage::Announce(announcement));
            if let Some(ping) = ping {
                self.outbound.send(peer, OverlayMessage::Ping(ping));
            }
        }
        if which.is_none() {
            self.outbound.send(
                peer,
                OverlayMessage::SyncStatusCount {
                    asset: meridian_core::SyncAsset::List.code(),
                    count,
                },
            );
            info!(%peer, count, "served servicenode list");
        }
        Ok(())
    }

    /// Ask a peer for the full list (one request per window per peer)
    pub async fn dseg_update(&self, peer: SocketAddr) {
        let now = self.clock.now();
        {
            let mut inner = self.inner.write().await;
            if self.params.network == meridian_core::Network::Mainnet && !is_local_addr(&peer) {
                if let Some(&until) = inner.we_asked_for_list.get(&peer) {
                    if now < until {
                        debug!(%peer, "already asked for the list, skipping");
                        return;
                    }
                }
            }
            inner.we_asked_for_list.insert(peer, now + DSEG_UPDATE_SECONDS);
        }
        self.outbound.send(peer, OverlayMessage::Dseg(None));
        debug!(%peer, "asked for the servicenode list");
    }

    /// Ask a peer for one record, rate-limited per (outpoint, peer)
    pub async fn ask_for_record(&self, peer: SocketAddr, outpoint: OutPoint) {
        let now = self.clock.now();
        {
            let mut inner = self.inner.write().await;
            let asked = inner.we_asked_for_entry.entry(outpoint).or_default();
            if let Some(&until) = asked.get(&peer) {
                if now < until {
                    // asked recently; repeating too often invites a ban
                    return;
                }
            }
            asked.insert(peer, now + DSEG_UPDATE_SECONDS);
        }
        info!(servicenode = %outpoint, %peer, "asking for missing record");
        self.outbound
            .send(peer, OverlayMessage::Dseg(Some(outpoint)));
    }

    /// Deterministic 1-based rank of a record among enabled records,
    /// scored against the block hash at `height`.
    pub async fn rank(&self, outpoint: &OutPoint, height: u64) -> Option<u64> {
        let ranks = self.ranks(height).await;
        ranks
            .into_iter()
            .find(|(_, node)| node.outpoint == *outpoint)
            .map(|(rank, _)| rank)
    }

    /// Full ranking at `height`, best first
    pub async fn ranks(&self, height: u64) -> Vec<(u64, ServiceNode)> {
        let Some(block_hash) = self.chain.block_hash(height) else {
            return Vec::new();
        };
        let min_proto = self.min_protocol().await;
        let snapshot: Vec<ServiceNode> = {
            let inner = self.inner.read().await;
            inner
                .nodes
                .values()
                .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
                .cloned()
                .collect()
        };
        let mut scored: Vec<(Score, ServiceNode)> = snapshot
            .into_iter()
            .map(|node| (node.calculate_score(&block_hash), node))
            .collect();
        // strict total order: score desc, outpoint as the tie-break
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.outpoint.cmp(&b.1.outpoint)));
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (_, node))| (i as u64 + 1, node))
            .collect()
    }

    pub async fn by_rank(&self, rank: u64, height: u64) -> Option<ServiceNode> {
        self.ranks(height)
            .await
            .into_iter()
            .find(|(r, _)| *r == rank)
            .map(|(_, node)| node)
    }

    fn not_qualified_reason(
        &self,
        node: &ServiceNode,
        now: i64,
        min_proto: u32,
        enabled_count: usize,
        filter_announce_time: bool,
        scheduled: &HashSet<PayScript>,
    ) -> Option<NotQualified> {
        if !node.is_valid_for_payment() {
            return Some(NotQualified::NotValidForPayment);
        }
        if node.protocol_version < min_proto {
            return Some(NotQualified::ProtocolTooOld {
                version: node.protocol_version,
            });
        }
        if scheduled.contains(&node.payee_script()) {
            return Some(NotQualified::Scheduled);
        }
        if filter_announce_time {
            let qualifies_at = node.announce_time + (enabled_count as f64 * 2.6 * 60.0) as i64;
            if qualifies_at > now {
                return Some(NotQualified::TooNew { qualifies_at });
            }
        }
        let age = node.collateral_age(self.chain.as_ref()).unwrap_or(0);
        if age < enabled_count as u64 {
            return Some(NotQualified::CollateralTooYoung {
                age,
                required: enabled_count as u64,
            });
        }
        None
    }

    /// Deterministically select the next record owed a payment at `height`.
    /// `scheduled` holds payee scripts already queued in the look-ahead
    /// window. Returns the winner and how many records qualified.
    pub async fn next_payee_candidate(
        &self,
        height: u64,
        scheduled: &HashSet<PayScript>,
    ) -> (Option<ServiceNode>, usize) {
        self.next_payee_candidate_inner(height, true, scheduled).await
    }

    async fn next_payee_candidate_inner(
        &self,
        height: u64,
        filter_announce_time: bool,
        scheduled: &HashSet<PayScript>,
    ) -> (Option<ServiceNode>, usize) {
        let now = self.clock.now();
        let min_proto = self.min_protocol().await;
        let enabled_count = self.count_enabled().await;
        let snapshot: Vec<ServiceNode> = self.all().await;

        let mut by_last_paid: Vec<ServiceNode> = Vec::new();
        for node in snapshot {
            match self.not_qualified_reason(
                &node,
                now,
                min_proto,
                enabled_count,
                filter_announce_time,
                scheduled,
            ) {
                Some(reason) => {
                    debug!(servicenode = %node.outpoint, ?reason, "not qualified");
                }
                None => by_last_paid.push(node),
            }
        }
        let qualified = by_last_paid.len();

        // while the network upgrades, don't punish freshly restarted nodes
        if filter_announce_time && qualified < enabled_count / 3 {
            return Box::pin(self.next_payee_candidate_inner(height, false, scheduled)).await;
        }

        let Some(block_hash) = self.chain.block_hash(height.saturating_sub(RANK_BLOCK_OFFSET))
        else {
            warn!(height, "no block hash for payee selection");
            return (None, qualified);
        };

        by_last_paid.sort_by(|a, b| {
            a.last_paid_block
                .cmp(&b.last_paid_block)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });

        // score the oldest tenth and pay the best of them
        let tenth = (enabled_count / 10).max(1);
        let best = by_last_paid
            .into_iter()
            .take(tenth)
            .max_by_key(|node| node.calculate_score(&block_hash));
        (best, qualified)
    }

    /// Run the per-record state machine over the whole registry
    pub async fn check_all(&self) {
        let (now, list_synced, min_proto) = self.check_context_inputs().await;
        let watchdog_active = self.is_watchdog_active().await;
        let own = self.own_identity().await;
        let our_pubkey = own.as_ref().map(|id| id.node_key.public_key_hex());
        let mut inner = self.inner.write().await;
        let registry_size = inner.nodes.len();
        let chain = self.chain.as_ref();
        for node in inner.nodes.values_mut() {
            let ctx = CheckContext {
                chain,
                now,
                list_synced,
                watchdog_active,
                our_node: our_pubkey.as_deref() == Some(node.node_pubkey.as_str()),
                min_protocol: min_proto,
                registry_size,
            };
            node.check(&ctx, false);
        }
    }

    /// Periodic sweep: drop spent records, expire bookkeeping maps and run
    /// broadcast recovery for records that need a fresh announcement.
    pub async fn check_and_remove(&self) {
        if !self.flags.is_list_synced() {
            return;
        }
        self.check_all().await;

        let now = self.clock.now();
        let tip = self.chain.tip_height();
        let synced = self.flags.is_synced();

        // recovery candidates need a ranked peer list from a random
        // recent block; compute it before touching the registry lock
        let ranked_addrs: Vec<SocketAddr> = match tip {
            Some(tip) if synced => {
                let random_height = rand::thread_rng().gen_range(0..=tip);
                self.ranks(random_height)
                    .await
                    .into_iter()
                    .map(|(_, node)| node.addr)
                    .collect()
            }
            _ => Vec::new(),
        };

        let mut reprocess: Vec<Announcement> = Vec::new();
        {
            let mut inner = self.inner.write().await;

            // drop spent records
            let spent: Vec<OutPoint> = inner
                .nodes
                .values()
                .filter(|node| node.is_outpoint_spent())
                .map(|node| node.outpoint)
                .collect();
            for outpoint in spent {
                if let Some(node) = inner.nodes.remove(&outpoint) {
                    info!(servicenode = %outpoint, size = inner.nodes.len(), "removing spent record");
                    let hash = Announcement::from_node(&node).hash();
                    inner.seen_announcements.remove(&hash);
                    inner.we_asked_for_entry.remove(&outpoint);
                    inner.nodes_removed = true;
                }
            }

            // schedule recovery asks for records requiring a new start
            if synced && !ranked_addrs.is_empty() {
                let mut ask_slots = RECOVERY_MAX_ASK_ENTRIES;
                let candidates: Vec<(OutPoint, Hash256)> = inner
                    .nodes
                    .values()
                    .filter(|node| node.is_new_start_required())
                    .map(|node| (node.outpoint, Announcement::from_node(node).hash()))
                    .collect();
                for (outpoint, hash) in candidates {
                    if ask_slots == 0 {
                        break;
                    }
                    if inner.recovery_requests.contains_key(&hash) {
                        continue;
                    }
                    let already_asked: HashSet<SocketAddr> = inner
                        .we_asked_for_entry
                        .get(&outpoint)
                        .map(|peers| peers.keys().copied().collect())
                        .unwrap_or_default();
                    let mut asked = HashSet::new();
                    for addr in &ranked_addrs {
                        if asked.len() >= RECOVERY_QUORUM_TOTAL {
                            break;
                        }
                        if already_asked.contains(addr) {
                            continue;
                        }
                        if asked.insert(*addr) {
                            inner.scheduled_recovery_asks.push((*addr, outpoint));
                        }
                    }
                    if !asked.is_empty() {
                        info!(servicenode = %outpoint, peers = asked.len(), "recovery initiated");
                        ask_slots -= 1;
                        inner.recovery_requests.insert(
                            hash,
                            RecoveryRequest {
                                wait_until: now + RECOVERY_WAIT_SECONDS,
                                asked,
                            },
                        );
                    }
                }
            }

            // process recovery replies whose wait window closed
            let done: Vec<Hash256> = inner
                .recovery_replies
                .keys()
                .filter(|hash| {
                    inner
                        .recovery_requests
                        .get(*hash)
                        .map(|req| req.wait_until < now)
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            for hash in done {
                if let Some(mut replies) = inner.recovery_replies.remove(&hash) {
                    if replies.len() >= RECOVERY_QUORUM_REQUIRED {
                        // enough peers agree this record is fine; reprocess
                        let mut announcement = replies.swap_remove(0);
                        announcement.recovery = true;
                        reprocess.push(announcement);
                    }
                }
            }

            // expire recovery requests so the record can be retried later
            inner
                .recovery_requests
                .retain(|_, req| now - req.wait_until <= RECOVERY_RETRY_SECONDS);

            inner.asked_us_for_list.retain(|_, until| *until >= now);
            inner.we_asked_for_list.retain(|_, until| *until >= now);
            inner.we_asked_for_entry.retain(|_, peers| {
                peers.retain(|_, until| *until >= now);
                !peers.is_empty()
            });

            inner
                .seen_pings
                .retain(|_, ping| now - ping.sign_time <= NEW_START_REQUIRED_SECONDS);

            // seen announcements are evicted once their record is gone and
            // they have aged out; keeps the map bounded across reorgs
            let live: HashSet<OutPoint> = inner.nodes.keys().copied().collect();
            inner.seen_announcements.retain(|_, entry| {
                live.contains(&entry.announcement.outpoint)
                    || now - entry.first_seen <= NEW_START_REQUIRED_SECONDS
            });

            // rebuild the outpoint index at most once per hour
            if inner.nodes_removed
                && now - inner.last_index_rebuild >= MIN_INDEX_REBUILD_SECONDS
            {
                inner.index.clear();
                inner.next_index_id = 0;
                let outpoints: Vec<OutPoint> = inner.nodes.keys().copied().collect();
                for outpoint in outpoints {
                    let id = inner.next_index_id;
                    inner.index.insert(outpoint, id);
                    inner.next_index_id += 1;
                }
                inner.last_index_rebuild = now;
                inner.nodes_removed = false;
            }
        }

        for announcement in reprocess {
            debug!(servicenode = %announcement.outpoint, "reprocessing recovered announcement");
            if let Err(err) = self.process_announcement(None, announcement).await {
                debug!(error = %err, "recovered announcement rejected");
            }
        }
    }

    /// Take one scheduled recovery ask, if any; the tick loop sends it
    pub async fn pop_scheduled_recovery_ask(&self) -> Option<(SocketAddr, OutPoint)> {
        let mut inner = self.inner.write().await;
        if inner.scheduled_recovery_asks.is_empty() {
            None
        } else {
            Some(inner.scheduled_recovery_asks.remove(0))
        }
    }

    /// Refresh the last-paid cache by walking recent coinbases.
    /// `paid_candidates` maps heights to payees holding enough votes.
    pub async fn update_last_paid(&self, paid_candidates: &HashMap<u64, Vec<PayScript>>, full_scan: bool) {
        let max_back = if full_scan {
            u64::MAX
        } else {
            LAST_PAID_SCAN_BLOCKS
        };
        let chain = self.chain.clone();
        let params = self.params.clone();
        let mut inner = self.inner.write().await;
        for node in inner.nodes.values_mut() {
            node.update_last_paid(chain.as_ref(), max_back, |height, payee| {
                let listed = paid_candidates
                    .get(&height)
                    .map(|payees| payees.contains(payee))
                    .unwrap_or(false);
                if !listed {
                    return None;
                }
                let coinbase = chain.coinbase(height)?;
                if coinbase.pays(payee, params.servicenode_payment(height)) {
                    chain.block_time(height)
                } else {
                    None
                }
            });
        }
    }

    /// Record a watchdog vote for a record
    pub async fn update_watchdog_vote(&self, outpoint: &OutPoint) {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(outpoint) {
            node.last_watchdog_vote = now;
            inner.last_watchdog_vote_time = now;
        }
    }

    /// The watchdog is active while any record voted recently
    pub async fn is_watchdog_active(&self) -> bool {
        let now = self.clock.now();
        let inner = self.inner.read().await;
        inner.last_watchdog_vote_time != 0
            && now - inner.last_watchdog_vote_time <= WATCHDOG_MAX_SECONDS
    }

    /// Install our own freshly created announcement (local activation)
    pub async fn update_own_announcement(&self, announcement: Announcement) -> Result<bool> {
        self.process_announcement(None, announcement).await
    }

    /// Update the stored ping for our own record and remember it as seen
    pub async fn set_own_ping(&self, ping: Ping) -> bool {
        let mut inner = self.inner.write().await;
        let Some(node) = inner.nodes.get_mut(&ping.outpoint) else {
            return false;
        };
        node.last_ping = Some(ping.clone());
        let ann_hash = Announcement::from_node(node).hash();
        inner.seen_pings.insert(ping.hash(), ping.clone());
        if let Some(entry) = inner.seen_announcements.get_mut(&ann_hash) {
            entry.announcement.last_ping = Some(ping);
        }
        true
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().await;
        RegistrySnapshot {
            nodes: inner.nodes.values().cloned().collect(),
            seen_announcements: inner
                .seen_announcements
                .values()
                .map(|entry| (entry.first_seen, entry.announcement.clone()))
                .collect(),
            seen_pings: inner.seen_pings.values().cloned().collect(),
            last_watchdog_vote_time: inner.last_watchdog_vote_time,
            index: inner.index.iter().map(|(op, id)| (*op, *id)).collect(),
            next_index_id: inner.next_index_id,
        }
    }

    pub async fn restore(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.write().await;
        inner.nodes = snapshot
            .nodes
            .into_iter()
            .map(|node| (node.outpoint, node))
            .collect();
        inner.seen_announcements = snapshot
            .seen_announcements
            .into_iter()
            .map(|(first_seen, announcement)| {
                (
                    announcement.hash(),
                    SeenAnnouncement {
                        first_seen,
                        announcement,
                    },
                )
            })
            .collect();
        inner.seen_pings = snapshot
            .seen_pings
            .into_iter()
            .map(|ping| (ping.hash(), ping))
            .collect();
        inner.last_watchdog_vote_time = snapshot.last_watchdog_vote_time;
        inner.index = snapshot.index.into_iter().collect();
        inner.next_index_id = snapshot.next_index_id;
        info!(size = inner.nodes.len(), "registry restored");
    }

    pub(crate) fn fulfilled(&self) -> &FulfilledRequestCache {
        self.fulfilled.as_ref()
    }

    pub(crate) fn outbound(&self) -> &dyn Outbound {
        self.outbound.as_ref()
    }

    pub(crate) fn chain(&self) -> &dyn ChainView {
        self.chain.as_ref()
    }

    pub(crate) fn flags(&self) -> &SyncFlags {
        self.flags.as_ref()
    }

    /// Run a closure over one record under the registry lock. Maintenance
    /// surface for the verifier and for state fixups.
    pub async fn with_node_mut<F, R>(&self, outpoint: &OutPoint, f: F) -> Option<R>
    where
        F: FnOnce(&mut ServiceNode) -> R,
    {
        let mut inner = self.inner.write().await;
        inner.nodes.get_mut(outpoint).map(f)
    }
}

/// RFC1918 / loopback addresses don't count against list-request limits
pub fn is_local_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => ip.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addr_detection() {
        let local: SocketAddr = "127.0.0.1:29100".parse().unwrap();
        let private: SocketAddr = "192.168.1.4:29100".parse().unwrap();
        let public: SocketAddr = "51.15.0.9:29100".parse().unwrap();
        assert!(is_local_addr(&local));
        assert!(is_local_addr(&private));
        assert!(!is_local_addr(&public));
    }
}
