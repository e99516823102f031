//! Staged overlay bootstrap
//!
//! A joining node fetches, in order: kill switches, the service-node list,
//! then payment votes. One request per peer per asset, gated through the
//! fulfilled-request cache; assets advance on timeout once at least one
//! attempt was made, and the whole sequence fails (with a retry cooldown)
//! when a stage times out without any attempt.

use crate::active::ActiveIdentity;
use crate::fulfilled::FulfilledRequestCache;
use crate::manager::ServiceNodeManager;
use crate::message::OverlayMessage;
use crate::outbound::Outbound;
use crate::payments::PaymentManager;
use meridian_core::{ChainView, Clock, SyncAsset, SyncFlags};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const SYNC_TICK_SECONDS: i64 = 6;
pub const SYNC_TIMEOUT_SECONDS: i64 = 30;
/// Cooldown before a failed sync restarts
pub const SYNC_FAIL_RETRY_SECONDS: i64 = 60;
/// A gap this long between ticks means the host slept; start over
pub const SLEEP_RESET_SECONDS: i64 = 60 * 60;

const SPORK_SYNC_TAG: &str = "spork-sync";
const LIST_SYNC_TAG: &str = "servicenode-list-sync";
const PAYMENT_SYNC_TAG: &str = "servicenode-payment-sync";
const FULL_SYNC_TAG: &str = "full-sync";

struct SyncInner {
    attempt: u32,
    last_failure: i64,
    failure_count: u32,
    last_tick: i64,
}

pub struct SyncCoordinator {
    clock: Arc<dyn Clock>,
    chain: Arc<dyn ChainView>,
    flags: Arc<SyncFlags>,
    fulfilled: Arc<FulfilledRequestCache>,
    outbound: Arc<dyn Outbound>,
    manager: Arc<ServiceNodeManager>,
    payments: Arc<PaymentManager>,
    identity: Arc<RwLock<Option<ActiveIdentity>>>,
    inner: RwLock<SyncInner>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        chain: Arc<dyn ChainView>,
        flags: Arc<SyncFlags>,
        fulfilled: Arc<FulfilledRequestCache>,
        outbound: Arc<dyn Outbound>,
        manager: Arc<ServiceNodeManager>,
        payments: Arc<PaymentManager>,
        identity: Arc<RwLock<Option<ActiveIdentity>>>,
    ) -> Self {
        Self {
            clock,
            chain,
            flags,
            fulfilled,
            outbound,
            manager,
            payments,
            identity,
            inner: RwLock::new(SyncInner {
                attempt: 0,
                last_failure: 0,
                failure_count: 0,
                last_tick: 0,
            }),
        }
    }

    pub fn asset(&self) -> SyncAsset {
        self.flags.asset()
    }

    pub async fn reset(&self) {
        let now = self.clock.now();
        info!("resetting overlay sync");
        self.flags.set_asset(SyncAsset::Initial);
        self.flags.note_list_progress(now);
        self.flags.note_vote_progress(now);
        let mut inner = self.inner.write().await;
        inner.attempt = 0;
        inner.failure_count = 0;
    }

    async fn fail(&self) {
        let now = self.clock.now();
        warn!(asset = self.flags.asset().name(), "overlay sync failed");
        self.flags.set_asset(SyncAsset::Failed);
        let mut inner = self.inner.write().await;
        inner.last_failure = now;
        inner.failure_count += 1;
        inner.attempt = 0;
    }

    async fn switch_to_next_asset(&self) {
        let now = self.clock.now();
        let next = match self.flags.asset() {
            SyncAsset::Initial => {
                // forget gates from a previous round before starting over
                self.fulfilled
                    .clear_tags(&[SPORK_SYNC_TAG, LIST_SYNC_TAG, PAYMENT_SYNC_TAG, FULL_SYNC_TAG])
                    .await;
                SyncAsset::Sporks
            }
            SyncAsset::Sporks => {
                self.flags.note_list_progress(now);
                SyncAsset::List
            }
            SyncAsset::List => {
                self.flags.note_vote_progress(now);
                SyncAsset::Votes
            }
            SyncAsset::Votes => SyncAsset::Finished,
            other => other,
        };
        self.flags.set_asset(next);
        self.inner.write().await.attempt = 0;
        info!(asset = next.name(), "starting sync stage");

        if next == SyncAsset::Finished {
            info!("overlay sync finished");
            // free the slots of peers that served our full sync
            for peer in self.outbound.peers() {
                if self.fulfilled.has(peer.addr, PAYMENT_SYNC_TAG).await {
                    self.fulfilled.mark(peer.addr, FULL_SYNC_TAG).await;
                    self.outbound.disconnect(peer.addr);
                }
            }
        }
    }

    pub fn status(&self) -> &'static str {
        match self.flags.asset() {
            SyncAsset::Initial => "Synchronization pending...",
            SyncAsset::Sporks => "Synchronizing sporks...",
            SyncAsset::List => "Synchronizing service nodes...",
            SyncAsset::Votes => "Synchronizing service-node payments...",
            SyncAsset::Failed => "Synchronization failed",
            SyncAsset::Finished => "Synchronization finished",
        }
    }

    /// SYNCSTATUSCOUNT progress hints are informational only
    pub async fn process_status_count(&self, peer: SocketAddr, asset: u32, count: u32) {
        if self.flags.is_synced() || self.flags.is_failed() {
            return;
        }
        info!(%peer, asset, count, "sync inventory count");
    }

    /// One coordinator tick (normally every six seconds)
    pub async fn process_tick(&self) {
        let now = self.clock.now();
        let slept = {
            let inner = self.inner.read().await;
            inner.last_tick != 0 && now - inner.last_tick > SLEEP_RESET_SECONDS
        };
        if slept {
            // a long gap means the host slept; whatever we had is stale
            self.reset().await;
        }
        self.inner.write().await.last_tick = now;

        self.flags.set_blockchain_synced(self.chain.is_synced());

        let registry_size = self.manager.count().await;

        if self.flags.is_synced() {
            // resync if we lost every record to sleep or a failed start
            if registry_size == 0 {
                warn!("registry is empty after sync, restarting");
                self.reset().await;
            }
            return;
        }

        if self.flags.is_failed() {
            let last_failure = self.inner.read().await.last_failure;
            if last_failure + SYNC_FAIL_RETRY_SECONDS < now {
                self.reset().await;
            }
            return;
        }

        // wait for the block engine before anything beyond sporks
        if !self.flags.is_blockchain_synced()
            && matches!(self.flags.asset(), SyncAsset::List | SyncAsset::Votes)
        {
            self.flags.note_list_progress(now);
            self.flags.note_vote_progress(now);
            return;
        }

        if self.flags.asset() == SyncAsset::Initial
            || (self.flags.asset() == SyncAsset::Sporks && self.flags.is_blockchain_synced())
        {
            self.switch_to_next_asset().await;
        }

        let we_are_servicenode = self.identity.read().await.is_some();
        let min_proto = self.manager.min_protocol().await;

        for peer in self.outbound.peers() {
            // temporary service-node connections are unreliable for sync;
            // early inbound connections to a service node usually are too
            if peer.servicenode_conn || (we_are_servicenode && peer.inbound) {
                continue;
            }

            if self.fulfilled.has(peer.addr, FULL_SYNC_TAG).await {
                // we already synced everything from this peer recently
                debug!(peer = %peer.addr, "disconnecting recently synced peer");
                self.outbound.disconnect(peer.addr);
                continue;
            }

            // sporks always come first, from every peer
            if !self.fulfilled.has(peer.addr, SPORK_SYNC_TAG).await {
                self.fulfilled.mark(peer.addr, SPORK_SYNC_TAG).await;
                info!(peer = %peer.addr, "requesting sporks");
                self.outbound.send(peer.addr, OverlayMessage::GetSporks);
                continue;
            }

            match self.flags.asset() {
                SyncAsset::List => {
                    if self.flags.last_list_progress() < now - SYNC_TIMEOUT_SECONDS {
                        warn!("service-node list sync timed out");
                        if self.inner.read().await.attempt == 0 {
                            // no way to continue without the list
                            self.fail().await;
                        } else {
                            self.switch_to_next_asset().await;
                        }
                        return;
                    }
                    if self.fulfilled.has(peer.addr, LIST_SYNC_TAG).await {
                        continue;
                    }
                    self.fulfilled.mark(peer.addr, LIST_SYNC_TAG).await;
                    if peer.protocol_version < min_proto {
                        continue;
                    }
                    self.inner.write().await.attempt += 1;
                    self.manager.dseg_update(peer.addr).await;
                    // one request per peer per tick across the assets
                    return;
                }
                SyncAsset::Votes => {
                    if self.flags.last_vote_progress() < now - SYNC_TIMEOUT_SECONDS {
                        warn!("payment vote sync timed out");
                        if self.inner.read().await.attempt == 0 {
                            self.fail().await;
                        } else {
                            self.switch_to_next_asset().await;
                        }
                        return;
                    }
                    // with plenty of data on record, move on (after asking
                    // at least two peers)
                    if self.inner.read().await.attempt > 1 && self.payments.is_enough_data().await
                    {
                        self.switch_to_next_asset().await;
                        return;
                    }
                    if self.fulfilled.has(peer.addr, PAYMENT_SYNC_TAG).await {
                        continue;
                    }
                    self.fulfilled.mark(peer.addr, PAYMENT_SYNC_TAG).await;
                    if peer.protocol_version < min_proto {
                        continue;
                    }
                    self.inner.write().await.attempt += 1;
                    let limit = self.payments.storage_limit().await as u32;
                    self.outbound
                        .send(peer.addr, OverlayMessage::PaymentSync(limit));
                    self.payments.request_low_data_blocks(peer.addr).await;
                    return;
                }
                _ => {}
            }
        }
    }
}
