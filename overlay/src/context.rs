//! Overlay wiring and message dispatch
//!
//! All managers are constructed here with explicit `Arc` wiring and known
//! lifetimes; nothing in the overlay is a free-floating global. Incoming
//! messages are dispatched by command, outbound traffic goes through the
//! injected `Outbound`, and one driver loop runs the periodic work.

use crate::active::{ActiveIdentity, ActiveOptions, ActiveServiceNode, WalletBridge};
use crate::error::Result;
use crate::fulfilled::FulfilledRequestCache;
use crate::manager::{ServiceNodeManager, LAST_PAID_SCAN_BLOCKS};
use crate::message::OverlayMessage;
use crate::outbound::Outbound;
use crate::payments::{PaymentManager, VOTE_AHEAD};
use crate::spork::SporkManager;
use crate::store::Store;
use crate::sync::SyncCoordinator;
use crate::verification::PoseVerifier;
use meridian_core::{ChainView, Clock, Params, SyncFlags};
use meridian_crypto::KeyPair;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const STORE_REGISTRY: &str = "servicenodes";
const STORE_PAYMENTS: &str = "payments";
const STORE_SPORKS: &str = "sporks";

/// Everything needed to run as a service node
pub struct ServiceNodeSettings {
    pub node_key: KeyPair,
    pub options: ActiveOptions,
    pub wallet: Arc<dyn WalletBridge>,
}

pub struct OverlayContext {
    pub clock: Arc<dyn Clock>,
    pub chain: Arc<dyn ChainView>,
    pub params: Params,
    pub flags: Arc<SyncFlags>,
    pub outbound: Arc<dyn Outbound>,
    pub fulfilled: Arc<FulfilledRequestCache>,
    pub sporks: Arc<SporkManager>,
    pub manager: Arc<ServiceNodeManager>,
    pub verifier: Arc<PoseVerifier>,
    pub payments: Arc<PaymentManager>,
    pub sync: Arc<SyncCoordinator>,
    pub active: Option<Arc<ActiveServiceNode>>,
    pub identity: Arc<RwLock<Option<ActiveIdentity>>>,
    shutdown: AtomicBool,
}

impl OverlayContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        chain: Arc<dyn ChainView>,
        params: Params,
        outbound: Arc<dyn Outbound>,
        service_node: Option<ServiceNodeSettings>,
    ) -> Arc<Self> {
        let flags = Arc::new(SyncFlags::new());
        let fulfilled = Arc::new(FulfilledRequestCache::new(clock.clone()));
        let identity: Arc<RwLock<Option<ActiveIdentity>>> = Arc::new(RwLock::new(None));
        let sporks = Arc::new(SporkManager::new(clock.clone(), params.spork_pubkey.clone()));

        let manager = Arc::new(ServiceNodeManager::new(
            clock.clone(),
            chain.clone(),
            params.clone(),
            flags.clone(),
            sporks.clone(),
            outbound.clone(),
            fulfilled.clone(),
            identity.clone(),
        ));
        let verifier = Arc::new(PoseVerifier::new(manager.clone(), identity.clone()));
        let payments = Arc::new(PaymentManager::new(
            clock.clone(),
            chain.clone(),
            params.clone(),
            flags.clone(),
            sporks.clone(),
            outbound.clone(),
            fulfilled.clone(),
            manager.clone(),
            identity.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            clock.clone(),
            chain.clone(),
            flags.clone(),
            fulfilled.clone(),
            outbound.clone(),
            manager.clone(),
            payments.clone(),
            identity.clone(),
        ));

        let active = service_node.map(|settings| {
            Arc::new(ActiveServiceNode::new(
                clock.clone(),
                chain.clone(),
                params.clone(),
                flags.clone(),
                manager.clone(),
                outbound.clone(),
                settings.wallet,
                settings.options,
                settings.node_key,
                identity.clone(),
            ))
        });

        Arc::new(Self {
            clock,
            chain,
            params,
            flags,
            outbound,
            fulfilled,
            sporks,
            manager,
            verifier,
            payments,
            sync,
            active,
            identity,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Dispatch one incoming message by command
    pub async fn handle_message(&self, peer: SocketAddr, msg: OverlayMessage) {
        // until the block engine is synced only the kill switches flow
        if !self.flags.is_blockchain_synced()
            && !matches!(
                msg,
                OverlayMessage::Spork(_)
                    | OverlayMessage::GetSporks
                    | OverlayMessage::SyncStatusCount { .. }
            )
        {
            debug!(command = msg.command(), %peer, "ignoring message until blockchain synced");
            return;
        }

        let command = msg.command();
        let result: Result<()> = match msg {
            OverlayMessage::Spork(spork) => {
                self.sporks
                    .process_spork(Some(peer), spork, self.outbound.as_ref())
                    .await
            }
            OverlayMessage::GetSporks => {
                self.sporks
                    .process_get_sporks(peer, self.outbound.as_ref())
                    .await;
                Ok(())
            }
            OverlayMessage::SyncStatusCount { asset, count } => {
                self.sync.process_status_count(peer, asset, count).await;
                Ok(())
            }
            OverlayMessage::Announce(announcement) => self
                .manager
                .process_announcement(Some(peer), announcement)
                .await
                .map(|_| ()),
            OverlayMessage::Ping(ping) => self.manager.process_ping(Some(peer), ping).await,
            OverlayMessage::Dseg(which) => self.manager.process_list_request(peer, which).await,
            OverlayMessage::Verify(verification) => {
                self.verifier.process_message(peer, verification).await
            }
            OverlayMessage::PaymentVote(vote) => {
                self.payments.process_vote(Some(peer), vote).await
            }
            OverlayMessage::PaymentSync(count) => {
                self.payments.process_payment_sync(peer, count).await
            }
            OverlayMessage::GetPaymentBlocks(hashes) => {
                self.payments.process_payment_block_request(peer, hashes).await;
                Ok(())
            }
        };

        if let Err(err) = result {
            let score = err.peer_score();
            if score > 0 {
                warn!(command, %peer, score, error = %err, "misbehaving peer");
                self.outbound.punish(peer, score);
            } else {
                debug!(command, %peer, error = %err, "message rejected");
            }
        }
    }

    /// Chain-engine callback: a new tip connected
    pub async fn updated_block_tip(&self, height: u64) {
        debug!(height, "tip updated");
        self.verifier.check_same_addr().await;

        // service nodes track payouts on every block; everyone else
        // refreshes lazily
        if self.identity.read().await.is_some() {
            let candidates = self.payments.paid_candidates(LAST_PAID_SCAN_BLOCKS).await;
            self.manager.update_last_paid(&candidates, false).await;
        }

        if let Err(err) = self.payments.process_block(height + VOTE_AHEAD).await {
            debug!(error = %err, "vote production skipped");
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Periodic driver: sync ticks every six seconds, sweeps every minute.
    /// Runs until `request_shutdown`.
    pub async fn run_ticks(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            if self.shutdown_requested() {
                info!("tick driver stopping");
                return;
            }
            tick += 1;

            if tick % 6 == 0 {
                self.sync.process_tick().await;
            }

            if tick % 60 == 15 {
                if let Some(active) = &self.active {
                    if let Err(err) = active.manage_state().await {
                        warn!(error = %err, "activation state check failed");
                    }
                }
            }

            if tick % 60 == 30 {
                self.verifier.do_full_verification_step().await;
            }

            if tick % 60 == 0 {
                self.manager.check_and_remove().await;
                self.payments.check_and_remove().await;
                self.verifier.cleanup().await;
                self.fulfilled.purge_expired().await;
                while let Some((addr, outpoint)) = self.manager.pop_scheduled_recovery_ask().await
                {
                    self.outbound
                        .send(addr, OverlayMessage::Dseg(Some(outpoint)));
                }
            }
        }
    }

    /// Persist registry, payments and sporks
    pub async fn save_state(&self, store: &Store) -> Result<()> {
        store
            .save(STORE_REGISTRY, &self.manager.snapshot().await)
            .map_err(|e| crate::error::OverlayError::Storage(e.to_string()))?;
        store
            .save(STORE_PAYMENTS, &self.payments.snapshot().await)
            .map_err(|e| crate::error::OverlayError::Storage(e.to_string()))?;
        store
            .save(STORE_SPORKS, &self.sporks.snapshot().await)
            .map_err(|e| crate::error::OverlayError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Restore whatever state files are present and valid
    pub async fn load_state(&self, store: &Store) -> Result<()> {
        if let Some(snapshot) = store
            .load(STORE_REGISTRY)
            .map_err(|e| crate::error::OverlayError::Storage(e.to_string()))?
        {
            self.manager.restore(snapshot).await;
        }
        if let Some(snapshot) = store
            .load(STORE_PAYMENTS)
            .map_err(|e| crate::error::OverlayError::Storage(e.to_string()))?
        {
            self.payments.restore(snapshot).await;
        }
        if let Some(sporks) = store
            .load(STORE_SPORKS)
            .map_err(|e| crate::error::OverlayError::Storage(e.to_string()))?
        {
            self.sporks.restore(sporks).await;
        }
        Ok(())
    }
}
