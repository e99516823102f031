//! Own-node activation controller
//!
//! Decides whether this process is a service node, whether it is active,
//! and when to ping. LOCAL mode holds the collateral in the attached
//! wallet and issues its own announcement; REMOTE mode only signs pings
//! for a record announced elsewhere.

use crate::announce::{valid_service_address, Announcement};
use crate::error::Result;
use crate::manager::ServiceNodeManager;
use crate::message::OverlayMessage;
use crate::node::{NodeState, ServiceNode, MIN_PING_SECONDS};
use crate::outbound::Outbound;
use crate::ping::Ping;
use meridian_core::{Amount, ChainView, Clock, OutPoint, Params, SyncFlags, TxId};
use meridian_crypto::KeyPair;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Activation states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Initial,
    SyncInProcess,
    InputTooNew,
    NotCapable,
    Started,
}

impl ActiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveState::Initial => "INITIAL",
            ActiveState::SyncInProcess => "SYNC_IN_PROCESS",
            ActiveState::InputTooNew => "INPUT_TOO_NEW",
            ActiveState::NotCapable => "NOT_CAPABLE",
            ActiveState::Started => "STARTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveMode {
    Unknown,
    Remote,
    Local,
}

/// Identity of our running service node once activated
#[derive(Clone)]
pub struct ActiveIdentity {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub node_key: KeyPair,
}

/// Collateral input handed out by the wallet
pub struct CollateralInput {
    pub outpoint: OutPoint,
    pub collateral_key: KeyPair,
}

/// The slice of the wallet the activation controller needs
pub trait WalletBridge: Send + Sync {
    fn is_available(&self) -> bool;
    fn is_locked(&self) -> bool;
    fn balance(&self) -> Amount;
    /// Find a collateral-sized input, optionally pinned to a specific output
    fn collateral_input(&self, txid: Option<TxId>, index: Option<u32>) -> Option<CollateralInput>;
    /// Lock the coin so it cannot be spent while the node runs
    fn lock_coin(&self, outpoint: &OutPoint);
}

/// Static options feeding activation (from configuration)
#[derive(Clone, Default)]
pub struct ActiveOptions {
    /// The node accepts inbound connections
    pub listen: bool,
    /// Preferred external address, if configured
    pub external_address: Option<SocketAddr>,
    /// Pin the collateral to a specific outpoint
    pub collateral_txid: Option<TxId>,
    pub collateral_index: Option<u32>,
}

struct ActiveInner {
    state: ActiveState,
    mode: ActiveMode,
    not_capable_reason: String,
    service: Option<SocketAddr>,
    outpoint: Option<OutPoint>,
    pinger_enabled: bool,
}

pub struct ActiveServiceNode {
    clock: Arc<dyn Clock>,
    chain: Arc<dyn ChainView>,
    params: Params,
    flags: Arc<SyncFlags>,
    manager: Arc<ServiceNodeManager>,
    outbound: Arc<dyn Outbound>,
    wallet: Arc<dyn WalletBridge>,
    options: ActiveOptions,
    node_key: KeyPair,
    identity: Arc<RwLock<Option<ActiveIdentity>>>,
    inner: RwLock<ActiveInner>,
}

impl ActiveServiceNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        chain: Arc<dyn ChainView>,
        params: Params,
        flags: Arc<SyncFlags>,
        manager: Arc<ServiceNodeManager>,
        outbound: Arc<dyn Outbound>,
        wallet: Arc<dyn WalletBridge>,
        options: ActiveOptions,
        node_key: KeyPair,
        identity: Arc<RwLock<Option<ActiveIdentity>>>,
    ) -> Self {
        Self {
            clock,
            chain,
            params,
            flags,
            manager,
            outbound,
            wallet,
            options,
            node_key,
            identity,
            inner: RwLock::new(ActiveInner {
                state: ActiveState::Initial,
                mode: ActiveMode::Unknown,
                not_capable_reason: String::new(),
                service: None,
                outpoint: None,
                pinger_enabled: false,
            }),
        }
    }

    pub async fn state(&self) -> ActiveState {
        self.inner.read().await.state
    }

    pub async fn mode(&self) -> ActiveMode {
        self.inner.read().await.mode
    }

    /// Human-readable status for the status API
    pub async fn status(&self) -> String {
        let inner = self.inner.read().await;
        match inner.state {
            ActiveState::Initial => "Node just started, not yet activated".to_string(),
            ActiveState::SyncInProcess => {
                "Sync in progress. Must wait until sync is complete to start".to_string()
            }
            ActiveState::InputTooNew => format!(
                "Collateral input must have at least {} confirmations",
                self.params.min_collateral_confirmations
            ),
            ActiveState::NotCapable => format!("Not capable: {}", inner.not_capable_reason),
            ActiveState::Started => "Service node successfully started".to_string(),
        }
    }

    async fn set_not_capable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write().await;
        inner.state = ActiveState::NotCapable;
        inner.not_capable_reason = reason.clone();
        drop(inner);
        warn!(reason = %reason, "servicenode not capable");
    }

    /// Main state evaluation, run periodically by the tick driver
    pub async fn manage_state(&self) -> Result<()> {
        if self.params.network != meridian_core::Network::Regtest
            && !self.flags.is_blockchain_synced()
        {
            self.inner.write().await.state = ActiveState::SyncInProcess;
            return Ok(());
        }
        {
            let mut inner = self.inner.write().await;
            if inner.state == ActiveState::SyncInProcess {
                inner.state = ActiveState::Initial;
            }
        }

        let mode = self.inner.read().await.mode;
        if mode == ActiveMode::Unknown {
            self.manage_state_initial().await;
        }

        let mode = self.inner.read().await.mode;
        match mode {
            ActiveMode::Remote => self.manage_state_remote().await,
            ActiveMode::Local => {
                // try remote start first so a running node can be restarted
                // without recreating its announcement
                self.manage_state_remote().await;
                if self.inner.read().await.state != ActiveState::Started {
                    self.manage_state_local().await;
                }
            }
            ActiveMode::Unknown => {}
        }

        self.send_ping().await;
        Ok(())
    }

    async fn manage_state_initial(&self) {
        if !self.options.listen {
            self.set_not_capable(
                "service node must accept connections from outside, set listen=1",
            )
            .await;
            return;
        }

        // prefer the configured external address, fall back to what peers see
        let service = self
            .options
            .external_address
            .or_else(|| self.outbound.external_address());
        let Some(service) = service else {
            if self.outbound.peers().is_empty() {
                self.set_not_capable(
                    "can't detect valid external address, will retry when peers connect",
                )
                .await;
            } else {
                self.set_not_capable(
                    "can't detect valid external address, consider the externalip option",
                )
                .await;
            }
            return;
        };
        if !valid_service_address(&service, &self.params) {
            self.set_not_capable(format!(
                "invalid external address {service} for {}",
                self.params.network
            ))
            .await;
            return;
        }

        debug!(%service, "checking inbound connection");
        if !self.outbound.probe(service) {
            self.set_not_capable(format!("could not connect to {service}")).await;
            return;
        }
        self.inner.write().await.service = Some(service);

        // default to REMOTE; a wallet holding the collateral upgrades to LOCAL
        self.inner.write().await.mode = ActiveMode::Remote;

        if !self.wallet.is_available() {
            debug!("wallet not available");
            return;
        }
        if self.wallet.is_locked() {
            debug!("wallet is locked");
            return;
        }
        if self.wallet.balance() < self.params.collateral_amount {
            debug!("wallet balance below collateral");
            return;
        }
        if self
            .wallet
            .collateral_input(self.options.collateral_txid, self.options.collateral_index)
            .is_some()
        {
            self.inner.write().await.mode = ActiveMode::Local;
        }
    }

    async fn manage_state_remote(&self) {
        let our_pubkey = self.node_key.public_key_hex();
        let Some(record) = self.manager.find_by_node_pubkey(&our_pubkey).await else {
            self.set_not_capable("service node not in the registry").await;
            return;
        };

        let min_proto = self.manager.min_protocol().await;
        if record.protocol_version < min_proto {
            self.set_not_capable("invalid protocol version").await;
            return;
        }
        let service = self.inner.read().await.service;
        if let Some(service) = service {
            if record.addr != service {
                self.set_not_capable(
                    "broadcast address does not match our external address; \
                     issue a new announcement if the IP changed",
                )
                .await;
                return;
            }
        }
        if !ServiceNode::is_valid_state_for_auto_start(record.state) {
            self.set_not_capable(format!("service node in {} state", record.state))
                .await;
            return;
        }

        let mut inner = self.inner.write().await;
        if inner.state != ActiveState::Started {
            info!(servicenode = %record.outpoint, "remote activation complete");
            inner.state = ActiveState::Started;
            inner.outpoint = Some(record.outpoint);
            inner.service = Some(record.addr);
            inner.pinger_enabled = true;
            drop(inner);
            *self.identity.write().await = Some(ActiveIdentity {
                outpoint: record.outpoint,
                addr: record.addr,
                node_key: self.node_key.clone(),
            });
        }
    }

    async fn manage_state_local(&self) {
        if self.inner.read().await.state == ActiveState::Started {
            return;
        }
        let Some(input) = self
            .wallet
            .collateral_input(self.options.collateral_txid, self.options.collateral_index)
        else {
            return;
        };

        let confirmations = self.chain.confirmations(&input.outpoint).unwrap_or(0);
        if confirmations < self.params.min_collateral_confirmations {
            let mut inner = self.inner.write().await;
            inner.state = ActiveState::InputTooNew;
            inner.not_capable_reason =
                format!("collateral has {confirmations} confirmations");
            return;
        }

        self.wallet.lock_coin(&input.outpoint);

        let service = match self.inner.read().await.service {
            Some(service) => service,
            None => {
                self.set_not_capable("no external address for announcement").await;
                return;
            }
        };

        let now = self.clock.now();
        let announcement = match Announcement::create(
            input.outpoint,
            service,
            &input.collateral_key,
            &self.node_key,
            self.params.protocol_version,
            self.chain.as_ref(),
            now,
        ) {
            Ok(announcement) => announcement,
            Err(err) => {
                self.set_not_capable(format!("error creating announcement: {err}"))
                    .await;
                return;
            }
        };

        {
            let mut inner = self.inner.write().await;
            inner.state = ActiveState::Started;
            inner.outpoint = Some(input.outpoint);
            inner.pinger_enabled = true;
        }
        *self.identity.write().await = Some(ActiveIdentity {
            outpoint: input.outpoint,
            addr: service,
            node_key: self.node_key.clone(),
        });

        info!(servicenode = %input.outpoint, "local activation: relaying announcement");
        if let Err(err) = self
            .manager
            .update_own_announcement(announcement.clone())
            .await
        {
            warn!(error = %err, "own announcement rejected locally");
        }
        self.outbound.relay(OverlayMessage::Announce(announcement));
    }

    /// Sign and relay a ping for our record, at most every `MIN_PING_SECONDS`
    pub async fn send_ping(&self) -> bool {
        let (enabled, outpoint) = {
            let inner = self.inner.read().await;
            (inner.pinger_enabled, inner.outpoint)
        };
        if !enabled {
            return false;
        }
        let Some(outpoint) = outpoint else {
            return false;
        };

        if !self.manager.has(&outpoint).await {
            self.set_not_capable("service node not in the registry").await;
            let mut inner = self.inner.write().await;
            inner.pinger_enabled = false;
            return false;
        }

        let now = self.clock.now();
        if let Some(record) = self.manager.get(&outpoint).await {
            if record.is_pinged_within(MIN_PING_SECONDS, now) {
                debug!("too early to send a ping");
                return false;
            }
        }

        let Some(mut ping) = Ping::create(outpoint, self.chain.as_ref(), now) else {
            warn!("chain too short to build a ping");
            return false;
        };
        ping.sign(&self.node_key, now);

        if !self.manager.set_own_ping(ping.clone()).await {
            return false;
        }
        info!(servicenode = %outpoint, "relaying ping");
        self.outbound.relay(OverlayMessage::Ping(ping));
        true
    }

    /// Whether our record is in a state worth keeping alive
    pub async fn is_started(&self) -> bool {
        self.inner.read().await.state == ActiveState::Started
    }

    pub async fn not_capable_reason(&self) -> String {
        self.inner.read().await.not_capable_reason.clone()
    }

    /// Record state as the registry sees us, for the status surface
    pub async fn registry_state(&self) -> Option<NodeState> {
        let outpoint = self.inner.read().await.outpoint?;
        self.manager.get(&outpoint).await.map(|node| node.state)
    }
}

/// Wallet double for tests and for nodes running without a wallet
#[derive(Default)]
pub struct NoWallet;

impl WalletBridge for NoWallet {
    fn is_available(&self) -> bool {
        false
    }
    fn is_locked(&self) -> bool {
        true
    }
    fn balance(&self) -> Amount {
        0
    }
    fn collateral_input(&self, _txid: Option<TxId>, _index: Option<u32>) -> Option<CollateralInput> {
        None
    }
    fn lock_coin(&self, _outpoint: &OutPoint) {}
}
