//! Kill-switch registry
//!
//! Signed integer-valued global flags ("sporks") that switch overlay
//! subsystems on and off at runtime. A spork stores an activation epoch and
//! is active once that epoch has passed; the all-future sentinel means off.
//! Updates are only accepted under the configured master key and are
//! relayed onward. Peers are asked for the current set before any other
//! sync step.

use crate::error::{OverlayError, Result};
use crate::message::OverlayMessage;
use crate::outbound::Outbound;
use meridian_core::{Clock, Hash256};
use meridian_crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Epoch value meaning "never active"
pub const SPORK_OFF: i64 = 4_070_908_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SporkId(pub u32);

/// Raises the minimum accepted protocol version to the current one
pub const SPORK_PROTOCOL_VERSION_ON: SporkId = SporkId(10001);
/// Fee payment checks (stored for the fee subsystem)
pub const SPORK_FEE_PAYMENT_START: SporkId = SporkId(10002);
pub const SPORK_FEE_PAYMENT_ENFORCEMENT: SporkId = SporkId(10003);
/// Payee validation of the coinbase is performed
pub const SPORK_PAYMENT_START: SporkId = SporkId(10004);
/// Blocks failing payee validation are rejected
pub const SPORK_PAYMENT_ENFORCEMENT: SporkId = SporkId(10005);
/// Instructs the client to re-evaluate N recent blocks
pub const SPORK_RECONSIDER_BLOCKS: SporkId = SporkId(10007);
/// Mint-subsystem switches; the overlay stores and relays them only
pub const SPORK_SIGMA_NEW: SporkId = SporkId(10009);
pub const SPORK_SIGMA: SporkId = SporkId(10010);

const SPORK_START: u32 = 10001;
const SPORK_END: u32 = 10010;

impl SporkId {
    pub fn name(&self) -> &'static str {
        match *self {
            SPORK_PROTOCOL_VERSION_ON => "SPORK_1_PROTOCOL_VERSION_ON",
            SPORK_FEE_PAYMENT_START => "SPORK_2_FEE_PAYMENT_START",
            SPORK_FEE_PAYMENT_ENFORCEMENT => "SPORK_3_FEE_PAYMENT_ENFORCEMENT",
            SPORK_PAYMENT_START => "SPORK_4_PAYMENT_START",
            SPORK_PAYMENT_ENFORCEMENT => "SPORK_5_PAYMENT_ENFORCEMENT",
            SPORK_RECONSIDER_BLOCKS => "SPORK_7_RECONSIDER_BLOCKS",
            SPORK_SIGMA_NEW => "SPORK_9_SIGMA_NEW",
            SPORK_SIGMA => "SPORK_10_SIGMA",
            _ => "SPORK_UNKNOWN",
        }
    }

    pub fn is_known(&self) -> bool {
        (SPORK_START..=SPORK_END).contains(&self.0) && self.0 != 10006 && self.0 != 10008
    }

    /// Default value when no signed update has been seen
    pub fn default_value(&self) -> i64 {
        match *self {
            SPORK_RECONSIDER_BLOCKS => 0,
            _ => SPORK_OFF,
        }
    }
}

/// Signed kill-switch update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SporkMessage {
    pub id: SporkId,
    pub value: i64,
    pub time_signed: i64,
    pub signature: String,
}

impl SporkMessage {
    pub fn hash(&self) -> Hash256 {
        Hash256(meridian_crypto::hash256(self.canonical().as_bytes()))
    }

    fn canonical(&self) -> String {
        format!("{}{}{}", self.id.0, self.value, self.time_signed)
    }

    pub fn sign(&mut self, key: &KeyPair) {
        self.signature = key.sign_message(&self.canonical());
    }

    pub fn check_signature(&self, master_pubkey: &str) -> bool {
        meridian_crypto::verify_message(master_pubkey, &self.canonical(), &self.signature).is_ok()
    }
}

pub struct SporkManager {
    clock: Arc<dyn Clock>,
    master_pubkey: String,
    master_key: RwLock<Option<KeyPair>>,
    active: RwLock<HashMap<SporkId, SporkMessage>>,
}

impl SporkManager {
    pub fn new(clock: Arc<dyn Clock>, master_pubkey: String) -> Self {
        Self {
            clock,
            master_pubkey,
            master_key: RwLock::new(None),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Install the master secret so this node can issue updates
    pub async fn set_master_key(&self, secret_hex: &str) -> Result<()> {
        let key = KeyPair::from_secret_hex(secret_hex)?;
        if key.public_key_hex() != self.master_pubkey {
            return Err(OverlayError::Config(
                "spork secret does not match the configured master key".into(),
            ));
        }
        *self.master_key.write().await = Some(key);
        Ok(())
    }

    /// Handle an incoming SPORK message
    pub async fn process_spork(
        &self,
        peer: Option<SocketAddr>,
        spork: SporkMessage,
        outbound: &dyn Outbound,
    ) -> Result<()> {
        let now = self.clock.now();
        if spork.time_signed > now + 2 * 60 * 60 {
            return Err(OverlayError::validation(
                format!("spork {} signed too far in the future", spork.id.0),
                100,
            ));
        }

        {
            let active = self.active.read().await;
            if let Some(existing) = active.get(&spork.id) {
                if existing.time_signed >= spork.time_signed {
                    debug!(spork = spork.id.name(), "seen");
                    return Err(OverlayError::Duplicate("spork"));
                }
            }
        }

        if !spork.check_signature(&self.master_pubkey) {
            warn!(spork = spork.id.name(), ?peer, "invalid spork signature");
            return Err(OverlayError::validation("invalid spork signature", 100));
        }

        info!(
            spork = spork.id.name(),
            value = spork.value,
            "new spork accepted"
        );
        self.active.write().await.insert(spork.id, spork.clone());
        outbound.relay(OverlayMessage::Spork(spork));
        Ok(())
    }

    /// Handle GETSPORKS: send the stored set to the asking peer
    pub async fn process_get_sporks(&self, peer: SocketAddr, outbound: &dyn Outbound) {
        let active = self.active.read().await;
        for spork in active.values() {
            outbound.send(peer, OverlayMessage::Spork(spork.clone()));
        }
    }

    /// Sign and publish an update; requires the master secret
    pub async fn update_spork(
        &self,
        id: SporkId,
        value: i64,
        outbound: &dyn Outbound,
    ) -> Result<()> {
        let mut spork = SporkMessage {
            id,
            value,
            time_signed: self.clock.now(),
            signature: String::new(),
        };
        {
            let key = self.master_key.read().await;
            let key = key
                .as_ref()
                .ok_or_else(|| OverlayError::Config("spork master secret not set".into()))?;
            spork.sign(key);
        }
        self.process_spork(None, spork, outbound).await
    }

    pub async fn value(&self, id: SporkId) -> i64 {
        self.active
            .read()
            .await
            .get(&id)
            .map(|s| s.value)
            .unwrap_or_else(|| id.default_value())
    }

    /// A spork is active once its epoch value is in the past
    pub async fn is_active(&self, id: SporkId) -> bool {
        self.value(id).await <= self.clock.now()
    }

    /// Minimum protocol version peers must speak, raised to the current
    /// version while `SPORK_1_PROTOCOL_VERSION_ON` is active.
    pub async fn min_protocol_version(&self, base_min: u32, current: u32) -> u32 {
        if self.is_active(SPORK_PROTOCOL_VERSION_ON).await {
            current
        } else {
            base_min
        }
    }

    pub async fn snapshot(&self) -> Vec<SporkMessage> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn restore(&self, sporks: Vec<SporkMessage>) {
        let mut active = self.active.write().await;
        for spork in sporks {
            if spork.check_signature(&self.master_pubkey) {
                active.insert(spork.id, spork);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::MemoryOutbox;
    use meridian_core::ManualClock;

    fn setup() -> (Arc<ManualClock>, SporkManager, KeyPair, MemoryOutbox) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let master = KeyPair::generate();
        let manager = SporkManager::new(clock.clone(), master.public_key_hex());
        (clock, manager, master, MemoryOutbox::new())
    }

    fn signed(master: &KeyPair, id: SporkId, value: i64, time_signed: i64) -> SporkMessage {
        let mut spork = SporkMessage {
            id,
            value,
            time_signed,
            signature: String::new(),
        };
        spork.sign(master);
        spork
    }

    #[tokio::test]
    async fn accepts_signed_update_and_relays() {
        let (clock, manager, master, outbox) = setup();
        let spork = signed(&master, SPORK_PAYMENT_START, clock.now() - 10, clock.now());
        manager
            .process_spork(None, spork, &outbox)
            .await
            .expect("valid spork");
        assert!(manager.is_active(SPORK_PAYMENT_START).await);
        assert_eq!(outbox.relayed_commands(), vec!["spork"]);
    }

    #[tokio::test]
    async fn rejects_unsigned_update() {
        let (clock, manager, _master, outbox) = setup();
        let rogue = KeyPair::generate();
        let spork = signed(&rogue, SPORK_PAYMENT_START, 0, clock.now());
        let err = manager
            .process_spork(None, spork, &outbox)
            .await
            .expect_err("rogue spork");
        assert_eq!(err.peer_score(), 100);
        assert!(!manager.is_active(SPORK_PAYMENT_START).await);
    }

    #[tokio::test]
    async fn duplicate_is_silently_dropped() {
        let (clock, manager, master, outbox) = setup();
        let spork = signed(&master, SPORK_SIGMA, 0, clock.now());
        manager
            .process_spork(None, spork.clone(), &outbox)
            .await
            .expect("first");
        let err = manager
            .process_spork(None, spork, &outbox)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, OverlayError::Duplicate(_)));
        assert_eq!(err.peer_score(), 0);
        assert_eq!(outbox.relayed_commands().len(), 1);
    }

    #[tokio::test]
    async fn sentinel_means_off() {
        let (_clock, manager, _master, _outbox) = setup();
        assert!(!manager.is_active(SPORK_PAYMENT_ENFORCEMENT).await);
        assert_eq!(manager.value(SPORK_PAYMENT_ENFORCEMENT).await, SPORK_OFF);
        // Reconsider-blocks defaults to zero blocks, which is "active" but a
        // no-op for the block engine.
        assert_eq!(manager.value(SPORK_RECONSIDER_BLOCKS).await, 0);
    }

    #[tokio::test]
    async fn min_protocol_raised_when_spork_active() {
        let (clock, manager, master, outbox) = setup();
        assert_eq!(manager.min_protocol_version(70210, 70213).await, 70210);
        let spork = signed(
            &master,
            SPORK_PROTOCOL_VERSION_ON,
            clock.now() - 1,
            clock.now(),
        );
        manager
            .process_spork(None, spork, &outbox)
            .await
            .expect("valid");
        assert_eq!(manager.min_protocol_version(70210, 70213).await, 70213);
    }

    #[tokio::test]
    async fn get_sporks_sends_stored_set() {
        let (clock, manager, master, outbox) = setup();
        for id in [SPORK_PAYMENT_START, SPORK_SIGMA] {
            let spork = signed(&master, id, 0, clock.now());
            manager
                .process_spork(None, spork, &outbox)
                .await
                .expect("valid");
        }
        let peer: SocketAddr = "10.1.1.1:29100".parse().unwrap();
        manager.process_get_sporks(peer, &outbox).await;
        assert_eq!(outbox.sent_to(peer).len(), 2);
    }
}
