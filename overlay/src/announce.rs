//! Service-node announcements
//!
//! An announcement is the full signed record a node gossips when it starts:
//! collateral outpoint, address, both public keys and an embedded ping. The
//! collateral key signs the record; any byte changing requires a fresh
//! announcement.

use crate::error::{OverlayError, Result};
use crate::node::{NodeState, ServiceNode, MIN_ANNOUNCE_SECONDS};
use crate::ping::Ping;
use meridian_core::{ChainView, Hash256, OutPoint, Params, PayScript};
use meridian_crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub collateral_pubkey: String,
    pub node_pubkey: String,
    pub signature: String,
    pub announce_time: i64,
    pub protocol_version: u32,
    pub last_ping: Option<Ping>,
    /// Set on announcements replayed as recovery answers; they bypass the
    /// announce-time monotonicity rule.
    #[serde(default)]
    pub recovery: bool,
}

impl Announcement {
    /// Build and sign a fresh announcement together with its embedded ping
    pub fn create(
        outpoint: OutPoint,
        addr: SocketAddr,
        collateral_key: &KeyPair,
        node_key: &KeyPair,
        protocol_version: u32,
        chain: &dyn ChainView,
        now: i64,
    ) -> Result<Self> {
        let mut ping = Ping::create(outpoint, chain, now)
            .ok_or(OverlayError::NotReady("chain too short to build a ping"))?;
        ping.sign(node_key, now);

        let mut announcement = Self {
            outpoint,
            addr,
            collateral_pubkey: collateral_key.public_key_hex(),
            node_pubkey: node_key.public_key_hex(),
            signature: String::new(),
            announce_time: now,
            protocol_version,
            last_ping: Some(ping),
            recovery: false,
        };
        announcement.sign(collateral_key, now);
        Ok(announcement)
    }

    /// Rebuild the announcement a stored record was created from
    pub fn from_node(node: &ServiceNode) -> Self {
        Self {
            outpoint: node.outpoint,
            addr: node.addr,
            collateral_pubkey: node.collateral_pubkey.clone(),
            node_pubkey: node.node_pubkey.clone(),
            signature: node.announce_signature.clone(),
            announce_time: node.announce_time,
            protocol_version: node.protocol_version,
            last_ping: node.last_ping.clone(),
            recovery: false,
        }
    }

    pub fn hash(&self) -> Hash256 {
        Hash256(meridian_crypto::hash256(
            format!(
                "{}{}{}",
                self.outpoint, self.collateral_pubkey, self.announce_time
            )
            .as_bytes(),
        ))
    }

    fn canonical(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.announce_time,
            meridian_crypto::key_id(&self.collateral_pubkey),
            meridian_crypto::key_id(&self.node_pubkey),
            self.protocol_version
        )
    }

    pub fn sign(&mut self, collateral_key: &KeyPair, now: i64) {
        self.announce_time = now;
        self.signature = collateral_key.sign_message(&self.canonical());
    }

    pub fn check_signature(&self) -> Result<()> {
        meridian_crypto::verify_message(&self.collateral_pubkey, &self.canonical(), &self.signature)
            .map_err(|_| {
                OverlayError::validation(
                    format!("bad announce signature, servicenode={}", self.outpoint),
                    100,
                )
            })
    }

    pub fn payee_script(&self) -> PayScript {
        PayScript::for_pubkey(&self.collateral_pubkey)
    }

    /// Stateless validation. Returns whether the embedded ping checked out;
    /// a record built from an announcement with a bad or missing ping starts
    /// out EXPIRED instead of being rejected.
    pub fn simple_check(
        &self,
        params: &Params,
        chain: &dyn ChainView,
        min_protocol: u32,
        now: i64,
    ) -> Result<bool> {
        if !valid_service_address(&self.addr, params) {
            return Err(OverlayError::validation(
                format!(
                    "invalid address {} for servicenode {}",
                    self.addr, self.outpoint
                ),
                0,
            ));
        }

        // signature from the future (the past is fine)
        if self.announce_time > now + 60 * 60 {
            return Err(OverlayError::validation(
                format!(
                    "announce signature too far in the future, servicenode={}",
                    self.outpoint
                ),
                1,
            ));
        }

        let ping_ok = match &self.last_ping {
            Some(ping) => ping.simple_check(chain, now).is_ok(),
            None => false,
        };

        if self.protocol_version < min_protocol {
            return Err(OverlayError::validation(
                format!(
                    "outdated servicenode {}: protocol {}",
                    self.outpoint, self.protocol_version
                ),
                0,
            ));
        }

        if !meridian_crypto::is_valid_pubkey(&self.collateral_pubkey) {
            return Err(OverlayError::validation("malformed collateral key", 100));
        }
        if !meridian_crypto::is_valid_pubkey(&self.node_pubkey) {
            return Err(OverlayError::validation("malformed node key", 100));
        }

        Ok(ping_ok)
    }

    /// Apply this announcement over an existing record.
    /// `Ok(true)` means the record changed and should be relayed.
    pub fn update_existing(
        &self,
        node: &mut ServiceNode,
        chain: &dyn ChainView,
        flags: &meridian_core::SyncFlags,
        our_node_pubkey: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        if node.announce_time == self.announce_time && !self.recovery {
            // legit duplicate right after startup; nothing to do
            return Err(OverlayError::Duplicate("announcement"));
        }

        // an older announcement than the one stored should never arrive
        // unless someone is playing games
        if node.announce_time > self.announce_time {
            return Err(OverlayError::validation(
                format!(
                    "announce time {} older than stored {} for servicenode {}",
                    self.announce_time, node.announce_time, self.outpoint
                ),
                0,
            ));
        }

        if node.is_pose_banned() {
            return Err(OverlayError::validation(
                format!("servicenode {} is banned by PoSe", self.outpoint),
                0,
            ));
        }

        // collateral association was proven once; afterwards it only has to match
        if node.collateral_pubkey != self.collateral_pubkey {
            return Err(OverlayError::validation(
                "announcement collateral key does not match record",
                33,
            ));
        }

        self.check_signature()?;

        let ours = our_node_pubkey == Some(self.node_pubkey.as_str());
        if node.is_announced_within(MIN_ANNOUNCE_SECONDS, now) && !ours {
            return Err(OverlayError::Duplicate("recent announcement"));
        }

        debug!(servicenode = %self.outpoint, addr = %self.addr, "updated record");
        node.node_pubkey = self.node_pubkey.clone();
        node.announce_time = self.announce_time;
        node.announce_signature = self.signature.clone();
        node.protocol_version = self.protocol_version;
        node.addr = self.addr;
        node.pose_score = 0;
        node.pose_verified = false;
        node.pose_ban_height = 0;
        node.last_checked = 0;
        if let Some(ping) = &self.last_ping {
            if ping.check_and_update(node, true, chain, flags, now).is_ok() {
                // last_ping installed by check_and_update
            }
        }
        Ok(true)
    }

    /// Validate the collateral this record claims. Returns the height the
    /// collateral confirmed at.
    pub fn check_collateral(
        &self,
        chain: &dyn ChainView,
        params: &Params,
        now: i64,
    ) -> Result<u64> {
        let _ = now;
        let Some(utxo) = chain.utxo(&self.outpoint) else {
            // may be a block behind; let the announcement be checked again
            return Err(OverlayError::NotReady("collateral utxo not found"));
        };

        if utxo.value != params.collateral_amount {
            return Err(OverlayError::validation(
                format!(
                    "collateral for servicenode {} has value {}, expected {}",
                    self.outpoint, utxo.value, params.collateral_amount
                ),
                0,
            ));
        }

        let Some(confirmations) = chain.confirmations(&self.outpoint) else {
            return Err(OverlayError::ChainUnavailable);
        };
        if confirmations < params.min_collateral_confirmations {
            warn!(
                servicenode = %self.outpoint,
                confirmations,
                required = params.min_collateral_confirmations,
                "collateral too young"
            );
            return Err(OverlayError::NotReady("collateral not mature"));
        }

        // the outpoint must really belong to the collateral key
        if utxo.script != self.payee_script() {
            return Err(OverlayError::validation(
                "collateral key and outpoint mismatch",
                33,
            ));
        }

        // announce time must not precede the block where the collateral
        // reached its required confirmations
        let conf_height = utxo.height + params.min_collateral_confirmations - 1;
        if let Some(conf_time) = chain.block_time(conf_height) {
            if conf_time > self.announce_time {
                return Err(OverlayError::validation(
                    format!(
                        "announce time {} predates collateral maturity at {}",
                        self.announce_time, conf_time
                    ),
                    0,
                ));
            }
        }

        Ok(utxo.height)
    }

    /// Turn an accepted announcement into a registry record
    pub fn into_node(self, collateral_height: u64) -> ServiceNode {
        ServiceNode {
            outpoint: self.outpoint,
            addr: self.addr,
            collateral_pubkey: self.collateral_pubkey,
            node_pubkey: self.node_pubkey,
            announce_signature: self.signature,
            announce_time: self.announce_time,
            protocol_version: self.protocol_version,
            last_watchdog_vote: self.announce_time,
            last_ping: self.last_ping,
            state: NodeState::Enabled,
            pose_score: 0,
            pose_verified: false,
            pose_ban_height: 0,
            last_paid_block: 0,
            last_paid_time: 0,
            collateral_height: Some(collateral_height),
            last_checked: 0,
        }
    }
}

/// Address policy: routable IPv4 plus the per-network port rule. Regtest
/// accepts anything.
pub fn valid_service_address(addr: &SocketAddr, params: &Params) -> bool {
    if params.network == meridian_core::Network::Regtest {
        return true;
    }
    if !params.port_allowed(addr.port()) {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(ip) => {
            !ip.is_loopback() && !ip.is_private() && !ip.is_unspecified() && !ip.is_link_local()
        }
        IpAddr::V6(_) => false,
    }
}
