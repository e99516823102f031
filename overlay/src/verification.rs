//! Proof-of-service verification
//!
//! Highly-ranked nodes challenge other nodes to sign a fresh nonce tied to
//! a recent block hash. A correct reply clears the target's PoSe score and
//! is re-broadcast (signed by the verifier) so the rest of the network can
//! converge without verifying everyone itself. Records sharing one address
//! keep the verified one; the impostors accumulate score until banned.

use crate::active::ActiveIdentity;
use crate::error::{OverlayError, Result};
use crate::manager::{
    ServiceNodeManager, MAX_POSE_BLOCKS, MAX_POSE_CONNECTIONS, MAX_POSE_RANK,
};
use crate::message::OverlayMessage;
use meridian_core::{Hash256, OutPoint};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const VERIFY_REQUEST_TAG: &str = "mnverify-request";
const VERIFY_REPLY_TAG: &str = "mnverify-reply";
const VERIFY_DONE_TAG: &str = "mnverify-done";

/// MNVERIFY payload. Which signatures are filled decides the role:
/// no sig1 = request, sig1 only = reply, sig1 + sig2 = broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub addr: SocketAddr,
    pub nonce: u64,
    pub block_height: u64,
    #[serde(default)]
    pub sig1: String,
    #[serde(default)]
    pub outpoint1: Option<OutPoint>,
    #[serde(default)]
    pub outpoint2: Option<OutPoint>,
    #[serde(default)]
    pub sig2: String,
}

impl Verification {
    pub fn request(addr: SocketAddr, nonce: u64, block_height: u64) -> Self {
        Self {
            addr,
            nonce,
            block_height,
            sig1: String::new(),
            outpoint1: None,
            outpoint2: None,
            sig2: String::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.sig1.is_empty()
    }

    pub fn is_reply(&self) -> bool {
        !self.sig1.is_empty() && self.sig2.is_empty()
    }

    pub fn hash(&self) -> Hash256 {
        let op1 = self.outpoint1.map(|o| o.to_string()).unwrap_or_default();
        let op2 = self.outpoint2.map(|o| o.to_string()).unwrap_or_default();
        Hash256(meridian_crypto::hash256(
            format!("{}{}{}{}{}", self.addr, self.nonce, self.block_height, op1, op2).as_bytes(),
        ))
    }

    /// Canonical string the challenged node signs
    pub fn canonical1(&self, block_hash: &Hash256) -> String {
        format!("{}{}{}", self.addr, self.nonce, block_hash)
    }

    /// Canonical string the verifier signs over the pair of outpoints
    pub fn canonical2(&self, block_hash: &Hash256) -> Option<String> {
        let op1 = self.outpoint1?;
        let op2 = self.outpoint2?;
        Some(format!(
            "{}{}{}{}{}",
            self.addr, self.nonce, block_hash, op1, op2
        ))
    }
}

#[derive(Default)]
struct VerifierInner {
    /// Nonce challenges we sent, by target address
    we_asked: HashMap<SocketAddr, Verification>,
    seen: HashMap<Hash256, Verification>,
}

pub struct PoseVerifier {
    manager: Arc<ServiceNodeManager>,
    identity: Arc<RwLock<Option<ActiveIdentity>>>,
    inner: RwLock<VerifierInner>,
}

impl PoseVerifier {
    pub fn new(
        manager: Arc<ServiceNodeManager>,
        identity: Arc<RwLock<Option<ActiveIdentity>>>,
    ) -> Self {
        Self {
            manager,
            identity,
            inner: RwLock::new(VerifierInner::default()),
        }
    }

    /// One verification sweep: when we rank in the top `MAX_POSE_RANK`,
    /// challenge targets starting at `MAX_POSE_RANK + own_rank - 1`,
    /// stepping by `MAX_POSE_CONNECTIONS`.
    pub async fn do_full_verification_step(&self) {
        let Some(identity) = self.identity.read().await.clone() else {
            return;
        };
        if !self.manager.flags().is_synced() {
            return;
        }
        let Some(tip) = self.manager.chain().tip_height() else {
            return;
        };
        let ranks = self.manager.ranks(tip.saturating_sub(1)).await;

        let Some(my_rank) = ranks
            .iter()
            .find(|(_, node)| node.outpoint == identity.outpoint)
            .map(|(rank, _)| *rank as usize)
        else {
            // list too short or our node not enabled
            return;
        };
        if my_rank > MAX_POSE_RANK {
            debug!(rank = my_rank, "not in top {MAX_POSE_RANK}, skipping verification");
            return;
        }
        debug!(
            rank = my_rank,
            total = ranks.len(),
            "verifying up to {MAX_POSE_CONNECTIONS} nodes"
        );

        let mut offset = MAX_POSE_RANK + my_rank - 1;
        let mut sent = 0usize;
        while offset < ranks.len() {
            let (_, target) = &ranks[offset];
            if target.pose_verified || target.is_pose_banned() {
                offset += MAX_POSE_CONNECTIONS;
                continue;
            }
            debug!(servicenode = %target.outpoint, addr = %target.addr, "verifying");
            if self.send_verify_request(target.addr, tip).await {
                sent += 1;
                if sent >= MAX_POSE_CONNECTIONS {
                    break;
                }
            }
            offset += MAX_POSE_CONNECTIONS;
        }
        debug!(sent, "sent verification requests");
    }

    async fn send_verify_request(&self, addr: SocketAddr, tip: u64) -> bool {
        let fulfilled = self.manager.fulfilled();
        if fulfilled.has(addr, VERIFY_REQUEST_TAG).await {
            debug!(%addr, "verification already requested recently");
            return false;
        }
        if !self.manager.outbound().probe(addr) {
            warn!(%addr, "cannot connect to node to verify it");
            return false;
        }
        fulfilled.mark(addr, VERIFY_REQUEST_TAG).await;

        let nonce = rand::thread_rng().gen_range(1..1_000_000u64);
        let verification = Verification::request(addr, nonce, tip.saturating_sub(1));
        self.inner
            .write()
            .await
            .we_asked
            .insert(addr, verification.clone());
        info!(%addr, nonce, "verifying node");
        self.manager
            .outbound()
            .send(addr, OverlayMessage::Verify(verification));
        true
    }

    /// Dispatch an incoming MNVERIFY by role
    pub async fn process_message(&self, peer: SocketAddr, verification: Verification) -> Result<()> {
        if verification.is_request() {
            self.send_verify_reply(peer, verification).await
        } else if verification.is_reply() {
            self.process_verify_reply(peer, verification).await
        } else {
            self.process_verify_broadcast(peer, verification).await
        }
    }

    /// Someone asked us to prove we control the address we advertise
    async fn send_verify_reply(&self, peer: SocketAddr, mut verification: Verification) -> Result<()> {
        let Some(identity) = self.identity.read().await.clone() else {
            // only service nodes sign these; a regular node stays silent in
            // case a malicious peer is probing with our address
            return Ok(());
        };

        let fulfilled = self.manager.fulfilled();
        if fulfilled.has(peer, VERIFY_REPLY_TAG).await {
            return Err(OverlayError::validation(
                format!("peer {peer} asked to verify us too often"),
                20,
            ));
        }

        let Some(block_hash) = self.manager.chain().block_hash(verification.block_height) else {
            warn!(height = verification.block_height, "no block hash for verify request");
            return Ok(());
        };

        let message = format!("{}{}{}", identity.addr, verification.nonce, block_hash);
        verification.sig1 = identity.node_key.sign_message(&message);
        self.manager
            .outbound()
            .send(peer, OverlayMessage::Verify(verification));
        fulfilled.mark(peer, VERIFY_REPLY_TAG).await;
        Ok(())
    }

    /// A node we challenged answered
    async fn process_verify_reply(&self, peer: SocketAddr, mut verification: Verification) -> Result<()> {
        let fulfilled = self.manager.fulfilled();

        // did we even ask?
        if !fulfilled.has(peer, VERIFY_REQUEST_TAG).await {
            return Err(OverlayError::validation(
                format!("we did not ask {peer} for verification"),
                20,
            ));
        }
        let asked = self.inner.read().await.we_asked.get(&peer).cloned();
        let Some(asked) = asked else {
            return Err(OverlayError::validation(
                format!("no pending challenge for {peer}"),
                20,
            ));
        };
        if asked.nonce != verification.nonce {
            return Err(OverlayError::validation(
                format!(
                    "wrong nonce from {peer}: requested {}, received {}",
                    asked.nonce, verification.nonce
                ),
                20,
            ));
        }
        if asked.block_height != verification.block_height {
            return Err(OverlayError::validation(
                format!(
                    "wrong block height from {peer}: requested {}, received {}",
                    asked.block_height, verification.block_height
                ),
                20,
            ));
        }
        let Some(block_hash) = self.manager.chain().block_hash(verification.block_height) else {
            return Err(OverlayError::ChainUnavailable);
        };
        if fulfilled.has(peer, VERIFY_DONE_TAG).await {
            return Err(OverlayError::validation(
                format!("already verified {peer} recently"),
                20,
            ));
        }

        let message1 = format!("{}{}{}", peer, verification.nonce, block_hash);
        let same_addr: Vec<_> = self
            .manager
            .all()
            .await
            .into_iter()
            .filter(|node| node.addr == peer)
            .collect();

        let mut real: Option<OutPoint> = None;
        let mut fakes: Vec<OutPoint> = Vec::new();
        for node in &same_addr {
            if meridian_crypto::verify_message(&node.node_pubkey, &message1, &verification.sig1)
                .is_ok()
            {
                real = Some(node.outpoint);
            } else {
                fakes.push(node.outpoint);
            }
        }

        let Some(real_outpoint) = real else {
            // nobody at this address signs with a key we know; someone is
            // trying to game the system
            return Err(OverlayError::validation(
                format!("no real servicenode found for address {peer}"),
                20,
            ));
        };

        info!(servicenode = %real_outpoint, addr = %peer, "verified real servicenode");
        self.manager
            .with_node_mut(&real_outpoint, |node| {
                if !node.pose_verified {
                    node.pose_verified = true;
                    node.decrease_pose_score();
                }
            })
            .await;
        fulfilled.mark(peer, VERIFY_DONE_TAG).await;

        // broadcast the outcome if we are an active service node ourselves
        if let Some(identity) = self.identity.read().await.clone() {
            verification.addr = peer;
            verification.outpoint1 = Some(real_outpoint);
            verification.outpoint2 = Some(identity.outpoint);
            if let Some(message2) = verification.canonical2(&block_hash) {
                verification.sig2 = identity.node_key.sign_message(&message2);
                self.inner
                    .write()
                    .await
                    .we_asked
                    .insert(peer, verification.clone());
                self.manager
                    .outbound()
                    .relay(OverlayMessage::Verify(verification));
            }
        }

        for outpoint in &fakes {
            self.manager
                .with_node_mut(outpoint, |node| node.increase_pose_score())
                .await;
        }
        if !fakes.is_empty() {
            info!(count = fakes.len(), addr = %peer, "PoSe score increased for fake servicenodes");
        }
        Ok(())
    }

    /// Second-hop broadcast: some verifier vouches for a node it challenged.
    ///
    /// The historical implementation inverted the sense of both signature
    /// checks on this path, rejecting exactly the broadcasts that verified.
    /// Here a successful verification is treated as success.
    async fn process_verify_broadcast(
        &self,
        peer: SocketAddr,
        verification: Verification,
    ) -> Result<()> {
        let hash = verification.hash();
        {
            let mut inner = self.inner.write().await;
            if inner.seen.contains_key(&hash) {
                return Err(OverlayError::Duplicate("verification"));
            }
            inner.seen.insert(hash, verification.clone());
        }

        let Some(tip) = self.manager.chain().tip_height() else {
            return Err(OverlayError::ChainUnavailable);
        };
        // we don't care about history
        if verification.block_height < tip.saturating_sub(MAX_POSE_BLOCKS) {
            debug!(
                height = verification.block_height,
                tip, "outdated verification broadcast"
            );
            return Ok(());
        }

        let (Some(outpoint1), Some(outpoint2)) = (verification.outpoint1, verification.outpoint2)
        else {
            return Err(OverlayError::validation("broadcast missing outpoints", 100));
        };
        if outpoint1 == outpoint2 {
            // verifying yourself was not a good idea
            return Err(OverlayError::validation(
                format!("same outpoints in verification from {peer}"),
                100,
            ));
        }

        let Some(block_hash) = self.manager.chain().block_hash(verification.block_height) else {
            warn!(height = verification.block_height, "no block hash for verification");
            return Ok(());
        };

        let Some(rank2) = self
            .manager
            .rank(&outpoint2, verification.block_height)
            .await
        else {
            debug!(servicenode = %outpoint2, "cannot calculate verifier rank");
            return Ok(());
        };
        if rank2 as usize > MAX_POSE_RANK {
            debug!(servicenode = %outpoint2, rank = rank2, "verifier not in top {MAX_POSE_RANK}");
            return Ok(());
        }

        let Some(node1) = self.manager.get(&outpoint1).await else {
            return Err(OverlayError::NotReady("verified node unknown"));
        };
        let Some(node2) = self.manager.get(&outpoint2).await else {
            return Err(OverlayError::NotReady("verifier node unknown"));
        };
        if node1.addr != verification.addr {
            return Err(OverlayError::validation(
                format!("address {} does not match record", verification.addr),
                0,
            ));
        }

        let message1 = verification.canonical1(&block_hash);
        meridian_crypto::verify_message(&node1.node_pubkey, &message1, &verification.sig1)
            .map_err(|_| OverlayError::validation("bad verification sig1", 0))?;
        let message2 = verification
            .canonical2(&block_hash)
            .ok_or_else(|| OverlayError::validation("broadcast missing outpoints", 100))?;
        meridian_crypto::verify_message(&node2.node_pubkey, &message2, &verification.sig2)
            .map_err(|_| OverlayError::validation("bad verification sig2", 0))?;

        self.manager
            .with_node_mut(&outpoint1, |node| {
                if !node.pose_verified {
                    node.pose_verified = true;
                    node.decrease_pose_score();
                }
            })
            .await;
        info!(servicenode = %outpoint1, addr = %verification.addr, "verified servicenode by broadcast");
        self.manager
            .outbound()
            .relay(OverlayMessage::Verify(verification.clone()));

        // everyone else advertising the same address gets scored
        let mut scored = 0usize;
        let impostors: Vec<OutPoint> = self
            .manager
            .all()
            .await
            .into_iter()
            .filter(|node| node.addr == verification.addr && node.outpoint != outpoint1)
            .map(|node| node.outpoint)
            .collect();
        for outpoint in impostors {
            self.manager
                .with_node_mut(&outpoint, |node| node.increase_pose_score())
                .await;
            scored += 1;
        }
        if scored > 0 {
            info!(count = scored, addr = %verification.addr, "PoSe score increased for fake servicenodes");
        }
        Ok(())
    }

    /// Ban-score duplicates that share an address with a verified record.
    /// Runs on every tip update.
    pub async fn check_same_addr(&self) {
        if !self.manager.flags().is_synced() {
            return;
        }
        let mut nodes = self.manager.all().await;
        if nodes.is_empty() {
            return;
        }
        nodes.retain(|node| node.is_enabled() || node.is_pre_enabled());
        nodes.sort_by_key(|node| node.addr);

        let mut to_ban: Vec<OutPoint> = Vec::new();
        let mut prev: Option<&crate::node::ServiceNode> = None;
        let mut verified_at_addr: Option<OutPoint> = None;
        for node in &nodes {
            match prev {
                Some(p) if p.addr == node.addr => {
                    if verified_at_addr.is_some() {
                        // another record at this address is verified
                        to_ban.push(node.outpoint);
                    } else if node.pose_verified {
                        // this one is verified; ban the earlier records
                        to_ban.push(p.outpoint);
                        verified_at_addr = Some(node.outpoint);
                    }
                }
                _ => {
                    verified_at_addr = node.pose_verified.then_some(node.outpoint);
                }
            }
            prev = Some(node);
        }

        for outpoint in to_ban {
            info!(servicenode = %outpoint, "increasing PoSe ban score for duplicate address");
            self.manager
                .with_node_mut(&outpoint, |node| node.increase_pose_score())
                .await;
        }
    }

    /// Expire stale challenges and seen broadcasts
    pub async fn cleanup(&self) {
        let Some(tip) = self.manager.chain().tip_height() else {
            return;
        };
        let floor = tip.saturating_sub(MAX_POSE_BLOCKS);
        let mut inner = self.inner.write().await;
        inner.we_asked.retain(|_, v| v.block_height >= floor);
        inner.seen.retain(|_, v| v.block_height >= floor);
    }
}
