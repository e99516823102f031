//! The service-node record and its state machine

use crate::ping::Ping;
use meridian_core::arith::{abs_diff, add_u32, Score};
use meridian_core::{BlockHash, ChainView, Hash256, OutPoint, PayScript};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Minimum interval between pings; also the age an embedded ping must reach
/// before a record leaves PRE_ENABLED.
pub const MIN_PING_SECONDS: i64 = 10 * 60;
/// Window inside which repeated announcements for the same record are dropped
pub const MIN_ANNOUNCE_SECONDS: i64 = 5 * 60;
/// A record without pings for this long is EXPIRED
pub const EXPIRATION_SECONDS: i64 = 65 * 60;
/// A record without pings for this long needs a fresh announcement
pub const NEW_START_REQUIRED_SECONDS: i64 = 180 * 60;
/// Watchdog silence tolerated while the watchdog is active
pub const WATCHDOG_MAX_SECONDS: i64 = 120 * 60;
/// PoSe score at which a record is banned
pub const POSE_BAN_MAX_SCORE: i32 = 5;
/// Per-record check throttle
pub const CHECK_SECONDS: i64 = 5;
/// Oldest ping block hash accepted, in blocks below the tip
pub const PING_MAX_BLOCK_AGE: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    PreEnabled,
    Enabled,
    Expired,
    OutpointSpent,
    UpdateRequired,
    WatchdogExpired,
    NewStartRequired,
    PoseBan,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::PreEnabled => "PRE_ENABLED",
            NodeState::Enabled => "ENABLED",
            NodeState::Expired => "EXPIRED",
            NodeState::OutpointSpent => "OUTPOINT_SPENT",
            NodeState::UpdateRequired => "UPDATE_REQUIRED",
            NodeState::WatchdogExpired => "WATCHDOG_EXPIRED",
            NodeState::NewStartRequired => "NEW_START_REQUIRED",
            NodeState::PoseBan => "POSE_BAN",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs a per-record check needs from the rest of the node
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub chain: &'a dyn ChainView,
    pub now: i64,
    pub list_synced: bool,
    pub watchdog_active: bool,
    /// This record belongs to our own activated service node
    pub our_node: bool,
    pub min_protocol: u32,
    pub registry_size: usize,
}

/// One service node as seen by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNode {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub collateral_pubkey: String,
    pub node_pubkey: String,
    /// Signature of the original announcement, kept so the record can be
    /// served back out as one.
    pub announce_signature: String,
    pub announce_time: i64,
    pub protocol_version: u32,
    pub last_ping: Option<Ping>,
    pub state: NodeState,
    pub pose_score: i32,
    /// Set once a PoSe challenge against this record succeeded
    pub pose_verified: bool,
    /// Height at which a PoSe ban lifts
    pub pose_ban_height: u64,
    pub last_paid_block: u64,
    pub last_paid_time: i64,
    pub last_watchdog_vote: i64,
    /// Cached height of the collateral's confirmation block
    pub collateral_height: Option<u64>,
    #[serde(skip)]
    pub last_checked: i64,
}

impl ServiceNode {
    pub fn is_enabled(&self) -> bool {
        self.state == NodeState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == NodeState::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == NodeState::PoseBan
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == NodeState::NewStartRequired
    }

    pub fn is_update_required(&self) -> bool {
        self.state == NodeState::UpdateRequired
    }

    pub fn is_expired(&self) -> bool {
        self.state == NodeState::Expired
    }

    pub fn is_watchdog_expired(&self) -> bool {
        self.state == NodeState::WatchdogExpired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == NodeState::OutpointSpent
    }

    /// Only ENABLED records qualify for payment
    pub fn is_valid_for_payment(&self) -> bool {
        self.is_enabled()
    }

    /// States a remote operator's node may resume pinging from
    pub fn is_valid_state_for_auto_start(state: NodeState) -> bool {
        matches!(
            state,
            NodeState::Enabled
                | NodeState::PreEnabled
                | NodeState::Expired
                | NodeState::WatchdogExpired
        )
    }

    /// Whether a ping landed within `seconds` of `at`
    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        match &self.last_ping {
            Some(ping) => at - ping.sign_time < seconds,
            None => false,
        }
    }

    pub fn is_announced_within(&self, seconds: i64, now: i64) -> bool {
        now - self.announce_time < seconds
    }

    /// Script the collateral key is paid through
    pub fn payee_script(&self) -> PayScript {
        PayScript::for_pubkey(&self.collateral_pubkey)
    }

    pub fn increase_pose_score(&mut self) {
        self.pose_score = (self.pose_score + 1).min(POSE_BAN_MAX_SCORE);
    }

    pub fn decrease_pose_score(&mut self) {
        self.pose_score = (self.pose_score - 1).max(0);
    }

    /// Deterministic score of this record against a historical block hash:
    /// the absolute distance between H(block_hash ‖ outpoint-aux) and
    /// H(block_hash). Larger is better.
    pub fn calculate_score(&self, block_hash: &BlockHash) -> Score {
        score_for(&self.outpoint, block_hash)
    }

    /// Collateral age in blocks at the current tip
    pub fn collateral_age(&self, chain: &dyn ChainView) -> Option<u64> {
        let tip = chain.tip_height()?;
        let height = match self.collateral_height {
            Some(h) => h,
            None => chain.utxo(&self.outpoint)?.height,
        };
        Some(tip.saturating_sub(height))
    }

    /// Walk recent blocks looking for a coinbase that paid this record
    pub fn update_last_paid<F>(
        &mut self,
        chain: &dyn ChainView,
        max_blocks_back: u64,
        payment_at: F,
    ) where
        F: Fn(u64, &PayScript) -> Option<i64>,
    {
        let Some(tip) = chain.tip_height() else {
            return;
        };
        let payee = self.payee_script();
        let floor = tip.saturating_sub(max_blocks_back);
        let mut height = tip;
        while height > self.last_paid_block && height >= floor {
            if let Some(block_time) = payment_at(height, &payee) {
                debug!(servicenode = %self.outpoint, height, "found payment");
                self.last_paid_block = height;
                self.last_paid_time = block_time;
                return;
            }
            if height == 0 {
                break;
            }
            height -= 1;
        }
    }

    /// Evaluate the state machine. Throttled to every `CHECK_SECONDS`
    /// unless forced.
    pub fn check(&mut self, ctx: &CheckContext<'_>, force: bool) {
        if !force && ctx.now - self.last_checked < CHECK_SECONDS {
            return;
        }
        self.last_checked = ctx.now;

        // once spent, stop doing the checks
        if self.is_outpoint_spent() {
            return;
        }

        if ctx.chain.utxo(&self.outpoint).is_none() {
            self.set_state(NodeState::OutpointSpent);
            return;
        }
        let height = ctx.chain.tip_height().unwrap_or(0);

        if self.is_pose_banned() {
            if height < self.pose_ban_height {
                return;
            }
            // ban lifted; the record starts on the edge and is banned back
            // easily if it keeps failing verification
            debug!(servicenode = %self.outpoint, "pose ban lifted");
            self.decrease_pose_score();
        } else if self.pose_score >= POSE_BAN_MAX_SCORE {
            self.set_state(NodeState::PoseBan);
            // ban for the whole payment cycle
            self.pose_ban_height = height + ctx.registry_size as u64;
            debug!(
                servicenode = %self.outpoint,
                until = self.pose_ban_height,
                "pose banned"
            );
            return;
        }

        if self.protocol_version < ctx.min_protocol {
            self.set_state(NodeState::UpdateRequired);
            return;
        }

        // keep old records around while the list is still syncing, giving
        // them a chance to receive updates
        let wait_for_ping = !ctx.list_synced && !self.is_pinged_within(MIN_PING_SECONDS, ctx.now);
        if wait_for_ping && !ctx.our_node {
            if self.is_expired() || self.is_watchdog_expired() || self.is_new_start_required() {
                return;
            }
        }

        if !wait_for_ping || ctx.our_node {
            if !self.is_pinged_within(NEW_START_REQUIRED_SECONDS, ctx.now) {
                self.set_state(NodeState::NewStartRequired);
                return;
            }

            let watchdog_expired = ctx.watchdog_active
                && ctx.now - self.last_watchdog_vote > WATCHDOG_MAX_SECONDS;
            if watchdog_expired {
                self.set_state(NodeState::WatchdogExpired);
                return;
            }

            if !self.is_pinged_within(EXPIRATION_SECONDS, ctx.now) {
                self.set_state(NodeState::Expired);
                return;
            }
        }

        let ping_age = self
            .last_ping
            .as_ref()
            .map(|p| p.sign_time - self.announce_time)
            .unwrap_or(0);
        if ping_age < MIN_PING_SECONDS {
            self.set_state(NodeState::PreEnabled);
            return;
        }

        self.set_state(NodeState::Enabled);
    }

    fn set_state(&mut self, state: NodeState) {
        if self.state != state {
            debug!(servicenode = %self.outpoint, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }
}

/// Score an outpoint against a block hash
pub fn score_for(outpoint: &OutPoint, block_hash: &BlockHash) -> Score {
    let aux = add_u32(outpoint.txid.as_bytes(), outpoint.index);
    let base = meridian_crypto::hash256(block_hash.as_bytes());
    let mut salted_input = Vec::with_capacity(64);
    salted_input.extend_from_slice(block_hash.as_bytes());
    salted_input.extend_from_slice(&aux);
    let salted = meridian_crypto::hash256(&salted_input);
    Score(Hash256(abs_diff(&salted, &base)))
}
