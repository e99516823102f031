//! Per-network chain and overlay parameters

use crate::types::{Amount, COIN};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(s)
    }
}

/// Parameters the overlay consumes from chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    pub network: Network,
    /// Default p2p port for this network
    pub default_port: u16,
    /// Exact UTXO value a service-node collateral must carry
    pub collateral_amount: Amount,
    /// Confirmations a collateral needs before a record is accepted
    pub min_collateral_confirmations: u64,
    /// Minimum peer protocol version accepted by default
    pub min_protocol_version: u32,
    /// Protocol version this build speaks
    pub protocol_version: u32,
    /// Hex-encoded master public key that signs kill-switch updates
    pub spork_pubkey: String,
}

/// The mainnet p2p port; service nodes must use it on mainnet and must not
/// use it anywhere else.
pub const MAINNET_DEFAULT_PORT: u16 = 29100;

pub const PROTOCOL_VERSION: u32 = 70213;
pub const MIN_PEER_PROTO_VERSION: u32 = 70210;

impl Params {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Mainnet => Self {
                network,
                default_port: MAINNET_DEFAULT_PORT,
                collateral_amount: 1000 * COIN,
                min_collateral_confirmations: 15,
                min_protocol_version: MIN_PEER_PROTO_VERSION,
                protocol_version: PROTOCOL_VERSION,
                spork_pubkey: String::new(),
            },
            // Testnet params were never pinned upstream; the port moves off
            // the mainnet default and everything else follows mainnet.
            Network::Testnet => Self {
                network,
                default_port: 39100,
                collateral_amount: 1000 * COIN,
                min_collateral_confirmations: 15,
                min_protocol_version: MIN_PEER_PROTO_VERSION,
                protocol_version: PROTOCOL_VERSION,
                spork_pubkey: String::new(),
            },
            Network::Regtest => Self {
                network,
                default_port: 49100,
                collateral_amount: 1000 * COIN,
                min_collateral_confirmations: 1,
                min_protocol_version: MIN_PEER_PROTO_VERSION,
                protocol_version: PROTOCOL_VERSION,
                spork_pubkey: String::new(),
            },
        }
    }

    pub fn with_spork_pubkey(mut self, pubkey_hex: impl Into<String>) -> Self {
        self.spork_pubkey = pubkey_hex.into();
        self
    }

    /// Block subsidy at a height, halving every 840_000 blocks
    pub fn block_subsidy(&self, height: u64) -> Amount {
        let halvings = height / 840_000;
        if halvings >= 64 {
            return 0;
        }
        (25 * COIN) >> halvings
    }

    /// Portion of the coinbase owed to the elected service node
    pub fn servicenode_payment(&self, height: u64) -> Amount {
        self.block_subsidy(height) * 3 / 10
    }

    /// Port policy: the mainnet port on mainnet, anything else elsewhere
    pub fn port_allowed(&self, port: u16) -> bool {
        match self.network {
            Network::Mainnet => port == MAINNET_DEFAULT_PORT,
            _ => port != MAINNET_DEFAULT_PORT,
        }
    }
}
