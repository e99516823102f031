//! Meridian service-node overlay
//!
//! The peer-to-peer subsystem in which full nodes commit a fixed on-chain
//! collateral to become service nodes: they gossip a registry of records,
//! verify each other (proof of service), vote on which node each upcoming
//! block pays, and bootstrap all of that state from peers in stages.
//!
//! The blockchain engine, wallet and p2p transport are external
//! collaborators reached through `meridian_core::ChainView`,
//! [`active::WalletBridge`] and [`outbound::Outbound`].

pub mod active;
pub mod announce;
pub mod config;
pub mod context;
pub mod error;
pub mod fulfilled;
pub mod manager;
pub mod message;
pub mod node;
pub mod outbound;
pub mod payments;
pub mod ping;
pub mod spork;
pub mod store;
pub mod sync;
pub mod verification;

pub use active::{ActiveIdentity, ActiveServiceNode, ActiveState, WalletBridge};
pub use announce::Announcement;
pub use context::{OverlayContext, ServiceNodeSettings};
pub use error::{OverlayError, Result};
pub use fulfilled::FulfilledRequestCache;
pub use manager::ServiceNodeManager;
pub use message::{Inv, InvType, OverlayMessage};
pub use node::{NodeState, ServiceNode};
pub use outbound::{Outbound, PeerInfo};
pub use payments::{PaymentManager, PaymentVote};
pub use ping::Ping;
pub use spork::{SporkManager, SporkMessage};
pub use sync::SyncCoordinator;
pub use verification::{PoseVerifier, Verification};
