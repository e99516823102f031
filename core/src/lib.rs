//! Meridian core primitives
//!
//! Shared building blocks for the service-node overlay: hash and outpoint
//! types, per-network parameters, 256-bit score arithmetic, the chain view
//! the overlay reads the blockchain through, and the clock / sync-state
//! abstractions every subsystem consumes.

pub mod arith;
pub mod chain;
pub mod clock;
pub mod params;
pub mod sync_flags;
pub mod types;

pub use chain::{ChainState, ChainView, Utxo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use params::{Network, Params};
pub use sync_flags::{SyncAsset, SyncFlags};
pub use types::{Amount, BlockHash, Hash256, OutPoint, PayScript, Transaction, TxId, TxOut, COIN};
