//! Wire protocol for the service-node overlay
//!
//! One envelope enum per network command, serialized with serde_json like
//! the rest of the node's p2p surface. Transport (connections, inventory
//! relay, getdata plumbing) lives outside the overlay; peers hand decoded
//! messages to the dispatcher and take outbound messages from `Outbound`.

use crate::announce::Announcement;
use crate::payments::PaymentVote;
use crate::ping::Ping;
use crate::spork::SporkMessage;
use crate::verification::Verification;
use meridian_core::{BlockHash, Hash256, OutPoint};
use serde::{Deserialize, Serialize};

/// Inventory type ids carried alongside relayed overlay objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Announce,
    Ping,
    PaymentVote,
    PaymentBlock,
    Verify,
}

/// Inventory reference: type plus object hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvType,
    pub hash: Hash256,
}

/// Overlay network message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// MNANNOUNCE: full service-node record
    Announce(Announcement),
    /// MNPING: liveness ping
    Ping(Ping),
    /// DSEG: list request; `None` asks for the full list
    Dseg(Option<OutPoint>),
    /// MNVERIFY: proof-of-service challenge / reply / broadcast
    Verify(Verification),
    /// MNWPAYMENTVOTE: payment vote
    PaymentVote(PaymentVote),
    /// MNWPAYMENTSYNC: vote-count hint requesting a payment sync
    PaymentSync(u32),
    /// Batched ask for vote data on specific payment blocks
    GetPaymentBlocks(Vec<BlockHash>),
    /// SPORK: kill-switch update
    Spork(SporkMessage),
    /// GETSPORKS: request the current kill-switch set
    GetSporks,
    /// SYNCSTATUSCOUNT: progress hint (asset code, item count)
    SyncStatusCount { asset: u32, count: u32 },
}

impl OverlayMessage {
    /// Wire command name
    pub fn command(&self) -> &'static str {
        match self {
            OverlayMessage::Announce(_) => "mnannounce",
            OverlayMessage::Ping(_) => "mnping",
            OverlayMessage::Dseg(_) => "dseg",
            OverlayMessage::Verify(_) => "mnverify",
            OverlayMessage::PaymentVote(_) => "mnwpaymentvote",
            OverlayMessage::PaymentSync(_) => "mnwpaymentsync",
            OverlayMessage::GetPaymentBlocks(_) => "getmnwblocks",
            OverlayMessage::Spork(_) => "spork",
            OverlayMessage::GetSporks => "getsporks",
            OverlayMessage::SyncStatusCount { .. } => "ssc",
        }
    }

    /// Inventory reference for relayable messages
    pub fn inv(&self) -> Option<Inv> {
        let inv = match self {
            OverlayMessage::Announce(a) => Inv {
                kind: InvType::Announce,
                hash: a.hash(),
            },
            OverlayMessage::Ping(p) => Inv {
                kind: InvType::Ping,
                hash: p.hash(),
            },
            OverlayMessage::PaymentVote(v) => Inv {
                kind: InvType::PaymentVote,
                hash: v.hash(),
            },
            OverlayMessage::Verify(v) => Inv {
                kind: InvType::Verify,
                hash: v.hash(),
            },
            _ => return None,
        };
        Some(inv)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| e.to_string())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(data).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dseg_round_trip() {
        let msg = OverlayMessage::Dseg(None);
        let bytes = msg.serialize().unwrap();
        let back = OverlayMessage::deserialize(&bytes).unwrap();
        assert!(matches!(back, OverlayMessage::Dseg(None)));
        assert_eq!(msg.command(), "dseg");
    }

    #[test]
    fn sync_status_count_round_trip() {
        let msg = OverlayMessage::SyncStatusCount {
            asset: 2,
            count: 41,
        };
        let back = OverlayMessage::deserialize(&msg.serialize().unwrap()).unwrap();
        match back {
            OverlayMessage::SyncStatusCount { asset, count } => {
                assert_eq!(asset, 2);
                assert_eq!(count, 41);
            }
            other => panic!("unexpected message {:?}", other.command()),
        }
    }
}
